//! Node configuration: JSON file plus flag/env overrides applied by the
//! binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gpulend_ledger::JobId;
use serde::{Deserialize, Serialize};

/// Upper bound for `supervisor.report_attempts`.
pub const MAX_REPORT_ATTEMPTS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Socket address the daemon binds.
    pub listen: String,
    /// Address other peers use to reach this node.
    pub advertise: String,
    /// Peers announced to before anything else is known.
    pub bootstrap: Vec<String>,
    pub key_file: Option<PathBuf>,
    /// Per-call timeout for outbound peer messages.
    pub transport_timeout_ms: u64,
    /// Inbound envelopes stamped further than this from local time are
    /// rejected.
    pub max_clock_skew_ms: u64,
    pub registry: RegistryConfig,
    pub dispatch: DispatchConfig,
    pub supervisor: SupervisorConfig,
    pub ledger: LedgerConfig,
    pub probe: ProbeConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7070".to_string(),
            advertise: "http://127.0.0.1:7070".to_string(),
            bootstrap: Vec::new(),
            key_file: None,
            transport_timeout_ms: 5_000,
            max_clock_skew_ms: 30_000,
            registry: RegistryConfig::default(),
            dispatch: DispatchConfig::default(),
            supervisor: SupervisorConfig::default(),
            ledger: LedgerConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn max_clock_skew(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.max_clock_skew_ms).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("transport_timeout_ms", self.transport_timeout_ms),
            ("max_clock_skew_ms", self.max_clock_skew_ms),
            ("registry.heartbeat_interval_ms", self.registry.heartbeat_interval_ms),
            ("registry.archival_timeout_ms", self.registry.archival_timeout_ms),
            ("dispatch.offer_timeout_ms", self.dispatch.offer_timeout_ms),
            ("dispatch.progress_timeout_ms", self.dispatch.progress_timeout_ms),
            ("supervisor.progress_interval_ms", self.supervisor.progress_interval_ms),
            ("supervisor.monitor_interval_ms", self.supervisor.monitor_interval_ms),
            ("supervisor.start_timeout_ms", self.supervisor.start_timeout_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.registry.liveness_timeout() > self.registry.archival_timeout() {
            return Err(ConfigError::Invalid(
                "registry liveness timeout exceeds archival timeout".into(),
            ));
        }
        if !(1..=MAX_REPORT_ATTEMPTS).contains(&self.supervisor.report_attempts) {
            return Err(ConfigError::Invalid(format!(
                "supervisor.report_attempts must be between 1 and {MAX_REPORT_ATTEMPTS}"
            )));
        }
        if self.max_clock_skew_ms >= self.registry.archival_timeout_ms {
            return Err(ConfigError::Invalid(
                "max_clock_skew_ms must be shorter than registry.archival_timeout_ms".into(),
            ));
        }
        if self.dispatch.progress_timeout_ms <= self.supervisor.progress_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "dispatch.progress_timeout_ms ({}) must exceed supervisor.progress_interval_ms ({})",
                self.dispatch.progress_timeout_ms, self.supervisor.progress_interval_ms
            )));
        }
        if self.advertise.is_empty() {
            return Err(ConfigError::Invalid("advertise address is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_interval_ms: u64,
    /// Defaults to three heartbeat intervals.
    pub liveness_timeout_ms: Option<u64>,
    pub archival_timeout_ms: u64,
    /// Send a full capability report every N reporter ticks even if unchanged.
    pub full_report_every: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            liveness_timeout_ms: None,
            archival_timeout_ms: 600_000,
            full_report_every: 12,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(
            self.liveness_timeout_ms
                .unwrap_or(self.heartbeat_interval_ms.saturating_mul(3)),
        )
    }

    pub fn archival_timeout(&self) -> Duration {
        Duration::from_millis(self.archival_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub offer_timeout_ms: u64,
    /// Added to the job's time budget to form the watchdog deadline.
    pub watchdog_grace_ms: u64,
    /// Progress silence after which the executor is considered lost.
    pub progress_timeout_ms: u64,
    pub max_decline_retries: u32,
    pub max_peer_lost_redispatch: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            offer_timeout_ms: 5_000,
            watchdog_grace_ms: 30_000,
            progress_timeout_ms: 10_000,
            max_decline_retries: 3,
            max_peer_lost_redispatch: 1,
        }
    }
}

impl DispatchConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms)
    }

    pub fn progress_timeout(&self) -> Duration {
        Duration::from_millis(self.progress_timeout_ms)
    }
}

/// Container network mode for sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    #[default]
    None,
    Slirp4netns,
    Bridge,
}

impl NetworkPolicy {
    pub fn as_podman_arg(&self) -> &'static str {
        match self {
            NetworkPolicy::None => "none",
            NetworkPolicy::Slirp4netns => "slirp4netns",
            NetworkPolicy::Bridge => "bridge",
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self, NetworkPolicy::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_concurrent_jobs: u32,
    pub progress_interval_ms: u64,
    pub monitor_interval_ms: u64,
    /// Accepted jobs not started within this window lose their reservation.
    pub start_timeout_ms: u64,
    pub max_log_bytes: usize,
    pub default_image: String,
    pub pids_limit: u32,
    pub network: NetworkPolicy,
    pub enable_gpus: bool,
    /// Parent directory for sandbox workspaces; system temp dir when unset.
    pub workdir: Option<PathBuf>,
    pub report_attempts: u32,
    pub report_backoff_ms: u64,
    /// Packed workspaces kept for download; the oldest is deleted first.
    pub max_artifacts: usize,
    /// Base URL artifacts are served under, filled in from `advertise`.
    #[serde(skip)]
    pub artifact_base_url: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            progress_interval_ms: 2_000,
            monitor_interval_ms: 1_000,
            start_timeout_ms: 30_000,
            max_log_bytes: 200_000,
            default_image: "python:3.12-slim".to_string(),
            pids_limit: 128,
            network: NetworkPolicy::None,
            enable_gpus: true,
            workdir: None,
            report_attempts: 3,
            report_backoff_ms: 200,
            max_artifacts: 32,
            artifact_base_url: None,
        }
    }
}

impl SupervisorConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn artifact_url(&self, job_id: &JobId) -> Option<String> {
        self.artifact_base_url
            .as_deref()
            .map(|base| format!("{}/v1/artifacts/{job_id}", base.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// On-disk ledger directory; in-memory when unset.
    pub path: Option<PathBuf>,
}

/// Fixed capability values used instead of probing hardware.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticCapability {
    pub gpu_model: String,
    pub vram_total_mb: u64,
    pub vram_free_mb: u64,
    pub compute_units: u32,
    pub cpu_cores: u32,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// When set, hardware probing is skipped.
    pub fixed: Option<StaticCapability>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = NodeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.registry.liveness_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.dispatch.max_decline_retries, 3);
        assert_eq!(cfg.supervisor.default_image, "python:3.12-slim");
    }

    #[test]
    fn progress_timeout_must_exceed_ping_interval() {
        let mut cfg = NodeConfig::default();
        cfg.dispatch.progress_timeout_ms = 2_000;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("progress_timeout_ms"));
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.registry.heartbeat_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn clock_skew_must_stay_below_archival() {
        let mut cfg = NodeConfig::default();
        assert_eq!(cfg.max_clock_skew(), chrono::Duration::seconds(30));
        cfg.max_clock_skew_ms = cfg.registry.archival_timeout_ms;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_clock_skew_ms"));
    }

    #[test]
    fn report_attempts_are_bounded() {
        let mut cfg = NodeConfig::default();
        cfg.supervisor.report_attempts = 0;
        assert!(cfg.validate().is_err());
        cfg.supervisor.report_attempts = MAX_REPORT_ATTEMPTS + 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("report_attempts"));
        cfg.supervisor.report_attempts = MAX_REPORT_ATTEMPTS;
        cfg.validate().unwrap();
    }

    #[test]
    fn artifact_urls_hang_off_the_advertised_base() {
        let mut cfg = SupervisorConfig::default();
        assert_eq!(cfg.artifact_url(&JobId::from("j1")), None);
        cfg.artifact_base_url = Some("http://10.0.0.2:7070/".into());
        assert_eq!(
            cfg.artifact_url(&JobId::from("j1")).as_deref(),
            Some("http://10.0.0.2:7070/v1/artifacts/j1")
        );
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("artifact_base_url"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"advertise":"http://10.0.0.2:7070","dispatch":{"max_decline_retries":5},"supervisor":{"network":"slirp4netns"}}"#,
        )
        .unwrap();
        let cfg = NodeConfig::from_file(&path).unwrap();
        assert_eq!(cfg.advertise, "http://10.0.0.2:7070");
        assert_eq!(cfg.dispatch.max_decline_retries, 5);
        assert_eq!(cfg.dispatch.offer_timeout_ms, 5_000);
        assert_eq!(cfg.supervisor.network, NetworkPolicy::Slirp4netns);
    }

    #[test]
    fn unreadable_file_names_path() {
        let err = NodeConfig::from_file(Path::new("/nonexistent/gpulend.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/gpulend.json"));
    }
}
