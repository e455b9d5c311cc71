//! Execution backend contract driven by the supervisor.

use async_trait::async_trait;
use gpulend_ledger::{JobId, ResourceUsage};
use serde::{Deserialize, Serialize};

use super::archive::Artifact;
use super::error::SandboxResult;
use crate::config::{NetworkPolicy, SupervisorConfig};
use crate::domain::{PayloadRef, ResourceRequirement};

/// Label key set on every sandbox so orphans can be found after a restart.
pub const JOB_LABEL: &str = "gpulend.job";

/// Resource ceiling promised at accept time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub vram_mb: u64,
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub pids: u32,
}

impl SandboxLimits {
    pub fn from_requirement(req: &ResourceRequirement, pids: u32) -> Self {
        Self {
            vram_mb: req.min_vram_mb,
            cpu_cores: req.cpu_cores,
            memory_mb: req.memory_mb,
            pids,
        }
    }

    /// Describe the first ceiling `usage` breaks, if any. A zero VRAM limit
    /// means the job asked for no GPU memory at all.
    pub fn violation(&self, usage: &ResourceUsage) -> Option<String> {
        if usage.peak_vram_mb > self.vram_mb {
            return Some(format!(
                "vram {} MB exceeds promised {} MB",
                usage.peak_vram_mb, self.vram_mb
            ));
        }
        if let Some(mem) = self.memory_mb {
            if usage.peak_memory_mb > mem {
                return Some(format!(
                    "memory {} MB exceeds promised {} MB",
                    usage.peak_memory_mb, mem
                ));
            }
        }
        None
    }
}

/// Everything a backend needs to build one job's sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub job_id: JobId,
    pub image: String,
    pub command: Option<String>,
    /// Blob staged into `/workspace` before start.
    pub blob_uri: Option<String>,
    pub limits: SandboxLimits,
    pub network: NetworkPolicy,
    pub gpus: bool,
}

impl SandboxSpec {
    pub fn for_job(
        job_id: JobId,
        payload: &PayloadRef,
        requirement: &ResourceRequirement,
        config: &SupervisorConfig,
    ) -> Self {
        let (image, command, blob_uri) = match payload {
            PayloadRef::Image { image, command } => (image.clone(), command.clone(), None),
            PayloadRef::Blob { uri, command } => (
                config.default_image.clone(),
                Some(command.clone()),
                Some(uri.clone()),
            ),
        };
        Self {
            job_id,
            image,
            command,
            blob_uri,
            limits: SandboxLimits::from_requirement(requirement, config.pids_limit),
            network: config.network,
            gpus: config.enable_gpus && requirement.min_vram_mb > 0,
        }
    }

    pub fn name(&self) -> String {
        sandbox_name(&self.job_id)
    }
}

pub fn sandbox_name(job_id: &JobId) -> String {
    format!("gpulend-{job_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub job_id: JobId,
}

/// How a sandboxed process ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxExit {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Packed workspace, when the backend keeps one.
    pub artifact: Option<Artifact>,
    /// The runtime killed the process for exceeding its memory limit.
    pub oom_killed: bool,
}

impl SandboxExit {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.oom_killed
    }
}

/// Point-in-time resource sample of a running sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub usage: ResourceUsage,
    /// The sandbox may have touched state outside itself.
    pub side_effects: bool,
    /// False when `usage.peak_vram_mb` could not be measured.
    pub vram_monitored: bool,
}

/// Narrow contract to a container runtime. `teardown` must be safe on an
/// already torn-down handle.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn create_sandbox(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle>;

    async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()>;

    /// Resolve when the sandboxed process exits (including after `kill`).
    async fn wait(&self, handle: &SandboxHandle) -> SandboxResult<SandboxExit>;

    async fn status(&self, handle: &SandboxHandle) -> SandboxResult<SandboxStatus>;

    async fn kill(&self, handle: &SandboxHandle) -> SandboxResult<()>;

    async fn teardown(&self, handle: &SandboxHandle) -> SandboxResult<()>;

    /// Every sandbox this backend created that still exists, including ones
    /// left by a previous process.
    async fn list_sandboxes(&self) -> SandboxResult<Vec<SandboxHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_payload_runs_in_default_image() {
        let cfg = SupervisorConfig::default();
        let spec = SandboxSpec::for_job(
            JobId::from("j1"),
            &PayloadRef::Blob {
                uri: "/tmp/job".into(),
                command: "python main.py".into(),
            },
            &ResourceRequirement::vram(2_048),
            &cfg,
        );
        assert_eq!(spec.image, "python:3.12-slim");
        assert_eq!(spec.blob_uri.as_deref(), Some("/tmp/job"));
        assert!(spec.gpus);
        assert_eq!(spec.limits.pids, 128);
        assert_eq!(spec.name(), "gpulend-j1");
    }

    #[test]
    fn cpu_only_job_gets_no_gpus() {
        let spec = SandboxSpec::for_job(
            JobId::from("j2"),
            &PayloadRef::image("alpine"),
            &ResourceRequirement::default(),
            &SupervisorConfig::default(),
        );
        assert!(!spec.gpus);
        assert_eq!(spec.command, None);
    }

    #[test]
    fn violation_reports_first_breach() {
        let limits = SandboxLimits {
            vram_mb: 4_000,
            cpu_cores: None,
            memory_mb: Some(1_000),
            pids: 128,
        };
        let ok = ResourceUsage {
            peak_vram_mb: 4_000,
            peak_memory_mb: 900,
            cpu_time_ms: 0,
        };
        assert_eq!(limits.violation(&ok), None);
        let vram = ResourceUsage {
            peak_vram_mb: 4_001,
            ..ok
        };
        assert!(limits.violation(&vram).unwrap().contains("vram"));
        let mem = ResourceUsage {
            peak_memory_mb: 1_001,
            ..ok
        };
        assert!(limits.violation(&mem).unwrap().contains("memory"));
    }
}
