//! Log subscriber setup shared by `gpulendd` and `gpulend`.
//!
//! Without `RUST_LOG`, GPULend's own crates log at the requested level and
//! everything else (surrealdb, hyper, reqwest) stays at `warn`. A malformed
//! `RUST_LOG` is an error rather than a silent fallback.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Targets that follow the requested level.
const OWN_TARGETS: [&str; 4] = ["gpulend_core", "gpulend_ledger", "gpulendd", "gpulend"];

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid RUST_LOG directive {directives:?}: {reason}")]
    InvalidFilter { directives: String, reason: String },

    #[error("log subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Default directives for `level`: own crates at `level`, the rest at warn.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(OWN_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.join(",")
}

/// Filter from an explicit `RUST_LOG` value when present, otherwise from
/// [`default_directives`].
pub fn build_filter(rust_log: Option<&str>, level: Level) -> Result<EnvFilter, TelemetryError> {
    let directives = match rust_log.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => d.to_string(),
        None => default_directives(level),
    };
    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::InvalidFilter {
        reason: e.to_string(),
        directives,
    })
}

/// Install the global subscriber. `json` switches to newline-delimited JSON.
pub fn init_tracing(json: bool, level: Level) -> Result<(), TelemetryError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(rust_log.as_deref(), level)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    installed.map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}
