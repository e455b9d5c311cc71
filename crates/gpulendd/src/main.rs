//! gpulendd - GPULend node daemon
//!
//! Runs one GPULend node: answers the peer protocol on `/v1/envelope`,
//! advertises local capability to known peers, executes accepted jobs in
//! sandboxes, and serves the local control API used by the `gpulend` CLI.

mod api;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gpulend_core::fakes::FakeBackend;
use gpulend_core::{
    CapabilityProbe, HttpTransport, Ledger, MemoryLedger, Node, NodeConfig, NodeParts,
    NvidiaSmiProbe, PeerIdentity, PodmanBackend, SandboxBackend, StaticProbe, SurrealLedger,
};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "gpulendd")]
#[command(author = "GPULend")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "GPULend node daemon", long_about = None)]
struct Cli {
    /// Node configuration file (JSON). Flags override its values.
    #[arg(short, long, env = "GPULEND_CONFIG")]
    config: Option<PathBuf>,

    /// Socket address to bind
    #[arg(long, env = "GPULEND_LISTEN")]
    listen: Option<String>,

    /// Address other peers use to reach this node
    #[arg(long, env = "GPULEND_ADVERTISE")]
    advertise: Option<String>,

    /// Bootstrap peer address (repeat or comma-separate)
    #[arg(long, env = "GPULEND_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Identity seed file written by `gpulend keygen`
    #[arg(long, env = "GPULEND_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// On-disk ledger directory (in-memory when unset)
    #[arg(long, env = "GPULEND_LEDGER")]
    ledger: Option<PathBuf>,

    /// Execute jobs in an in-process fake sandbox instead of podman
    #[arg(long, env = "GPULEND_FAKE_SANDBOX")]
    fake_sandbox: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gpulend_core::init_tracing(cli.json, level)?;

    let config = load_config(&cli)?;
    let parts = build_parts(&config, cli.fake_sandbox).await?;
    let listen = config.listen.clone();

    let node = Arc::new(
        Node::start(config, parts)
            .await
            .context("Failed to start node")?,
    );
    let recovery = node.recovery();
    if recovery.sandboxes_removed > 0 || recovery.executions_closed > 0 {
        tracing::warn!(
            sandboxes_removed = recovery.sandboxes_removed,
            executions_closed = recovery.executions_closed,
            "cleaned up after previous run"
        );
    }

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    tracing::info!(listen = %listen, version = gpulend_core::VERSION, "gpulendd listening");

    axum::serve(listener, api::router(Arc::clone(&node)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    node.shutdown().await;
    Ok(())
}

/// Config file (or defaults) with flag and env overrides applied.
fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    match &cli.advertise {
        Some(advertise) => config.advertise = advertise.clone(),
        // Keep the advertised port in step with an overridden listen address.
        None if cli.listen.is_some() && cli.config.is_none() => {
            config.advertise = format!("http://{}", config.listen);
        }
        None => {}
    }
    if !cli.bootstrap.is_empty() {
        config.bootstrap = cli.bootstrap.clone();
    }
    if cli.key_file.is_some() {
        config.key_file = cli.key_file.clone();
    }
    if cli.ledger.is_some() {
        config.ledger.path = cli.ledger.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn build_parts(config: &NodeConfig, fake_sandbox: bool) -> Result<NodeParts> {
    let identity = PeerIdentity::load_or_generate(config.key_file.as_deref())
        .context("Failed to load node identity")?;

    let transport = Arc::new(
        HttpTransport::new(config.transport_timeout()).context("Failed to build HTTP client")?,
    );

    let backend: Arc<dyn SandboxBackend> = if fake_sandbox {
        tracing::warn!("using the fake sandbox; jobs are not actually executed");
        let root = config
            .supervisor
            .workdir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join("gpulend-fake");
        Arc::new(FakeBackend::default().with_workspaces(root))
    } else {
        Arc::new(PodmanBackend::new(config.supervisor.workdir.clone()))
    };

    let probe: Arc<dyn CapabilityProbe> = match &config.probe.fixed {
        Some(fixed) => Arc::new(StaticProbe::from_config(fixed)),
        None => Arc::new(NvidiaSmiProbe),
    };

    let ledger: Arc<dyn Ledger> = match &config.ledger.path {
        Some(path) => Arc::new(
            SurrealLedger::open(path)
                .await
                .with_context(|| format!("Failed to open ledger at {}", path.display()))?,
        ),
        None => Arc::new(MemoryLedger::new()),
    };

    Ok(NodeParts {
        identity,
        transport,
        backend,
        probe,
        ledger,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("gpulendd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn listen_override_moves_advertised_address() {
        let config = load_config(&parse(&["--listen", "0.0.0.0:9000"])).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.advertise, "http://0.0.0.0:9000");
    }

    #[test]
    fn explicit_advertise_wins() {
        let config = load_config(&parse(&[
            "--listen",
            "0.0.0.0:9000",
            "--advertise",
            "http://10.0.0.7:9000",
            "--bootstrap",
            "http://10.0.0.1:7070,http://10.0.0.2:7070",
        ]))
        .unwrap();
        assert_eq!(config.advertise, "http://10.0.0.7:9000");
        assert_eq!(config.bootstrap.len(), 2);
    }

    #[test]
    fn file_values_survive_without_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"listen":"127.0.0.1:7171","advertise":"http://node-a:7171","dispatch":{"offer_timeout_ms":800}}"#,
        )
        .unwrap();
        let config = load_config(&parse(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.advertise, "http://node-a:7171");
        assert_eq!(config.dispatch.offer_timeout_ms, 800);
    }

    #[test]
    fn invalid_config_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"transport_timeout_ms":0}"#).unwrap();
        assert!(load_config(&parse(&["--config", path.to_str().unwrap()])).is_err());
    }
}
