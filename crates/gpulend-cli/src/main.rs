//! gpulend - GPULend operator CLI
//!
//! Talks to a running `gpulendd` over its control API.
//!
//! ## Commands
//!
//! - `submit`: Broker a job to the best matching peer
//! - `status` / `wait` / `cancel`: Follow or stop a submitted job
//! - `fetch`: Download a finished job's workspace archive
//! - `jobs`, `peers`, `ledger`: Inspect the daemon's view of the network
//! - `probe`: Show this host's capability
//! - `keygen`: Create a node identity file

mod client;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gpulend_core::domain::api::{LedgerView, PeerView, SubmitJob};
use gpulend_core::{
    Capability, CapabilityProbe, JobId, JobSession, NvidiaSmiProbe, PayloadRef, PeerIdentity,
    ResourceRequirement,
};
use serde::Serialize;
use tracing::Level;

use client::DaemonClient;

#[derive(Parser)]
#[command(name = "gpulend")]
#[command(author = "GPULend")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Peer-to-peer GPU time sharing", long_about = None)]
struct Cli {
    /// Control API of the local daemon
    #[arg(long, global = true, env = "GPULEND_DAEMON", default_value = "http://127.0.0.1:7070")]
    daemon: String,

    /// Result format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Submit {
        /// Container image to run
        #[arg(long, conflicts_with = "blob")]
        image: Option<String>,

        /// File, directory or URL mounted at /workspace and run in the default image
        #[arg(long)]
        blob: Option<String>,

        /// Command to run (required with --blob)
        #[arg(long)]
        command: Option<String>,

        /// Minimum free VRAM in MiB
        #[arg(long, default_value = "0")]
        min_vram_mb: u64,

        /// Minimum GPU compute units
        #[arg(long, default_value = "0")]
        min_compute: u32,

        /// CPU cores to reserve
        #[arg(long)]
        cpus: Option<u32>,

        /// Memory to reserve in MiB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Hard time budget in seconds
        #[arg(long, default_value = "3600")]
        budget_secs: u64,

        /// Block until the job finishes
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a job's state and transitions
    Status {
        job_id: String,
    },

    /// Block until a job finishes
    Wait {
        job_id: String,

        /// Polling interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },

    /// Cancel a job
    Cancel {
        job_id: String,
    },

    /// Download a finished job's workspace as a zip
    Fetch {
        job_id: String,

        /// Where to write the archive (defaults to <job id>.zip)
        #[arg(short = 'O', long = "out")]
        out: Option<PathBuf>,
    },

    /// List jobs submitted through this daemon
    Jobs,

    /// List peers in the daemon's registry
    Peers,

    /// Show recent ledger entries and totals
    Ledger {
        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show the capability of this host (or the daemon with --remote)
    Probe {
        #[arg(long)]
        remote: bool,
    },

    /// Create a node identity file
    Keygen {
        /// Where to write the seed
        #[arg(long)]
        out: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    gpulend_core::init_tracing(cli.json, level)?;

    let out = cli.output;
    match cli.command {
        Commands::Submit {
            image,
            blob,
            command,
            min_vram_mb,
            min_compute,
            cpus,
            memory_mb,
            budget_secs,
            wait,
        } => {
            let payload = payload_from_args(image, blob, command)?;
            let requirement = ResourceRequirement {
                min_vram_mb,
                min_compute_units: min_compute,
                cpu_cores: cpus,
                memory_mb,
            };
            let job = SubmitJob {
                requirement,
                payload,
                time_budget_secs: budget_secs,
            };
            cmd_submit(&connect(&cli.daemon)?, &job, wait, out).await
        }
        Commands::Status { job_id } => cmd_status(&connect(&cli.daemon)?, &JobId(job_id), out).await,
        Commands::Wait { job_id, poll_ms } => {
            cmd_wait(
                &connect(&cli.daemon)?,
                &JobId(job_id),
                Duration::from_millis(poll_ms),
                out,
            )
            .await
        }
        Commands::Cancel { job_id } => cmd_cancel(&connect(&cli.daemon)?, &JobId(job_id), out).await,
        Commands::Fetch { job_id, out: path } => {
            let job_id = JobId(job_id);
            let path = path.unwrap_or_else(|| PathBuf::from(format!("{job_id}.zip")));
            cmd_fetch(&connect(&cli.daemon)?, &job_id, &path).await
        }
        Commands::Jobs => cmd_jobs(&connect(&cli.daemon)?, out).await,
        Commands::Peers => cmd_peers(&connect(&cli.daemon)?, out).await,
        Commands::Ledger { limit } => cmd_ledger(&connect(&cli.daemon)?, limit, out).await,
        Commands::Probe { remote } => {
            let capability = if remote {
                connect(&cli.daemon)?.capability().await?
            } else {
                NvidiaSmiProbe.sample().await
            };
            emit(out, &capability, render_capability)
        }
        Commands::Keygen { out: path, force } => cmd_keygen(&path, force),
    }
}

fn connect(daemon: &str) -> Result<DaemonClient> {
    DaemonClient::new(daemon)
}

fn payload_from_args(
    image: Option<String>,
    blob: Option<String>,
    command: Option<String>,
) -> Result<PayloadRef> {
    match (image, blob) {
        (Some(image), None) => Ok(PayloadRef::Image { image, command }),
        (None, Some(uri)) => match command {
            Some(command) => Ok(PayloadRef::Blob { uri, command }),
            None => bail!("--blob needs --command"),
        },
        (Some(_), Some(_)) => bail!("--image and --blob are mutually exclusive"),
        (None, None) => bail!("one of --image or --blob is required"),
    }
}

/// Print `value` as pretty JSON or through `text`.
fn emit<T: Serialize>(out: OutputFormat, value: &T, text: fn(&T) -> String) -> Result<()> {
    match out {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => print!("{}", text(value)),
    }
    Ok(())
}

/// Submit a job, optionally waiting for its outcome
async fn cmd_submit(client: &DaemonClient, job: &SubmitJob, wait: bool, out: OutputFormat) -> Result<()> {
    let job_id = client
        .submit(job)
        .await
        .with_context(|| format!("Failed to submit {}", job.payload.describe()))?;
    if !wait {
        match out {
            OutputFormat::Json => println!("{}", serde_json::json!({ "job_id": job_id })),
            OutputFormat::Text => println!("{job_id}"),
        }
        return Ok(());
    }
    eprintln!("submitted {job_id}, waiting");
    let session = client.wait(&job_id, Duration::from_secs(1)).await?;
    emit(out, &session, render_session)
}

async fn cmd_status(client: &DaemonClient, job_id: &JobId, out: OutputFormat) -> Result<()> {
    let session = client.status(job_id).await?;
    emit(out, &session, render_session)
}

async fn cmd_wait(client: &DaemonClient, job_id: &JobId, poll: Duration, out: OutputFormat) -> Result<()> {
    let session = client.wait(job_id, poll).await?;
    emit(out, &session, render_session)
}

async fn cmd_cancel(client: &DaemonClient, job_id: &JobId, out: OutputFormat) -> Result<()> {
    let resp = client.cancel(job_id).await?;
    emit(out, &resp, |r| {
        if r.requested {
            format!("cancel requested for {}\n", r.job_id)
        } else {
            format!("{} already finished\n", r.job_id)
        }
    })
}

/// Save the workspace archive a job's executor kept
async fn cmd_fetch(client: &DaemonClient, job_id: &JobId, path: &Path) -> Result<()> {
    let session = client.status(job_id).await?;
    let Some(outcome) = &session.outcome else {
        bail!("job {job_id} has not finished");
    };
    let Some(artifact) = &outcome.artifact else {
        bail!("job {job_id} returned no workspace archive");
    };
    let bytes = client.download(artifact).await?;
    std::fs::write(path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} ({} bytes, sha256 {})", path.display(), bytes.len(), artifact.sha256);
    Ok(())
}

async fn cmd_jobs(client: &DaemonClient, out: OutputFormat) -> Result<()> {
    let jobs = client.jobs().await?;
    emit(out, &jobs, |jobs| {
        if jobs.is_empty() {
            return "No jobs submitted.\n".to_string();
        }
        jobs.iter().map(render_job_line).collect()
    })
}

async fn cmd_peers(client: &DaemonClient, out: OutputFormat) -> Result<()> {
    let peers = client.peers().await?;
    emit(out, &peers, |peers| {
        if peers.is_empty() {
            return "No peers known.\n".to_string();
        }
        peers.iter().map(render_peer_line).collect()
    })
}

async fn cmd_ledger(client: &DaemonClient, limit: usize, out: OutputFormat) -> Result<()> {
    let view = client.ledger(limit).await?;
    emit(out, &view, render_ledger)
}

/// Generate a key pair and store its seed
fn cmd_keygen(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} exists; pass --force to replace it", path.display());
    }
    let identity = PeerIdentity::generate().context("Failed to generate identity")?;
    identity
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{}", identity.peer_id());
    Ok(())
}

fn render_session(s: &JobSession) -> String {
    let mut text = format!(
        "job {}\nstate:   {}\npayload: {}\n",
        s.job_id,
        s.state.as_str(),
        s.request.payload.describe()
    );
    if let Some(peer) = &s.assigned {
        text.push_str(&format!("peer:    {}\n", peer.short()));
    }
    for t in &s.transitions {
        let peer = t.peer.as_ref().map(|p| p.short()).unwrap_or("-");
        text.push_str(&format!(
            "  {} {:<12} {}\n",
            t.at.format("%H:%M:%S%.3f"),
            t.state.as_str(),
            peer
        ));
    }
    if let Some(o) = &s.outcome {
        text.push_str(&format!(
            "outcome: {} after {} ms\n",
            o.outcome.label(),
            o.duration_ms
        ));
        if let Some(reason) = &o.reason {
            text.push_str(&format!("reason:  {reason}\n"));
        }
        if let Some(output) = &o.output_ref {
            text.push_str(&format!("output:  {output}\n"));
        }
        if let Some(artifact) = &o.artifact {
            text.push_str(&format!(
                "archive: {} bytes{}\n",
                artifact.size_bytes,
                if artifact.url.is_some() { ", gpulend fetch to download" } else { "" }
            ));
        }
        if let Some(logs) = &o.logs {
            if !logs.stdout.is_empty() {
                text.push_str(&format!("--- stdout ---\n{}\n", logs.stdout.trim_end()));
            }
            if !logs.stderr.is_empty() {
                text.push_str(&format!("--- stderr ---\n{}\n", logs.stderr.trim_end()));
            }
        }
    }
    text
}

fn render_job_line(s: &JobSession) -> String {
    format!(
        "{}  {:<12} {:<14} {}\n",
        s.job_id,
        s.state.as_str(),
        s.assigned.as_ref().map(|p| p.short()).unwrap_or("-"),
        s.request.payload.describe()
    )
}

fn render_peer_line(p: &PeerView) -> String {
    let c = &p.capability;
    format!(
        "{}  {:<11} {} {:>6}/{:<6} MiB  cu={:<4} slots={}/{}  trust={:.2} fails={}  {}\n",
        p.peer_id.short(),
        if p.reachable { "reachable" } else { "unreachable" },
        if c.gpu_model.is_empty() { "no-gpu" } else { c.gpu_model.as_str() },
        c.vram_free_mb,
        c.vram_total_mb,
        c.compute_units,
        c.free_slots(),
        c.max_concurrent_jobs,
        p.trust_score,
        p.recent_failures,
        p.latency_ms
            .map(|ms| format!("{ms:.0} ms"))
            .unwrap_or_else(|| "-".into())
    )
}

fn render_ledger(v: &LedgerView) -> String {
    let s = &v.summary;
    let mut text = format!(
        "total={} succeeded={} failed={} timed_out={} declined={} peer_lost={} cancelled={}\n",
        s.total, s.succeeded, s.failed, s.timed_out, s.declined, s.peer_lost, s.cancelled
    );
    for e in &v.entries {
        text.push_str(&format!(
            "{}  {}  {:<10} {:<16} {:>8} ms  executor={}\n",
            e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            e.job_id,
            e.outcome.label(),
            e.outcome.error_class().map(|c| c.as_str()).unwrap_or("-"),
            e.duration_ms,
            e.executor.short()
        ));
    }
    text
}

fn render_capability(c: &Capability) -> String {
    format!(
        "gpu:     {}\nvram:    {} / {} MiB free\ncompute: {} units\ncpu:     {} cores\nmemory:  {} / {} MiB free\nsandbox: {}\n",
        if c.gpu_model.is_empty() { "none" } else { c.gpu_model.as_str() },
        c.vram_free_mb,
        c.vram_total_mb,
        c.compute_units,
        c.cpu_cores,
        c.memory_free_mb,
        c.memory_total_mb,
        if c.sandbox_available { "available" } else { "unavailable" }
    )
}
