//! Podman sandbox backend.
//!
//! Each job gets a container named `gpulend-<job id>`, labelled with
//! [`JOB_LABEL`], with privileges dropped and a private temp workspace
//! mounted at `/workspace`. Containers are created, started and waited on as
//! separate steps so the supervisor can sample usage and kill them.
//!
//! Blob payloads are staged into the workspace (zip archives unpacked), a
//! `requirements.txt` is pip-installed ahead of the job command, and on exit
//! the workspace is packed into `<workdir>/gpulend-artifacts/<job id>.zip`.
//! GPU memory is attributed to a container by joining `podman top` host
//! pids with `nvidia-smi --query-compute-apps`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use gpulend_ledger::{JobId, ResourceUsage};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::Instant;

use super::archive::{self, Artifact, REQUIREMENTS_FILE};
use super::backend::{
    SandboxBackend, SandboxExit, SandboxHandle, SandboxSpec, SandboxStatus, JOB_LABEL,
};
use super::error::{SandboxError, SandboxResult};
use crate::probe::nvidia_smi_csv;

/// Timeout for short podman management commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const INFO_TIMEOUT: Duration = Duration::from_secs(20);
/// How long a positive or negative availability check is reused.
const AVAILABILITY_TTL: Duration = Duration::from_secs(30);
const ARTIFACT_DIR: &str = "gpulend-artifacts";

struct Workspace {
    _root: TempDir,
    path: PathBuf,
    job_id: JobId,
    network_isolated: bool,
    gpus: bool,
}

pub struct PodmanBackend {
    podman: Option<PathBuf>,
    workdir: PathBuf,
    artifact_dir: PathBuf,
    http: reqwest::Client,
    workspaces: Mutex<HashMap<String, Workspace>>,
    availability: Mutex<Option<(Instant, bool)>>,
}

impl PodmanBackend {
    /// Locate podman and use `workdir` (or the system temp dir) for workspaces.
    pub fn new(workdir: Option<PathBuf>) -> Self {
        let workdir = workdir
            .filter(|p| p.is_dir())
            .unwrap_or_else(default_workdir);
        Self {
            podman: find_podman(),
            artifact_dir: workdir.join(ARTIFACT_DIR),
            workdir,
            http: reqwest::Client::new(),
            workspaces: Mutex::new(HashMap::new()),
            availability: Mutex::new(None),
        }
    }

    fn podman(&self) -> SandboxResult<&Path> {
        self.podman
            .as_deref()
            .ok_or_else(|| SandboxError::Unavailable("podman not found on PATH".into()))
    }

    async fn run(&self, args: &[String], timeout: Option<Duration>) -> SandboxResult<Output> {
        let podman = self.podman()?;
        let child = Command::new(podman)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| command_error(args, e.to_string()))?;
        let output = match timeout {
            Some(t) => tokio::time::timeout(t, child.wait_with_output())
                .await
                .map_err(|_| command_error(args, format!("timed out after {}s", t.as_secs())))??,
            None => child.wait_with_output().await?,
        };
        Ok(output)
    }

    /// Run and require a zero exit status.
    async fn run_ok(&self, args: &[String], timeout: Option<Duration>) -> SandboxResult<String> {
        let output = self.run(args, timeout).await?;
        if !output.status.success() {
            return Err(command_error(
                args,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn check_available(&self) -> bool {
        if self.podman.is_none() {
            return false;
        }
        let info = vec!["info".to_string()];
        match self.run(&info, Some(INFO_TIMEOUT)).await {
            Ok(out) if out.status.success() => true,
            Ok(out) if !cfg!(target_os = "linux") => {
                // macOS and Windows run podman inside a VM that may be stopped.
                let err = String::from_utf8_lossy(&out.stderr).to_lowercase();
                let triggers = ["unable to connect", "cannot connect", "connection refused", "vm does not exist"];
                if !triggers.iter().any(|t| err.contains(t)) {
                    return false;
                }
                tracing::info!("starting podman machine");
                let start = vec!["machine".to_string(), "start".to_string()];
                matches!(self.run(&start, Some(Duration::from_secs(120))).await, Ok(o) if o.status.success())
            }
            Ok(out) => {
                tracing::warn!(
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "podman info failed"
                );
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "podman info failed");
                false
            }
        }
    }

    /// Fetch or locate the blob, then stage it into `workspace`. Downloads
    /// land in `scratch`, next to the workspace.
    async fn stage_blob(&self, uri: &str, scratch: &Path, workspace: &Path) -> SandboxResult<()> {
        let src = if uri.starts_with("http://") || uri.starts_with("https://") {
            let name = uri
                .split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .filter(|s| !s.is_empty())
                .unwrap_or("payload")
                .to_string();
            let bytes = self
                .http
                .get(uri)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| SandboxError::Payload(format!("fetch {uri}: {e}")))?
                .bytes()
                .await
                .map_err(|e| SandboxError::Payload(format!("fetch {uri}: {e}")))?;
            let path = scratch.join(name);
            tokio::fs::write(&path, &bytes).await?;
            path
        } else {
            PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
        };
        let dest = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || archive::stage_payload(&src, &dest))
            .await
            .map_err(|e| SandboxError::Payload(e.to_string()))?
    }

    /// Pack the sandbox's workspace next to the other artifacts.
    async fn pack(&self, handle: &SandboxHandle) -> Option<Artifact> {
        let (workspace, job_id) = {
            let map = self.workspaces.lock().unwrap_or_else(|e| e.into_inner());
            let ws = map.get(&handle.id)?;
            (ws.path.clone(), ws.job_id.clone())
        };
        let dest = self.artifact_dir.join(format!("{job_id}.zip"));
        let packed = tokio::task::spawn_blocking(move || archive::pack_workspace(&workspace, &dest))
            .await
            .map_err(|e| SandboxError::Archive(e.to_string()))
            .and_then(|r| r);
        match packed {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                tracing::warn!(sandbox = %handle.id, error = %e, "workspace not packed");
                None
            }
        }
    }

    /// VRAM held by the container's processes, or `None` when it cannot be
    /// measured.
    async fn sample_vram_mb(&self, handle: &SandboxHandle) -> Option<u64> {
        let top = self
            .run_ok(&["top".into(), handle.id.clone(), "hpid".into()], Some(COMMAND_TIMEOUT))
            .await
            .ok()?;
        let pids = parse_top_pids(&top);
        let apps = nvidia_smi_csv("query-compute-apps", "pid,used_memory").await?;
        Some(vram_of_pids(&parse_compute_apps(&apps), &pids))
    }

    fn create_args(&self, spec: &SandboxSpec, workspace: &Path, requirements: bool) -> Vec<String> {
        let mount_opts = if cfg!(target_os = "linux") { "rw,Z" } else { "rw" };
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name(),
            "--label".into(),
            format!("{JOB_LABEL}={}", spec.job_id),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--pids-limit".into(),
            spec.limits.pids.to_string(),
            "--network".into(),
            spec.network.as_podman_arg().into(),
            "-v".into(),
            format!("{}:/workspace:{mount_opts}", workspace.display()),
            "-w".into(),
            "/workspace".into(),
            "-e".into(),
            "HOME=/tmp".into(),
        ];
        if let Some(cpus) = spec.limits.cpu_cores {
            args.extend(["--cpus".into(), cpus.to_string()]);
        }
        if let Some(mb) = spec.limits.memory_mb {
            args.extend(["--memory".into(), format!("{mb}m")]);
        }
        if spec.gpus {
            args.extend(["--gpus".into(), "all".into()]);
        }
        args.push(spec.image.clone());
        let command = job_command(spec.command.as_deref(), requirements, spec.network.is_isolated());
        if let Some(cmd) = command {
            args.extend(["sh".into(), "-c".into(), cmd]);
        }
        args
    }
}

#[async_trait]
impl SandboxBackend for PodmanBackend {
    fn name(&self) -> &str {
        "podman"
    }

    async fn is_available(&self) -> bool {
        let cached = *self.availability.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, ok)) = cached {
            if at.elapsed() < AVAILABILITY_TTL {
                return ok;
            }
        }
        let ok = self.check_available().await;
        *self.availability.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), ok));
        ok
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle> {
        self.podman()?;
        let root = tempfile::Builder::new()
            .prefix("gpulend_")
            .tempdir_in(&self.workdir)?;
        let workspace = root.path().join("workspace");
        tokio::fs::create_dir_all(&workspace).await?;
        if let Some(uri) = &spec.blob_uri {
            self.stage_blob(uri, root.path(), &workspace).await?;
        }
        let requirements = workspace.join(REQUIREMENTS_FILE).is_file();

        let args = self.create_args(spec, &workspace, requirements);
        self.run_ok(&args, Some(COMMAND_TIMEOUT))
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        let name = spec.name();
        self.workspaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name.clone(),
                Workspace {
                    _root: root,
                    path: workspace,
                    job_id: spec.job_id.clone(),
                    network_isolated: spec.network.is_isolated(),
                    gpus: spec.gpus,
                },
            );
        tracing::debug!(
            sandbox = %name,
            image = %spec.image,
            requirements,
            "podman container created"
        );
        Ok(SandboxHandle {
            id: name,
            job_id: spec.job_id.clone(),
        })
    }

    async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.run_ok(&["start".into(), handle.id.clone()], Some(COMMAND_TIMEOUT))
            .await
            .map(|_| ())
    }

    async fn wait(&self, handle: &SandboxHandle) -> SandboxResult<SandboxExit> {
        let out = self.run_ok(&["wait".into(), handle.id.clone()], None).await?;
        let exit_code = out.trim().parse::<i32>().unwrap_or(-1);

        let logs = self
            .run(&["logs".into(), handle.id.clone()], Some(COMMAND_TIMEOUT))
            .await?;
        let oom = self
            .run_ok(
                &[
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.OOMKilled}}".into(),
                    handle.id.clone(),
                ],
                Some(COMMAND_TIMEOUT),
            )
            .await
            .map(|s| s.trim() == "true")
            .unwrap_or(false);

        Ok(SandboxExit {
            exit_code,
            stdout: String::from_utf8_lossy(&logs.stdout).to_string(),
            stderr: String::from_utf8_lossy(&logs.stderr).to_string(),
            artifact: self.pack(handle).await,
            oom_killed: oom,
        })
    }

    async fn status(&self, handle: &SandboxHandle) -> SandboxResult<SandboxStatus> {
        let out = self
            .run_ok(
                &[
                    "stats".into(),
                    "--no-stream".into(),
                    "--format".into(),
                    "json".into(),
                    handle.id.clone(),
                ],
                Some(COMMAND_TIMEOUT),
            )
            .await?;
        let mut usage = parse_stats(&out).unwrap_or_default();
        let (isolated, gpus) = self
            .workspaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&handle.id)
            .map_or((true, false), |w| (w.network_isolated, w.gpus));
        // without --gpus the container cannot hold device memory
        let vram = if gpus {
            self.sample_vram_mb(handle).await
        } else {
            Some(0)
        };
        usage.peak_vram_mb = vram.unwrap_or(0);
        Ok(SandboxStatus {
            usage,
            side_effects: !isolated,
            vram_monitored: vram.is_some(),
        })
    }

    async fn kill(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.run_ok(&["kill".into(), handle.id.clone()], Some(COMMAND_TIMEOUT))
            .await
            .map(|_| ())
    }

    async fn teardown(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let removed = self
            .run_ok(
                &["rm".into(), "-f".into(), "--ignore".into(), handle.id.clone()],
                Some(COMMAND_TIMEOUT),
            )
            .await;
        self.workspaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id);
        removed.map(|_| ())
    }

    async fn list_sandboxes(&self) -> SandboxResult<Vec<SandboxHandle>> {
        if self.podman.is_none() {
            return Ok(Vec::new());
        }
        let out = self
            .run_ok(
                &[
                    "ps".into(),
                    "-a".into(),
                    "--filter".into(),
                    format!("label={JOB_LABEL}"),
                    "--format".into(),
                    "json".into(),
                ],
                Some(COMMAND_TIMEOUT),
            )
            .await?;
        Ok(parse_ps(&out))
    }
}

fn command_error(args: &[String], detail: String) -> SandboxError {
    SandboxError::Command {
        command: format!("podman {}", args.first().map(String::as_str).unwrap_or("")),
        detail,
    }
}

fn default_workdir() -> PathBuf {
    let var_tmp = PathBuf::from("/var/tmp");
    if cfg!(unix) && var_tmp.is_dir() {
        var_tmp
    } else {
        std::env::temp_dir()
    }
}

/// Search PATH, then common install locations.
pub fn find_podman() -> Option<PathBuf> {
    let exe = if cfg!(windows) { "podman.exe" } else { "podman" };
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(exe);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    let fallbacks: &[&str] = if cfg!(windows) {
        &[
            r"C:\Program Files\RedHat\Podman\podman.exe",
            r"C:\Program Files\Podman\podman.exe",
        ]
    } else {
        &["/usr/local/bin/podman", "/usr/bin/podman", "/bin/podman"]
    };
    fallbacks.iter().map(PathBuf::from).find(|p| p.is_file())
}

/// Prefix the job command with a pip install of `requirements.txt`. On an
/// isolated network the install is skipped with a note on stderr.
fn job_command(command: Option<&str>, requirements: bool, network_isolated: bool) -> Option<String> {
    let command = command?;
    if !requirements {
        return Some(command.to_string());
    }
    let install = if network_isolated {
        format!("echo 'gpulend: {REQUIREMENTS_FILE} not installed, sandbox has no network' >&2")
    } else {
        format!(
            "python -m pip install --no-cache-dir --disable-pip-version-check -r /workspace/{REQUIREMENTS_FILE}"
        )
    };
    Some(format!("{install} && {command}"))
}

/// Host pids from `podman top <ctr> hpid`.
fn parse_top_pids(out: &str) -> HashSet<u32> {
    out.lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .collect()
}

/// `(pid, used MB)` rows from `nvidia-smi --query-compute-apps=pid,used_memory`.
fn parse_compute_apps(out: &str) -> Vec<(u32, u64)> {
    out.lines()
        .filter_map(|line| {
            let (pid, used) = line.split_once(',')?;
            Some((pid.trim().parse().ok()?, used.trim().parse().ok()?))
        })
        .collect()
}

fn vram_of_pids(apps: &[(u32, u64)], pids: &HashSet<u32>) -> u64 {
    apps.iter()
        .filter(|(pid, _)| pids.contains(pid))
        .map(|(_, mb)| mb)
        .sum()
}

/// Parse `podman stats --format json` output for the first container.
fn parse_stats(json: &str) -> Option<ResourceUsage> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let first = value.as_array()?.first()?;
    let mem = first
        .get("mem_usage")
        .or_else(|| first.get("MemUsage"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.split('/').next())
        .and_then(parse_size_mb)
        .unwrap_or(0);
    let cpu_ms = first
        .get("cpu_time")
        .and_then(|v| v.as_str())
        .and_then(parse_go_duration)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    // VRAM is sampled separately through nvidia-smi
    Some(ResourceUsage {
        peak_vram_mb: 0,
        peak_memory_mb: mem,
        cpu_time_ms: cpu_ms,
    })
}

/// Parse human sizes like `512kB`, `1.049MB`, `2GiB` into whole megabytes.
fn parse_size_mb(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let num: f64 = num.parse().ok()?;
    let bytes = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => num,
        "kb" => num * 1e3,
        "kib" => num * 1024.0,
        "mb" => num * 1e6,
        "mib" => num * 1024.0 * 1024.0,
        "gb" => num * 1e9,
        "gib" => num * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((bytes / 1e6).round() as u64)
}

/// Parse Go duration strings such as `1m2.5s` or `350ms`.
fn parse_go_duration(s: &str) -> Option<Duration> {
    let mut nanos = 0f64;
    let mut rest = s.trim();
    if rest.is_empty() {
        return None;
    }
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "h" => 3_600e9,
            "m" => 60e9,
            "s" => 1e9,
            "ms" => 1e6,
            "us" | "µs" => 1e3,
            "ns" => 1.0,
            _ => return None,
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

/// Parse `podman ps --format json` into handles of labelled containers.
fn parse_ps(json: &str) -> Vec<SandboxHandle> {
    let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(json)
    else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let job = item.get("Labels")?.get(JOB_LABEL)?.as_str()?;
            let name = item
                .get("Names")
                .and_then(|n| n.as_array())
                .and_then(|n| n.first())
                .and_then(|n| n.as_str())
                .map(str::to_string)
                .or_else(|| item.get("Id").and_then(|i| i.as_str()).map(str::to_string))?;
            Some(SandboxHandle {
                id: name,
                job_id: JobId::from(job),
            })
        })
        .collect()
}
