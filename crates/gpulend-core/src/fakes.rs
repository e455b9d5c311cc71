//! In-process sandbox backend driven by per-image scripts. Used by the test
//! suites and by `gpulendd --fake-sandbox` on hosts without a container
//! runtime.
//!
//! With [`FakeBackend::with_workspaces`] each sandbox also gets a real
//! directory: local blob payloads are staged into it and it is packed into
//! a zip artifact when the script finishes on its own.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gpulend_ledger::{JobId, ResourceUsage};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::supervisor::{
    pack_workspace, sandbox_name, stage_payload, Artifact, SandboxBackend, SandboxError,
    SandboxExit, SandboxHandle, SandboxResult, SandboxSpec, SandboxStatus,
};

/// How a fake sandbox behaves once started.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    Succeed { after: Duration, stdout: String },
    Fail { after: Duration, exit_code: i32, stderr: String },
    /// Runs until killed.
    Hang,
    /// Reports `vram_mb` of VRAM in use from `after` on, and runs until killed.
    ExceedVram { after: Duration, vram_mb: u64 },
    /// Succeeds after `after` but reports effects outside the sandbox.
    SideEffects { after: Duration },
    CreateFails,
}

impl Script {
    pub fn succeed(after: Duration) -> Self {
        Script::Succeed {
            after,
            stdout: "ok\n".into(),
        }
    }
}

struct FakeSandbox {
    job_id: JobId,
    script: Script,
    started: Option<Instant>,
    killed: watch::Sender<bool>,
    workspace: Option<PathBuf>,
}

#[derive(Default)]
struct Books {
    sandboxes: HashMap<String, FakeSandbox>,
    live: HashSet<String>,
    teardowns: HashMap<String, u32>,
    killed: Vec<JobId>,
    created: Vec<SandboxSpec>,
}

pub struct FakeBackend {
    scripts: Mutex<HashMap<String, Script>>,
    default_script: Script,
    available: AtomicBool,
    books: Mutex<Books>,
    next_id: AtomicU64,
    workspaces: Option<PathBuf>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new(Script::succeed(Duration::from_secs(1)))
    }
}

impl FakeBackend {
    pub fn new(default_script: Script) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_script,
            available: AtomicBool::new(true),
            books: Mutex::new(Books::default()),
            next_id: AtomicU64::new(1),
            workspaces: None,
        }
    }

    /// Give every sandbox a workspace under `root` and pack it into
    /// `root/artifacts/<job id>.zip` on a natural exit.
    pub fn with_workspaces(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspaces = Some(root.into());
        self
    }

    /// Run `script` for every job whose image is `image`.
    pub fn script(self, image: &str, script: Script) -> Self {
        self.lock_scripts().insert(image.to_string(), script);
        self
    }

    pub fn set_script(&self, image: &str, script: Script) {
        self.lock_scripts().insert(image.to_string(), script);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Pretend a sandbox for `job_id` survived a previous process.
    pub fn seed_orphan(&self, job_id: &JobId) -> SandboxHandle {
        let handle = SandboxHandle {
            id: sandbox_name(job_id),
            job_id: job_id.clone(),
        };
        let mut books = self.lock_books();
        books.sandboxes.insert(
            handle.id.clone(),
            FakeSandbox {
                job_id: job_id.clone(),
                script: Script::Hang,
                started: Some(Instant::now()),
                killed: watch::channel(false).0,
                workspace: None,
            },
        );
        books.live.insert(handle.id.clone());
        handle
    }

    pub fn live_sandboxes(&self) -> usize {
        self.lock_books().live.len()
    }

    pub fn created(&self) -> Vec<SandboxSpec> {
        self.lock_books().created.clone()
    }

    /// Teardown calls per sandbox id.
    pub fn teardowns(&self) -> HashMap<String, u32> {
        self.lock_books().teardowns.clone()
    }

    pub fn killed(&self) -> Vec<JobId> {
        self.lock_books().killed.clone()
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Script>> {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_books(&self) -> std::sync::MutexGuard<'_, Books> {
        self.books.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn script_for(&self, image: &str) -> Script {
        self.lock_scripts()
            .get(image)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    fn lookup(&self, handle: &SandboxHandle) -> SandboxResult<Lookup> {
        let books = self.lock_books();
        let sandbox = books
            .sandboxes
            .get(&handle.id)
            .ok_or_else(|| SandboxError::UnknownSandbox(handle.id.clone()))?;
        Ok(Lookup {
            script: sandbox.script.clone(),
            started: sandbox.started,
            killed: sandbox.killed.subscribe(),
            workspace: sandbox.workspace.clone(),
        })
    }

    async fn stage(&self, spec: &SandboxSpec, id: &str) -> SandboxResult<Option<PathBuf>> {
        let Some(root) = &self.workspaces else {
            return Ok(None);
        };
        let workspace = root.join(id);
        tokio::fs::create_dir_all(&workspace).await?;
        if let Some(uri) = &spec.blob_uri {
            if uri.starts_with("http://") || uri.starts_with("https://") {
                return Err(SandboxError::Payload(format!("fake backend cannot fetch {uri}")));
            }
            let src = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
            let dest = workspace.clone();
            tokio::task::spawn_blocking(move || stage_payload(&src, &dest))
                .await
                .map_err(|e| SandboxError::Payload(e.to_string()))??;
        }
        Ok(Some(workspace))
    }

    async fn pack(&self, job_id: &JobId, workspace: &Path, stdout: &str) -> Option<Artifact> {
        let root = self.workspaces.as_ref()?;
        let dest = root.join("artifacts").join(format!("{job_id}.zip"));
        let workspace = workspace.to_path_buf();
        let stdout = stdout.to_string();
        let packed = tokio::task::spawn_blocking(move || {
            std::fs::write(workspace.join("stdout.log"), stdout)?;
            pack_workspace(&workspace, &dest)
        })
        .await
        .map_err(|e| SandboxError::Archive(e.to_string()))
        .and_then(|r| r);
        match packed {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "fake workspace not packed");
                None
            }
        }
    }
}

struct Lookup {
    script: Script,
    started: Option<Instant>,
    killed: watch::Receiver<bool>,
    workspace: Option<PathBuf>,
}

fn exit(exit_code: i32, stdout: &str, stderr: &str) -> SandboxExit {
    SandboxExit {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        artifact: None,
        oom_killed: false,
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle> {
        let script = self.script_for(&spec.image);
        if script == Script::CreateFails {
            return Err(SandboxError::Create(format!("image {} failed to pull", spec.image)));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = SandboxHandle {
            id: format!("{}-{n}", spec.name()),
            job_id: spec.job_id.clone(),
        };
        let workspace = self.stage(spec, &handle.id).await?;
        let mut books = self.lock_books();
        books.sandboxes.insert(
            handle.id.clone(),
            FakeSandbox {
                job_id: spec.job_id.clone(),
                script,
                started: None,
                killed: watch::channel(false).0,
                workspace,
            },
        );
        books.live.insert(handle.id.clone());
        books.created.push(spec.clone());
        Ok(handle)
    }

    async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let mut books = self.lock_books();
        let sandbox = books
            .sandboxes
            .get_mut(&handle.id)
            .ok_or_else(|| SandboxError::UnknownSandbox(handle.id.clone()))?;
        sandbox.started = Some(Instant::now());
        Ok(())
    }

    async fn wait(&self, handle: &SandboxHandle) -> SandboxResult<SandboxExit> {
        let Lookup {
            script,
            started,
            mut killed,
            workspace,
        } = self.lookup(handle)?;
        let started = started.unwrap_or_else(Instant::now);
        let finish_after = match &script {
            Script::Succeed { after, .. }
            | Script::Fail { after, .. }
            | Script::SideEffects { after } => Some(*after),
            Script::Hang | Script::ExceedVram { .. } | Script::CreateFails => None,
        };
        let natural = async {
            match finish_after {
                Some(after) => tokio::time::sleep_until(started + after).await,
                None => std::future::pending::<()>().await,
            }
        };
        let mut finished = tokio::select! {
            _ = natural => match script {
                Script::Fail { exit_code, stderr, .. } => exit(exit_code, "", &stderr),
                Script::Succeed { stdout, .. } => exit(0, &stdout, ""),
                _ => exit(0, "done\n", ""),
            },
            _ = killed.wait_for(|k| *k) => return Ok(exit(137, "", "killed\n")),
        };
        if let Some(workspace) = workspace {
            finished.artifact = self.pack(&handle.job_id, &workspace, &finished.stdout).await;
        }
        Ok(finished)
    }

    async fn status(&self, handle: &SandboxHandle) -> SandboxResult<SandboxStatus> {
        let Lookup { script, started, .. } = self.lookup(handle)?;
        let elapsed = started.map(|s| s.elapsed()).unwrap_or_default();
        let mut status = SandboxStatus {
            usage: ResourceUsage {
                peak_vram_mb: 0,
                peak_memory_mb: 64,
                cpu_time_ms: elapsed.as_millis() as u64,
            },
            side_effects: false,
            vram_monitored: true,
        };
        match script {
            Script::ExceedVram { after, vram_mb } if elapsed >= after => {
                status.usage.peak_vram_mb = vram_mb;
            }
            Script::SideEffects { .. } => status.side_effects = true,
            _ => {}
        }
        Ok(status)
    }

    async fn kill(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let mut books = self.lock_books();
        let sandbox = books
            .sandboxes
            .get(&handle.id)
            .ok_or_else(|| SandboxError::UnknownSandbox(handle.id.clone()))?;
        sandbox.killed.send_replace(true);
        books.killed.push(handle.job_id.clone());
        Ok(())
    }

    async fn teardown(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let mut books = self.lock_books();
        if let Some(sandbox) = books.sandboxes.get(&handle.id) {
            sandbox.killed.send_replace(true);
        }
        books.live.remove(&handle.id);
        *books.teardowns.entry(handle.id.clone()).or_default() += 1;
        Ok(())
    }

    async fn list_sandboxes(&self) -> SandboxResult<Vec<SandboxHandle>> {
        let books = self.lock_books();
        let mut out: Vec<SandboxHandle> = books
            .live
            .iter()
            .filter_map(|id| {
                books.sandboxes.get(id).map(|s| SandboxHandle {
                    id: id.clone(),
                    job_id: s.job_id.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

/// Convenience for tests that need the backend both as a trait object and
/// for inspection.
pub fn fake_backend(default_script: Script) -> Arc<FakeBackend> {
    Arc::new(FakeBackend::new(default_script))
}
