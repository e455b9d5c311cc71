//! Executor-side behaviour of the supervisor against the fake backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpulend_core::fakes::{FakeBackend, Script};
use gpulend_core::supervisor::{SandboxError, Supervisor};
use gpulend_core::transport::{EnvelopeHandler, LocalNetwork, Messenger};
use gpulend_core::wire::{JobOffer, PeerAddress, SignedEnvelope, TerminalReport, WireMessage, WireReply};
use gpulend_core::{
    ErrorClass, JobId, Ledger, MemoryLedger, Outcome, PayloadRef, PeerId, PeerIdentity,
    ResourceRequirement, StaticProbe, SupervisorConfig,
};
use gpulend_ledger::OpenExecution;
use tokio::sync::mpsc;

const REQ: &str = "local://requester";
const EXEC: &str = "local://executor";

/// Requester stand-in that forwards everything it receives.
struct Inbox(mpsc::UnboundedSender<WireMessage>);

#[async_trait]
impl EnvelopeHandler for Inbox {
    async fn handle(&self, envelope: SignedEnvelope) -> WireReply {
        let _ = self.0.send(envelope.open().unwrap());
        WireReply::Ack
    }
}

struct Harness {
    supervisor: Supervisor,
    backend: Arc<FakeBackend>,
    ledger: Arc<MemoryLedger>,
    requester: PeerId,
    inbox: mpsc::UnboundedReceiver<WireMessage>,
}

impl Harness {
    fn new(backend: FakeBackend, config: SupervisorConfig) -> Self {
        let net = LocalNetwork::new();
        let (tx, inbox) = mpsc::unbounded_channel();
        net.register(REQ.into(), Arc::new(Inbox(tx)));
        let messenger = Messenger::new(
            Arc::new(PeerIdentity::from_seed([2u8; 32])),
            net.transport(EXEC.into()),
            Duration::from_secs(1),
        );
        let backend = Arc::new(backend);
        let ledger = Arc::new(MemoryLedger::new());
        let supervisor = Supervisor::new(
            config,
            backend.clone(),
            Arc::new(StaticProbe::gpu("a100", 16_000, 100)),
            ledger.clone(),
            messenger,
        );
        Self {
            supervisor,
            backend,
            ledger,
            requester: PeerIdentity::from_seed([1u8; 32]).peer_id().clone(),
            inbox,
        }
    }

    fn offer(&self, image: &str, vram_mb: u64, budget_secs: u64) -> JobOffer {
        JobOffer {
            job_id: JobId::new(),
            requester: self.requester.clone(),
            reply_to: PeerAddress::from(REQ),
            requirement: ResourceRequirement::vram(vram_mb),
            payload: PayloadRef::image(image),
            time_budget_secs: budget_secs,
        }
    }

    async fn run(&mut self, image: &str, budget_secs: u64) -> (JobId, TerminalReport) {
        let offer = self.offer(image, 1_000, budget_secs);
        let job_id = offer.job_id.clone();
        assert!(self.supervisor.accept(offer).await.is_accept());
        self.supervisor.run(&job_id, &self.requester).await.unwrap();
        (job_id.clone(), self.terminal(&job_id).await)
    }

    async fn terminal(&mut self, job_id: &JobId) -> TerminalReport {
        loop {
            match self.inbox.recv().await.unwrap() {
                WireMessage::Terminal(report) if &report.job_id == job_id => return report,
                _ => continue,
            }
        }
    }
}

fn two_slots() -> SupervisorConfig {
    SupervisorConfig {
        max_concurrent_jobs: 2,
        ..SupervisorConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_offers_never_oversubscribe() {
    let h = Harness::new(FakeBackend::new(Script::Hang), two_slots());
    // 16 GB free: two 10 GB offers cannot both fit.
    let first = h.offer("img", 10_000, 60);
    let second = h.offer("img", 10_000, 60);
    let (a, b) = tokio::join!(h.supervisor.accept(first), h.supervisor.accept(second));
    assert_eq!([a.is_accept(), b.is_accept()].iter().filter(|x| **x).count(), 1);
    assert_eq!(h.supervisor.active_jobs().await, 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_offer_is_accepted_without_second_reservation() {
    let h = Harness::new(FakeBackend::new(Script::Hang), two_slots());
    let offer = h.offer("img", 4_000, 60);
    assert!(h.supervisor.accept(offer.clone()).await.is_accept());
    assert!(h.supervisor.accept(offer).await.is_accept());
    assert_eq!(h.supervisor.active_jobs().await, 1);
}

#[tokio::test(start_paused = true)]
async fn headroom_is_judged_against_last_report() {
    let h = Harness::new(FakeBackend::new(Script::Hang), two_slots());
    let mut advertised = h.supervisor.local_capability().await;
    advertised.vram_free_mb = 2_000;
    h.supervisor.note_reported(advertised).await;

    let resp = h.supervisor.accept(h.offer("img", 4_000, 60)).await;
    assert!(!resp.is_accept());
    assert!(resp.reason.unwrap().contains("insufficient vram"));
}

#[tokio::test(start_paused = true)]
async fn unavailable_sandbox_declines() {
    let h = Harness::new(FakeBackend::new(Script::Hang), two_slots());
    h.backend.set_available(false);
    let resp = h.supervisor.accept(h.offer("img", 1_000, 60)).await;
    assert!(!resp.is_accept());
    assert_eq!(h.ledger.open_executions().await.unwrap().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn start_requires_reservation_by_requester() {
    let h = Harness::new(FakeBackend::new(Script::Hang), two_slots());
    let ghost = JobId::from("ghost");
    assert!(matches!(
        h.supervisor.run(&ghost, &h.requester).await,
        Err(SandboxError::NotReserved(_))
    ));

    let offer = h.offer("img", 1_000, 60);
    let job_id = offer.job_id.clone();
    h.supervisor.accept(offer).await;
    assert!(h.supervisor.run(&job_id, &PeerId::from("intruder")).await.is_err());
    h.supervisor.run(&job_id, &h.requester).await.unwrap();
    // repeated start is a no-op
    h.supervisor.run(&job_id, &h.requester).await.unwrap();
    // execution runs on its own task
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.backend.created().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unstarted_reservation_expires() {
    let h = Harness::new(FakeBackend::new(Script::Hang), SupervisorConfig::default());
    h.supervisor.accept(h.offer("img", 1_000, 60)).await;
    assert_eq!(h.supervisor.active_jobs().await, 1);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.supervisor.active_jobs().await, 0);
    assert!(h.ledger.open_executions().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn every_exit_path_tears_down_once() {
    let backend = FakeBackend::new(Script::succeed(Duration::from_secs(1)))
        .script(
            "fails",
            Script::Fail {
                after: Duration::from_secs(1),
                exit_code: 2,
                stderr: "bad input".into(),
            },
        )
        .script("hangs", Script::Hang)
        .script(
            "greedy",
            Script::ExceedVram {
                after: Duration::from_secs(1),
                vram_mb: 9_000,
            },
        )
        .script("broken", Script::CreateFails);
    let mut h = Harness::new(backend, SupervisorConfig::default());

    let (_, ok) = h.run("ok", 60).await;
    assert_eq!(ok.outcome, Outcome::Succeeded);
    assert!(ok.output_ref.unwrap().starts_with("sha256:"));

    let (_, failed) = h.run("fails", 60).await;
    assert_eq!(
        failed.outcome,
        Outcome::Failed {
            class: ErrorClass::PayloadError
        }
    );

    let (_, timed_out) = h.run("hangs", 5).await;
    assert_eq!(timed_out.outcome, Outcome::TimedOut);

    let (_, violated) = h.run("greedy", 60).await;
    assert_eq!(
        violated.outcome,
        Outcome::Failed {
            class: ErrorClass::ResourceViolation
        }
    );

    let (_, broken) = h.run("broken", 60).await;
    assert_eq!(
        broken.outcome,
        Outcome::Failed {
            class: ErrorClass::SandboxError
        }
    );

    assert_eq!(h.backend.created().len(), 4);
    assert_eq!(h.backend.live_sandboxes(), 0);
    let teardowns = h.backend.teardowns();
    assert_eq!(teardowns.len(), 4);
    assert!(teardowns.values().all(|n| *n == 1));
    assert!(h.ledger.open_executions().await.unwrap().is_empty());
    assert_eq!(h.supervisor.active_jobs().await, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent() {
    let mut h = Harness::new(FakeBackend::new(Script::Hang), SupervisorConfig::default());
    let offer = h.offer("img", 1_000, 600);
    let job_id = offer.job_id.clone();
    h.supervisor.accept(offer).await;
    h.supervisor.run(&job_id, &h.requester).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.supervisor.cancel(&job_id, &h.requester).await;
    h.supervisor.cancel(&job_id, &h.requester).await;
    let report = h.terminal(&job_id).await;
    assert_eq!(report.outcome, Outcome::Cancelled);

    // after the end: no-op
    h.supervisor.cancel(&job_id, &h.requester).await;
    h.supervisor.cancel(&JobId::from("never-seen"), &h.requester).await;
    assert_eq!(h.backend.live_sandboxes(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_of_reserved_job_releases_slot() {
    let h = Harness::new(FakeBackend::new(Script::Hang), SupervisorConfig::default());
    let offer = h.offer("img", 1_000, 600);
    let job_id = offer.job_id.clone();
    h.supervisor.accept(offer).await;
    h.supervisor.cancel(&job_id, &h.requester).await;
    assert_eq!(h.supervisor.active_jobs().await, 0);
    assert!(h.backend.created().is_empty());
    // a late duplicate offer for a finished job is refused
    let again = JobOffer {
        job_id,
        ..h.offer("img", 1_000, 600)
    };
    assert!(!h.supervisor.accept(again).await.is_accept());
}

#[tokio::test(start_paused = true)]
async fn progress_pings_flow_while_running() {
    let mut h = Harness::new(
        FakeBackend::new(Script::succeed(Duration::from_secs(7))),
        SupervisorConfig::default(),
    );
    let offer = h.offer("img", 1_000, 60);
    let job_id = offer.job_id.clone();
    h.supervisor.accept(offer).await;
    h.supervisor.run(&job_id, &h.requester).await.unwrap();

    let mut pings = 0;
    loop {
        match h.inbox.recv().await.unwrap() {
            WireMessage::Progress(p) => {
                assert_eq!(p.job_id, job_id);
                assert!(!p.side_effects);
                pings += 1;
            }
            WireMessage::Terminal(t) => {
                assert_eq!(t.outcome, Outcome::Succeeded);
                break;
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }
    // 2 s interval over a 7 s run, first ping at start
    assert!(pings >= 3);
}

#[tokio::test(start_paused = true)]
async fn startup_sweep_removes_orphans() {
    let h = Harness::new(FakeBackend::new(Script::Hang), SupervisorConfig::default());
    let local = PeerIdentity::from_seed([2u8; 32]).peer_id().clone();
    let orphan = JobId::from("orphan-1");
    let gone = JobId::from("orphan-2");
    h.backend.seed_orphan(&orphan);
    for job in [&orphan, &gone] {
        h.ledger
            .open_execution(OpenExecution::new(job.clone(), h.requester.clone(), local.clone()))
            .await
            .unwrap();
    }
    // someone else's mark is left alone
    h.ledger
        .open_execution(OpenExecution::new(
            JobId::from("foreign"),
            h.requester.clone(),
            PeerId::from("other-executor"),
        ))
        .await
        .unwrap();

    let report = h.supervisor.recover_orphans().await.unwrap();
    assert_eq!(report.sandboxes_removed, 1);
    assert_eq!(report.executions_closed, 2);
    assert_eq!(h.backend.live_sandboxes(), 0);
    let open = h.ledger.open_executions().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].job_id, JobId::from("foreign"));
}

fn zip_of(path: &std::path::Path, files: &[(&str, &str)]) {
    use std::io::Write;
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, body) in files {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

fn zip_names(path: &std::path::Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

impl Harness {
    async fn run_blob(&mut self, uri: &str) -> (JobId, TerminalReport) {
        let mut offer = self.offer("ignored", 1_000, 60);
        offer.payload = PayloadRef::Blob {
            uri: uri.to_string(),
            command: "python train.py".into(),
        };
        let job_id = offer.job_id.clone();
        assert!(self.supervisor.accept(offer).await.is_accept());
        self.supervisor.run(&job_id, &self.requester).await.unwrap();
        (job_id.clone(), self.terminal(&job_id).await)
    }
}

#[tokio::test]
async fn zip_payload_is_unpacked_and_workspace_returned() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("job.zip");
    zip_of(
        &payload,
        &[("job/train.py", "print('hi')"), ("job/requirements.txt", "numpy\n")],
    );
    let backend = FakeBackend::new(Script::succeed(Duration::from_millis(20)))
        .with_workspaces(dir.path().join("sandboxes"));
    let mut h = Harness::new(backend, SupervisorConfig::default());

    let (job_id, report) = h.run_blob(payload.to_str().unwrap()).await;
    assert_eq!(report.outcome, Outcome::Succeeded);
    let artifact = report.artifact.expect("workspace archive reported");
    assert_eq!(report.output_ref, Some(format!("sha256:{}", artifact.sha256)));
    assert_eq!(artifact.url, None);

    let kept = h.supervisor.artifact(&job_id).await.expect("archive kept");
    assert_eq!(kept.size_bytes, artifact.size_bytes);
    // the lone top-level directory is flattened into /workspace
    assert_eq!(
        zip_names(&kept.path),
        ["requirements.txt", "stdout.log", "train.py"]
    );
}

#[tokio::test]
async fn missing_blob_is_a_payload_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(Script::succeed(Duration::from_millis(20)))
        .with_workspaces(dir.path());
    let mut h = Harness::new(backend, SupervisorConfig::default());

    let (job_id, report) = h.run_blob("/definitely/not/here.zip").await;
    assert_eq!(
        report.outcome,
        Outcome::Failed {
            class: ErrorClass::PayloadError
        }
    );
    assert!(report.detail.unwrap().contains("payload not found"));
    assert!(report.artifact.is_none());
    assert!(h.supervisor.artifact(&job_id).await.is_none());
}

#[tokio::test]
async fn old_archives_are_deleted_past_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("run.sh"), "echo hi").unwrap();
    let backend = FakeBackend::new(Script::succeed(Duration::from_millis(20)))
        .with_workspaces(dir.path().join("sandboxes"));
    let config = SupervisorConfig {
        max_artifacts: 1,
        artifact_base_url: Some("http://10.0.0.2:7070".into()),
        ..SupervisorConfig::default()
    };
    let mut h = Harness::new(backend, config);
    let uri = dir.path().join("run.sh");

    let (first, _) = h.run_blob(uri.to_str().unwrap()).await;
    let first_path = h.supervisor.artifact(&first).await.unwrap().path;
    let (second, report) = h.run_blob(uri.to_str().unwrap()).await;
    assert_eq!(
        report.artifact.unwrap().url.as_deref(),
        Some(format!("http://10.0.0.2:7070/v1/artifacts/{second}").as_str())
    );

    assert!(h.supervisor.artifact(&first).await.is_none());
    assert!(!first_path.exists());
    assert!(h.supervisor.artifact(&second).await.is_some());
}
