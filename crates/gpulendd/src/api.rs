//! HTTP surface of the daemon: the peer protocol endpoint and the local
//! control API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gpulend_core::domain::api::{
    ApiErrorBody, CancelResponse, LedgerView, PeerView, SubmitJob, SubmitJobResponse,
};
use gpulend_core::{
    Capability, DispatchError, EnvelopeHandler, JobId, JobSession, LedgerError, Node,
    SignedEnvelope, WireReply,
};
use serde::Deserialize;

const DEFAULT_LEDGER_LIMIT: usize = 50;

#[derive(Clone)]
struct AppState {
    node: Arc<Node>,
}

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/v1/envelope", post(envelope))
        .route("/v1/jobs", post(submit_job).get(list_jobs))
        .route("/v1/jobs/:id", get(job_status))
        .route("/v1/jobs/:id/cancel", post(cancel_job))
        .route("/v1/peers", get(peers))
        .route("/v1/ledger", get(ledger))
        .route("/v1/capability", get(capability))
        .route("/v1/artifacts/:id", get(artifact))
        .with_state(AppState { node })
}

/// Error body plus status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match &e {
            DispatchError::NoCandidate | DispatchError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::UnknownJob(_) => StatusCode::NOT_FOUND,
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        tracing::error!(error = %e, "ledger query failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn envelope(State(state): State<AppState>, Json(env): Json<SignedEnvelope>) -> Json<WireReply> {
    Json(state.node.router().handle(env).await)
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJob>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let job_id = state
        .node
        .submit(
            req.requirement,
            req.payload,
            Duration::from_secs(req.time_budget_secs),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSession>> {
    Json(state.node.dispatcher().sessions())
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobSession> {
    let job_id = JobId(id);
    state
        .node
        .dispatcher()
        .status(&job_id)
        .map(Json)
        .ok_or_else(|| DispatchError::UnknownJob(job_id).into())
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CancelResponse> {
    let job_id = JobId(id);
    let requested = state.node.dispatcher().cancel(&job_id)?;
    Ok(Json(CancelResponse { job_id, requested }))
}

async fn peers(State(state): State<AppState>) -> Json<Vec<PeerView>> {
    Json(state.node.registry().snapshot().views())
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    limit: Option<usize>,
}

async fn ledger(
    State(state): State<AppState>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<LedgerView> {
    let ledger = state.node.ledger();
    let entries = ledger
        .entries(query.limit.unwrap_or(DEFAULT_LEDGER_LIMIT))
        .await?;
    let summary = ledger.summary().await?;
    Ok(Json(LedgerView { summary, entries }))
}

async fn capability(State(state): State<AppState>) -> Json<Capability> {
    Json(state.node.local_capability().await)
}

/// Zip of a finished job's workspace, while this executor still keeps it.
async fn artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = JobId(id);
    let artifact = state
        .node
        .supervisor()
        .artifact(&job_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("no artifact for job {job_id}")))?;
    let bytes = tokio::fs::read(&artifact.path).await.map_err(|e| {
        tracing::warn!(job_id = %job_id, error = %e, "artifact unreadable");
        ApiError::new(StatusCode::GONE, format!("artifact for job {job_id} is gone"))
    })?;
    Ok(([(header::CONTENT_TYPE, "application/zip")], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpulend_core::fakes::{FakeBackend, Script};
    use gpulend_core::wire::WireMessage;
    use gpulend_core::{
        HttpTransport, JobState, MemoryLedger, NodeConfig, NodeParts, Outcome, PayloadRef,
        PeerIdentity, ResourceRequirement, StaticProbe,
    };
    use serde_json::json;

    struct Daemon {
        node: Arc<Node>,
        base: String,
        http: reqwest::Client,
    }

    impl Daemon {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }
    }

    async fn daemon(probe: StaticProbe, script: Script) -> Daemon {
        daemon_with(probe, FakeBackend::new(script)).await
    }

    async fn daemon_with(probe: StaticProbe, backend: FakeBackend) -> Daemon {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let mut config = NodeConfig::default();
        config.listen = listener.local_addr().unwrap().to_string();
        config.advertise = base.clone();
        let parts = NodeParts {
            identity: PeerIdentity::generate().unwrap(),
            transport: Arc::new(HttpTransport::new(Duration::from_secs(2)).unwrap()),
            backend: Arc::new(backend),
            probe: Arc::new(probe),
            ledger: Arc::new(MemoryLedger::new()),
        };
        let node = Arc::new(Node::start(config, parts).await.unwrap());
        let app = router(Arc::clone(&node));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        node.report_now().await;
        Daemon {
            node,
            base,
            http: reqwest::Client::new(),
        }
    }

    fn submit_body(min_vram_mb: u64) -> SubmitJob {
        SubmitJob {
            requirement: ResourceRequirement::vram(min_vram_mb),
            payload: PayloadRef::image("python:3.12-slim"),
            time_budget_secs: 60,
        }
    }

    async fn wait_finished(d: &Daemon, job_id: &JobId) -> JobSession {
        for _ in 0..100 {
            let session: JobSession = d
                .http
                .get(d.url(&format!("/v1/jobs/{job_id}")))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if session.outcome.is_some() {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn job_runs_on_own_node_end_to_end() {
        let d = daemon(
            StaticProbe::gpu("test-gpu", 8_192, 40),
            Script::succeed(Duration::from_millis(50)),
        )
        .await;

        let resp = d
            .http
            .post(d.url("/v1/jobs"))
            .json(&submit_body(1_024))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        let SubmitJobResponse { job_id } = resp.json().await.unwrap();

        let session = wait_finished(&d, &job_id).await;
        assert_eq!(session.state, JobState::Succeeded);
        assert_eq!(session.outcome.unwrap().outcome, Outcome::Succeeded);

        let jobs: Vec<JobSession> = d
            .http
            .get(d.url("/v1/jobs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);

        let view: LedgerView = d
            .http
            .get(d.url("/v1/ledger?limit=10"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view.entries.len(), 1);
        assert_eq!(view.summary.succeeded, 1);
        assert_eq!(&view.entries[0].executor, d.node.peer_id());
    }

    #[tokio::test]
    async fn unmatched_requirement_is_service_unavailable() {
        let d = daemon(
            StaticProbe::gpu("small", 2_048, 10),
            Script::succeed(Duration::from_millis(50)),
        )
        .await;
        let resp = d
            .http
            .post(d.url("/v1/jobs"))
            .json(&submit_body(80_000))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: ApiErrorBody = resp.json().await.unwrap();
        assert!(body.error.contains("no peer"));
    }

    #[tokio::test]
    async fn zero_budget_is_bad_request() {
        let d = daemon(
            StaticProbe::gpu("test-gpu", 8_192, 40),
            Script::succeed(Duration::from_millis(50)),
        )
        .await;
        let resp = d
            .http
            .post(d.url("/v1/jobs"))
            .json(&json!({
                "requirement": {"min_vram_mb": 1024, "min_compute_units": 0},
                "payload": {"kind": "image", "image": "python:3.12-slim"},
                "time_budget_secs": 0
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let d = daemon(
            StaticProbe::gpu("test-gpu", 8_192, 40),
            Script::succeed(Duration::from_millis(50)),
        )
        .await;
        let status = d
            .http
            .get(d.url("/v1/jobs/nope"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
        let status = d
            .http
            .post(d.url("/v1/jobs/nope/cancel"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_ends_running_job_and_repeats_harmlessly() {
        let d = daemon(StaticProbe::gpu("test-gpu", 8_192, 40), Script::Hang).await;
        let SubmitJobResponse { job_id } = d
            .http
            .post(d.url("/v1/jobs"))
            .json(&submit_body(1_024))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let first: CancelResponse = d
            .http
            .post(d.url(&format!("/v1/jobs/{job_id}/cancel")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(first.requested);

        let session = wait_finished(&d, &job_id).await;
        assert_eq!(session.state, JobState::Cancelled);

        let second: CancelResponse = d
            .http
            .post(d.url(&format!("/v1/jobs/{job_id}/cancel")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!second.requested);
    }

    #[tokio::test]
    async fn peers_and_capability_show_own_node() {
        let d = daemon(
            StaticProbe::gpu("test-gpu", 8_192, 40),
            Script::succeed(Duration::from_millis(50)),
        )
        .await;
        let peers: Vec<PeerView> = d
            .http
            .get(d.url("/v1/peers"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(&peers[0].peer_id, d.node.peer_id());
        assert_eq!(peers[0].capability.vram_total_mb, 8_192);

        let cap: Capability = d
            .http
            .get(d.url("/v1/capability"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(cap.sandbox_available);
        assert_eq!(cap.gpu_model, "test-gpu");
    }

    #[tokio::test]
    async fn finished_job_workspace_is_downloadable() {
        let root = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(Script::Succeed {
            after: Duration::from_millis(50),
            stdout: "trained\n".into(),
        })
        .with_workspaces(root.path());
        let d = daemon_with(StaticProbe::gpu("test-gpu", 8_192, 40), backend).await;

        let SubmitJobResponse { job_id } = d
            .http
            .post(d.url("/v1/jobs"))
            .json(&submit_body(1_024))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let session = wait_finished(&d, &job_id).await;
        let artifact = session.outcome.unwrap().artifact.expect("artifact reported");
        let url = artifact.url.expect("artifact url");
        assert_eq!(url, d.url(&format!("/v1/artifacts/{job_id}")));

        let resp = d.http.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(
            resp.headers()[reqwest::header::CONTENT_TYPE],
            "application/zip"
        );
        let body = resp.bytes().await.unwrap();
        assert_eq!(body.len() as u64, artifact.size_bytes);
        assert!(body.starts_with(b"PK"));

        let missing = d
            .http
            .get(d.url("/v1/artifacts/nope"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(missing, reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn forged_envelope_is_rejected() {
        let d = daemon(
            StaticProbe::gpu("test-gpu", 8_192, 40),
            Script::succeed(Duration::from_millis(50)),
        )
        .await;
        let signer = PeerIdentity::from_seed([9u8; 32]);
        let mut env = SignedEnvelope::seal(
            &signer,
            &WireMessage::Cancel {
                job_id: JobId::from("job-1"),
            },
        )
        .unwrap();
        env.sender = PeerIdentity::from_seed([8u8; 32]).peer_id().clone();

        let reply: WireReply = d
            .http
            .post(d.url("/v1/envelope"))
            .json(&env)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(matches!(reply, WireReply::Rejected { .. }));
    }
}
