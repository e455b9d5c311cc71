//! Thin reqwest client for a daemon's control API.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use gpulend_core::domain::api::{
    ApiErrorBody, CancelResponse, LedgerView, PeerView, SubmitJob, SubmitJobResponse,
};
use gpulend_core::{ArtifactRef, Capability, JobId, JobSession};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DaemonClient {
    base: String,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .context("Daemon sent an unreadable response");
        }
        let detail = match resp.json::<ApiErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        bail!("daemon answered {}: {}", status.as_u16(), detail)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to reach daemon at {}: {e}", self.base))?;
        Self::decode(resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: Option<&B>) -> Result<T> {
        let mut req = self.http.post(self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| anyhow!("Failed to reach daemon at {}: {e}", self.base))?;
        Self::decode(resp).await
    }

    pub async fn submit(&self, job: &SubmitJob) -> Result<JobId> {
        let resp: SubmitJobResponse = self.post("/v1/jobs", Some(job)).await?;
        Ok(resp.job_id)
    }

    pub async fn status(&self, job_id: &JobId) -> Result<JobSession> {
        self.get(&format!("/v1/jobs/{job_id}")).await
    }

    pub async fn jobs(&self) -> Result<Vec<JobSession>> {
        self.get("/v1/jobs").await
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelResponse> {
        self.post::<(), _>(&format!("/v1/jobs/{job_id}/cancel"), None)
            .await
    }

    pub async fn peers(&self) -> Result<Vec<PeerView>> {
        self.get("/v1/peers").await
    }

    pub async fn ledger(&self, limit: usize) -> Result<LedgerView> {
        self.get(&format!("/v1/ledger?limit={limit}")).await
    }

    pub async fn capability(&self) -> Result<Capability> {
        self.get("/v1/capability").await
    }

    /// Download a job artifact from its executor and check its digest.
    pub async fn download(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let url = artifact
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("Executor did not publish the artifact"))?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to reach executor at {url}: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("executor answered {} for {url}", status.as_u16());
        }
        let bytes = resp.bytes().await.context("Artifact download interrupted")?;
        let digest = hex::encode(Sha256::digest(&bytes));
        if digest != artifact.sha256 {
            bail!("artifact digest mismatch: expected {}, got {digest}", artifact.sha256);
        }
        Ok(bytes.to_vec())
    }

    /// Poll until the session carries an outcome.
    pub async fn wait(&self, job_id: &JobId, poll: Duration) -> Result<JobSession> {
        loop {
            let session = self.status(job_id).await?;
            if session.outcome.is_some() {
                return Ok(session);
            }
            tracing::debug!(job_id = %job_id, state = session.state.as_str(), "waiting");
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};

    async fn stub() -> String {
        let app = Router::new()
            .route(
                "/v1/jobs/:id",
                get(|| async {
                    (
                        StatusCode::NOT_FOUND,
                        Json(ApiErrorBody {
                            error: "unknown job: gone".into(),
                        }),
                    )
                }),
            )
            .route("/v1/peers", get(|| async { Json(Vec::<PeerView>::new()) }))
            .route("/v1/capability", get(|| async { "not json" }))
            .route("/v1/artifacts/:id", get(|| async { b"PK-archive".to_vec() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn error_body_surfaces_in_message() {
        let client = DaemonClient::new(&stub().await).unwrap();
        let err = client.status(&JobId::from("gone")).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("404"), "{msg}");
        assert!(msg.contains("unknown job: gone"), "{msg}");
    }

    #[tokio::test]
    async fn success_decodes_body() {
        let client = DaemonClient::new(&stub().await).unwrap();
        assert!(client.peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn garbage_body_is_an_error() {
        let client = DaemonClient::new(&stub().await).unwrap();
        assert!(client.capability().await.is_err());
    }

    #[tokio::test]
    async fn artifact_download_checks_digest() {
        let base = stub().await;
        let client = DaemonClient::new(&base).unwrap();
        let mut artifact = ArtifactRef {
            sha256: hex::encode(Sha256::digest(b"PK-archive")),
            size_bytes: 10,
            url: Some(format!("{base}v1/artifacts/j1")),
        };
        assert_eq!(client.download(&artifact).await.unwrap(), b"PK-archive");

        artifact.sha256 = "00".repeat(32);
        let err = client.download(&artifact).await.unwrap_err();
        assert!(err.to_string().contains("digest mismatch"), "{err}");

        artifact.url = None;
        assert!(client.download(&artifact).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_daemon_names_address() {
        let client = DaemonClient::new("http://127.0.0.1:9").unwrap();
        let err = client.jobs().await.unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:9"));
    }
}
