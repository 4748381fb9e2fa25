//! HTTP-backed sandbox provider
//!
//! Speaks the provisioning service's REST API. All calls carry a bearer
//! token and a per-request timeout; streaming exec reads the chunked
//! response body straight into the channel the ingest pipeline drains.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{
    CommandStream, ExecOpts, ExecOutput, ProviderError, ResourceProfile, SandboxProvider,
};

pub struct RemoteProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
struct ExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i64,
    #[serde(default)]
    pid: Option<i64>,
}

#[derive(Deserialize)]
struct HostResponse {
    hostname: String,
}

impl RemoteProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn classify(id: &str, status: StatusCode, body: String) -> ProviderError {
        if status == StatusCode::NOT_FOUND {
            ProviderError::NotFound(id.to_string())
        } else {
            ProviderError::Transport(format!("{}: {}", status, body))
        }
    }

    async fn check_status(
        id: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(id, status, body))
    }

    fn transport(err: reqwest::Error, timeout: Duration) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl SandboxProvider for RemoteProvider {
    async fn create(&self, profile: &ResourceProfile) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(self.url("/v1/sandboxes"))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "image": profile.image,
                "cpu_cores": profile.cpu_cores,
                "memory_mb": profile.memory_mb,
                "idle_timeout_secs": profile.idle_timeout.as_secs(),
            }))
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| Self::transport(e, Duration::from_secs(60)))?;

        let created: CreateResponse = Self::check_status("-", response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        debug!(
            component = "remote_provider",
            event = "provider.sandbox.created",
            sandbox_id = %created.id,
            "Provisioned sandbox"
        );
        Ok(created.id)
    }

    async fn connect(&self, id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/sandboxes/{}", id)))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Self::transport(e, Duration::from_secs(10)))?;
        Self::check_status(id, response).await.map(|_| ())
    }

    async fn kill(&self, id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/sandboxes/{}", id)))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Self::transport(e, Duration::from_secs(30)))?;
        Self::check_status(id, response).await.map(|_| ())
    }

    async fn run_command(
        &self,
        id: &str,
        cmd: &str,
        opts: ExecOpts,
    ) -> Result<ExecOutput, ProviderError> {
        // Leave headroom so the remote side times the command out first
        // and we still get its partial output back.
        let call_timeout = opts.timeout + Duration::from_secs(5);
        let response = self
            .http
            .post(self.url(&format!("/v1/sandboxes/{}/exec", id)))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "cmd": cmd,
                "timeout_secs": opts.timeout.as_secs(),
                "env": opts.env,
                "background": opts.background,
            }))
            .timeout(call_timeout)
            .send()
            .await
            .map_err(|e| Self::transport(e, opts.timeout))?;

        let exec: ExecResponse = Self::check_status(id, response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(ExecOutput {
            stdout: exec.stdout,
            stderr: exec.stderr,
            exit_code: exec.exit_code,
            pid: exec.pid,
        })
    }

    async fn stream_command(
        &self,
        id: &str,
        cmd: &str,
        opts: ExecOpts,
    ) -> Result<CommandStream, ProviderError> {
        let response = self
            .http
            .post(self.url(&format!("/v1/sandboxes/{}/exec/stream", id)))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "cmd": cmd,
                "timeout_secs": opts.timeout.as_secs(),
                "env": opts.env,
            }))
            .send()
            .await
            .map_err(|e| Self::transport(e, opts.timeout))?;

        let response = Self::check_status(id, response).await?;
        let pid = response
            .headers()
            .get("x-exec-pid")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());

        let (tx, rx) = mpsc::channel::<Bytes>(256);
        let sandbox_id = id.to_string();
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            component = "remote_provider",
                            event = "provider.stream.read_error",
                            sandbox_id = %sandbox_id,
                            error = %e,
                            "Exec stream ended with error"
                        );
                        break;
                    }
                }
            }
        });

        Ok(CommandStream { pid, chunks: rx })
    }

    async fn write_file(
        &self,
        id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .put(self.url(&format!("/v1/sandboxes/{}/files", id)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .body(contents.to_vec())
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Self::transport(e, Duration::from_secs(30)))?;
        Self::check_status(id, response).await.map(|_| ())
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/sandboxes/{}/files", id)))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Self::transport(e, Duration::from_secs(30)))?;
        let bytes = Self::check_status(id, response)
            .await?
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn public_host(&self, id: &str, port: u16) -> Result<String, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/sandboxes/{}/ports/{}/host", id, port)))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Self::transport(e, Duration::from_secs(10)))?;
        let host: HostResponse = Self::check_status(id, response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(host.hostname)
    }
}

/// Snapshot lookups against the object-storage gateway. Upload and
/// versioning live elsewhere; recovery only ever asks for the latest.
pub struct RemoteSnapshots {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SnapshotResponse {
    url: String,
}

impl RemoteSnapshots {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl crate::provider::SnapshotStore for RemoteSnapshots {
    async fn latest_snapshot_url(&self, project_id: &str) -> Result<Option<String>, ProviderError> {
        let url = format!(
            "{}/v1/projects/{}/snapshots/latest",
            self.base_url, project_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RemoteProvider::transport(e, Duration::from_secs(10)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transport(format!("{}: {}", status, body)));
        }
        let snapshot: SnapshotResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Some(snapshot.url))
    }
}
