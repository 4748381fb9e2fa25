//! Sandbox provisioning interface
//!
//! The provisioning service, snapshot storage, and their transports are
//! external collaborators — this module defines the narrow traits the rest
//! of the server consumes. `remote_provider` implements `SandboxProvider`
//! against the HTTP API; tests use the scripted mock below.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("command failed in sandbox: {0}")]
    Command(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Fixed resource profile for new sandboxes. The inactivity timeout is
/// enforced by the provider, not by us — expiry is detected, not prevented.
#[derive(Debug, Clone)]
pub struct ResourceProfile {
    pub image: String,
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub idle_timeout: Duration,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            image: "driftbox/expo-sandbox:latest".to_string(),
            cpu_cores: 2.0,
            memory_mb: 4096,
            idle_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Options for a single command execution inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    /// Bound on the remote call itself — distinct from the sandbox's own
    /// inactivity timeout.
    pub timeout: Duration,
    pub env: HashMap<String, String>,
    pub background: bool,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            env: HashMap::new(),
            background: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// Remote pid, reported for background launches.
    pub pid: Option<i64>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Streaming command handle: combined-output chunks with no line
/// alignment guarantee, plus the remote pid.
pub struct CommandStream {
    pub pid: Option<i64>,
    pub chunks: mpsc::Receiver<Bytes>,
}

/// Ephemeral-compute provisioning collaborator.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a new instance; returns its id.
    async fn create(&self, profile: &ResourceProfile) -> Result<String, ProviderError>;

    /// Reattach to an existing instance. `NotFound` means the instance
    /// expired or was destroyed.
    async fn connect(&self, id: &str) -> Result<(), ProviderError>;

    /// Destroy an instance.
    async fn kill(&self, id: &str) -> Result<(), ProviderError>;

    /// Run a command to completion (or detached when `background`).
    async fn run_command(
        &self,
        id: &str,
        cmd: &str,
        opts: ExecOpts,
    ) -> Result<ExecOutput, ProviderError>;

    /// Run a command and stream its combined output.
    async fn stream_command(
        &self,
        id: &str,
        cmd: &str,
        opts: ExecOpts,
    ) -> Result<CommandStream, ProviderError>;

    async fn write_file(&self, id: &str, path: &str, contents: &[u8])
        -> Result<(), ProviderError>;

    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>, ProviderError>;

    /// Public hostname routing to a port inside the sandbox.
    async fn public_host(&self, id: &str, port: u16) -> Result<String, ProviderError>;
}

/// Object-storage collaborator for source snapshots. Upload/versioning is
/// owned elsewhere; recovery only needs the latest restorable artifact.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Download URL of the most recent source snapshot, if one exists.
    async fn latest_snapshot_url(&self, project_id: &str) -> Result<Option<String>, ProviderError>;
}
