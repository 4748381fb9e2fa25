//! Application state
//!
//! Per-project runtime registry: realtime subscribers, background task
//! handles, and the persistence sender. Projects run independent loops;
//! the registry is the only piece they share.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use driftbox_protocol::ServerMessage;

use crate::executor::AgentExecutor;
use crate::health::HealthMonitor;
use crate::persistence::PersistCommand;
use crate::rate_limit::RateLimiter;
use crate::sandbox::SandboxController;

/// Everything the request handlers need, shared behind one Arc.
pub struct AppContext {
    pub registry: std::sync::Arc<ProjectRegistry>,
    pub controller: std::sync::Arc<SandboxController>,
    pub executor: std::sync::Arc<AgentExecutor>,
    pub monitor: std::sync::Arc<HealthMonitor>,
    pub limiter: std::sync::Arc<RateLimiter>,
    /// Recreate expired sandboxes automatically during health checks.
    pub auto_restart: bool,
}

pub struct ProjectRegistry {
    db_path: PathBuf,

    /// Persistence channel
    persist_tx: mpsc::Sender<PersistCommand>,

    /// Realtime subscribers per project
    subscribers: DashMap<String, Vec<mpsc::Sender<ServerMessage>>>,

    /// Health poll loops per project
    health_tasks: DashMap<String, JoinHandle<()>>,
}

impl ProjectRegistry {
    pub fn new(db_path: PathBuf, persist_tx: mpsc::Sender<PersistCommand>) -> Self {
        Self {
            db_path,
            persist_tx,
            subscribers: DashMap::new(),
            health_tasks: DashMap::new(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Get persistence sender
    pub fn persist(&self) -> &mpsc::Sender<PersistCommand> {
        &self.persist_tx
    }

    /// Subscribe to a project's realtime channel
    pub fn subscribe(&self, project_id: &str, tx: mpsc::Sender<ServerMessage>) {
        self.subscribers
            .entry(project_id.to_string())
            .or_default()
            .push(tx);
    }

    /// Unsubscribe a specific channel from a project
    pub fn unsubscribe(&self, project_id: &str, tx: &mpsc::Sender<ServerMessage>) {
        if let Some(mut subs) = self.subscribers.get_mut(project_id) {
            subs.retain(|s| !s.same_channel(tx));
        }
    }

    /// Broadcast a message to all of a project's subscribers.
    /// Closed channels are pruned as a side effect.
    pub async fn broadcast(&self, project_id: &str, msg: ServerMessage) {
        let targets: Vec<mpsc::Sender<ServerMessage>> = {
            let Some(mut subs) = self.subscribers.get_mut(project_id) else {
                return;
            };
            subs.retain(|tx| !tx.is_closed());
            subs.clone()
        };

        for tx in targets {
            let _ = tx.send(msg.clone()).await;
        }
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.subscribers
            .get(project_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Install the health poll loop for a project, replacing (and aborting)
    /// any previous one.
    pub fn set_health_task(&self, project_id: &str, task: JoinHandle<()>) {
        if let Some(old) = self.health_tasks.insert(project_id.to_string(), task) {
            old.abort();
        }
    }

    pub fn abort_health_task(&self, project_id: &str) {
        if let Some((_, task)) = self.health_tasks.remove(project_id) {
            task.abort();
        }
    }

    pub fn has_health_task(&self, project_id: &str) -> bool {
        self.health_tasks.contains_key(project_id)
    }
}
