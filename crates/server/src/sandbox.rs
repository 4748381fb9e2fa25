//! Sandbox lifecycle control
//!
//! Create/reattach/tear down ephemeral sandboxes through the provisioning
//! provider. The persisted `sandboxes` row is the source of truth for
//! reattachment; correctness under partial failure comes from idempotent
//! clear-and-recreate semantics, not locks. Status decisions go through
//! the pure transition table in `lifecycle`.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use driftbox_protocol::{SandboxRecord, SandboxStatus};

use crate::lifecycle::{self, Action, Signal};
use crate::persistence::PersistCommand;
use crate::provider::{ProviderError, ResourceProfile, SandboxProvider};

#[derive(Debug, Error)]
pub enum ControllerError {
    /// A create is already in flight for this project; the caller should
    /// let it finish rather than race a second one.
    #[error("a sandbox create is already in flight")]
    CreateInFlight,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Handle to a live (or freshly created) sandbox instance.
#[derive(Debug, Clone)]
pub struct SandboxRef {
    pub sandbox_id: String,
    pub reattached: bool,
}

pub struct SandboxController {
    provider: Arc<dyn SandboxProvider>,
    persist_tx: mpsc::Sender<PersistCommand>,
    profile: ResourceProfile,
}

impl SandboxController {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        persist_tx: mpsc::Sender<PersistCommand>,
        profile: ResourceProfile,
    ) -> Self {
        Self {
            provider,
            persist_tx,
            profile,
        }
    }

    pub fn provider(&self) -> Arc<dyn SandboxProvider> {
        self.provider.clone()
    }

    async fn persist(&self, cmd: PersistCommand) {
        let _ = self.persist_tx.send(cmd).await;
    }

    /// Provision a fresh instance. The `starting` row is persisted before
    /// any expensive work so a crash mid-setup is still observable.
    pub async fn create(&self, project_id: &str) -> Result<SandboxRef, ControllerError> {
        self.persist(PersistCommand::SandboxStarting {
            project_id: project_id.to_string(),
        })
        .await;

        match self.provider.create(&self.profile).await {
            Ok(sandbox_id) => {
                info!(
                    component = "sandbox_controller",
                    event = "sandbox.created",
                    project_id = %project_id,
                    sandbox_id = %sandbox_id,
                    "Sandbox provisioned"
                );
                // starting → ready
                debug_assert_eq!(
                    lifecycle::step(SandboxStatus::Starting, Signal::Provisioned).0,
                    SandboxStatus::Ready
                );
                self.persist(PersistCommand::SandboxProvisioned {
                    project_id: project_id.to_string(),
                    sandbox_id: sandbox_id.clone(),
                })
                .await;
                Ok(SandboxRef {
                    sandbox_id,
                    reattached: false,
                })
            }
            Err(e) => {
                warn!(
                    component = "sandbox_controller",
                    event = "sandbox.create_failed",
                    project_id = %project_id,
                    error = %e,
                    "Sandbox provisioning failed"
                );
                let (next, _) = lifecycle::step(SandboxStatus::Starting, Signal::ProvisionFailed);
                self.persist(PersistCommand::SandboxStatus {
                    project_id: project_id.to_string(),
                    status: next,
                })
                .await;
                Err(e.into())
            }
        }
    }

    /// Connect-or-create. A reattach failure is not an error to propagate:
    /// the stale reference is cleared and a fresh create takes over. A
    /// create already in flight (sticky `starting`) is reported as such
    /// instead of being raced.
    pub async fn ensure(
        &self,
        project_id: &str,
        record: Option<&SandboxRecord>,
    ) -> Result<SandboxRef, ControllerError> {
        let mut status = record.map(|r| r.status).unwrap_or(SandboxStatus::Idle);

        if let Some(sandbox_id) = record.and_then(|r| r.sandbox_id.as_deref()) {
            match self.provider.connect(sandbox_id).await {
                Ok(()) => {
                    debug!(
                        component = "sandbox_controller",
                        event = "sandbox.reattached",
                        project_id = %project_id,
                        sandbox_id = %sandbox_id,
                        "Reattached to existing sandbox"
                    );
                    self.persist(PersistCommand::SandboxStatus {
                        project_id: project_id.to_string(),
                        status: SandboxStatus::Ready,
                    })
                    .await;
                    return Ok(SandboxRef {
                        sandbox_id: sandbox_id.to_string(),
                        reattached: true,
                    });
                }
                Err(e) if e.is_not_found() => {
                    info!(
                        component = "sandbox_controller",
                        event = "sandbox.reattach_expired",
                        project_id = %project_id,
                        sandbox_id = %sandbox_id,
                        "Sandbox expired, falling back to create"
                    );
                }
                Err(e) => {
                    warn!(
                        component = "sandbox_controller",
                        event = "sandbox.reattach_failed",
                        project_id = %project_id,
                        sandbox_id = %sandbox_id,
                        error = %e,
                        "Reattach failed, falling back to create"
                    );
                }
            }
            // Clear the stale reference before the fallback create.
            self.persist(PersistCommand::SandboxClear {
                project_id: project_id.to_string(),
            })
            .await;
            status = SandboxStatus::Idle;
        }

        let (_, actions) = lifecycle::step(status, Signal::CreateRequested);
        if actions.contains(&Action::Provision) {
            return self.create(project_id).await;
        }
        if status == SandboxStatus::Starting {
            return Err(ControllerError::CreateInFlight);
        }
        // A ready row without an instance id is stale — recreate.
        self.create(project_id).await
    }

    /// Best-effort kill. "Not found" means the instance is already gone and
    /// is swallowed; the persisted reference is cleared regardless of the
    /// kill outcome so a dead reference can never leak.
    pub async fn stop(
        &self,
        project_id: &str,
        sandbox_id: Option<&str>,
        status: SandboxStatus,
    ) -> Result<(), ControllerError> {
        let (_, actions) = lifecycle::step(status, Signal::StopRequested);

        let mut kill_result = Ok(());
        for action in actions {
            match action {
                Action::Kill => {
                    if let Some(id) = sandbox_id {
                        kill_result = self.provider.kill(id).await;
                    }
                }
                Action::ClearReference => {
                    self.persist(PersistCommand::SandboxClear {
                        project_id: project_id.to_string(),
                    })
                    .await;
                }
                Action::Provision => {}
            }
        }

        match kill_result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(
                    component = "sandbox_controller",
                    event = "sandbox.stop.already_gone",
                    project_id = %project_id,
                    "Sandbox already gone on stop"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use chrono::Utc;

    fn record(project_id: &str, sandbox_id: Option<&str>, status: SandboxStatus) -> SandboxRecord {
        SandboxRecord {
            project_id: project_id.to_string(),
            sandbox_id: sandbox_id.map(String::from),
            status,
            created_at: Utc::now(),
            dev_server_url: None,
            preview_code: None,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<PersistCommand>) -> Vec<PersistCommand> {
        let mut cmds = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    #[tokio::test]
    async fn create_persists_starting_before_provisioning() {
        let provider = Arc::new(MockProvider::new());
        let (tx, mut rx) = mpsc::channel(64);
        let controller = SandboxController::new(provider, tx, ResourceProfile::default());

        let sandbox = controller.create("proj-1").await.expect("create");
        assert_eq!(sandbox.sandbox_id, "sbx-1");
        assert!(!sandbox.reattached);

        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], PersistCommand::SandboxStarting { .. }));
        assert!(matches!(
            cmds[1],
            PersistCommand::SandboxProvisioned { ref sandbox_id, .. } if sandbox_id == "sbx-1"
        ));
    }

    #[tokio::test]
    async fn ensure_reattaches_to_live_sandbox() {
        let provider = Arc::new(MockProvider::with_alive("sbx-live"));
        let (tx, mut rx) = mpsc::channel(64);
        let controller = SandboxController::new(provider, tx, ResourceProfile::default());

        let rec = record("proj-1", Some("sbx-live"), SandboxStatus::Ready);
        let sandbox = controller.ensure("proj-1", Some(&rec)).await.expect("ensure");
        assert!(sandbox.reattached);
        assert_eq!(sandbox.sandbox_id, "sbx-live");

        let cmds = drain(&mut rx);
        assert!(cmds.iter().all(|c| !matches!(c, PersistCommand::SandboxStarting { .. })));
    }

    #[tokio::test]
    async fn reattach_failure_clears_and_falls_back_to_create() {
        let provider = Arc::new(MockProvider::new());
        let (tx, mut rx) = mpsc::channel(64);
        let controller = SandboxController::new(provider, tx, ResourceProfile::default());

        let rec = record("proj-1", Some("dead-id"), SandboxStatus::Ready);
        let sandbox = controller.ensure("proj-1", Some(&rec)).await.expect("ensure");
        assert!(!sandbox.reattached);
        assert_eq!(sandbox.sandbox_id, "sbx-1");

        // Observable sequence: clear stale ref, then starting → ready.
        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], PersistCommand::SandboxClear { .. }));
        assert!(matches!(cmds[1], PersistCommand::SandboxStarting { .. }));
        assert!(matches!(cmds[2], PersistCommand::SandboxProvisioned { .. }));
    }

    #[tokio::test]
    async fn ensure_does_not_race_a_create_in_flight() {
        let provider = Arc::new(MockProvider::new());
        let (tx, mut rx) = mpsc::channel(64);
        let controller = SandboxController::new(provider.clone(), tx, ResourceProfile::default());

        // A starting row with no instance id: another create owns it.
        let rec = record("proj-1", None, SandboxStatus::Starting);
        let result = controller.ensure("proj-1", Some(&rec)).await;
        assert!(matches!(result, Err(ControllerError::CreateInFlight)));
        assert!(drain(&mut rx).is_empty());
        assert!(provider.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_failure_marks_error_and_keeps_row() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_create();
        let (tx, mut rx) = mpsc::channel(64);
        let controller = SandboxController::new(provider, tx, ResourceProfile::default());

        let result = controller.create("proj-1").await;
        assert!(result.is_err());

        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], PersistCommand::SandboxStarting { .. }));
        assert!(matches!(
            cmds[1],
            PersistCommand::SandboxStatus {
                status: SandboxStatus::Error,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stop_swallows_not_found_and_clears_reference() {
        let provider = Arc::new(MockProvider::new());
        let (tx, mut rx) = mpsc::channel(64);
        let controller = SandboxController::new(provider.clone(), tx, ResourceProfile::default());

        // Instance is not known to the provider — kill reports NotFound.
        controller
            .stop("proj-1", Some("sbx-gone"), SandboxStatus::Ready)
            .await
            .expect("stop must not fail for a missing instance");

        assert_eq!(provider.killed.lock().unwrap().as_slice(), ["sbx-gone"]);
        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], PersistCommand::SandboxClear { .. }));
    }

    #[tokio::test]
    async fn stop_without_reference_still_clears() {
        let provider = Arc::new(MockProvider::new());
        let (tx, mut rx) = mpsc::channel(64);
        let controller = SandboxController::new(provider, tx, ResourceProfile::default());

        controller
            .stop("proj-1", None, SandboxStatus::Idle)
            .await
            .expect("stop");
        let cmds = drain(&mut rx);
        assert!(matches!(cmds[0], PersistCommand::SandboxClear { .. }));
    }
}
