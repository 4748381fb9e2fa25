//! Sandbox and dev-server health monitoring
//!
//! Liveness is probed in three ordered tiers: process existence, port
//! listening, application-level HTTP. The probes classify into
//! `HealthStatus`, which is a live view — the persisted administrative
//! status is not consulted for liveness, only for in-flight creates.
//!
//! Policy: process + port passing with the HTTP probe failing counts as
//! alive-but-unconfirmed and reports healthy. This avoids restart storms
//! during slow Metro boots at the cost of a possible false "ready" during
//! a crash loop; `HealthPolicy::optimistic_http` makes it tunable.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use driftbox_protocol::{HealthReport, HealthStatus, SandboxStatus, ServerMessage};

use crate::lifecycle::{self, Action, Signal};
use crate::persistence::{self, PersistCommand};
use crate::provider::{ExecOpts, ProviderError, SandboxProvider, SnapshotStore};
use crate::sandbox::SandboxController;
use crate::state::ProjectRegistry;

/// Metro's default port inside the sandbox.
pub const DEV_SERVER_PORT: u16 = 8081;

/// Primary process pattern for the dev server.
const DEV_SERVER_PATTERN: &str = "expo start";
/// Different runtimes report the bundler under different names.
const DEV_SERVER_PATTERN_FALLBACK: &str = "node.*metro";

static DEV_SERVER_READY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Metro waiting|Waiting on exp://|Logs for your project").unwrap());

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Report healthy when process + port pass but the HTTP probe fails.
    pub optimistic_http: bool,
    pub http_timeout: Duration,
    /// Poll interval while status != ready (fast convergence on boot).
    pub fast_interval: Duration,
    /// Poll interval while ready (reduce cost).
    pub slow_interval: Duration,
    /// Bound on waiting for the dev server's readiness marker.
    pub marker_timeout: Duration,
    pub marker_poll: Duration,
    /// Settle time between killing the old dev server and relaunching.
    pub restart_settle: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            optimistic_http: true,
            http_timeout: Duration::from_secs(3),
            fast_interval: Duration::from_secs(5),
            slow_interval: Duration::from_secs(30),
            marker_timeout: Duration::from_secs(60),
            marker_poll: Duration::from_secs(2),
            restart_settle: Duration::from_secs(1),
        }
    }
}

pub struct HealthMonitor {
    provider: Arc<dyn SandboxProvider>,
    controller: Arc<SandboxController>,
    snapshots: Arc<dyn SnapshotStore>,
    registry: Arc<ProjectRegistry>,
    policy: HealthPolicy,
    http: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        controller: Arc<SandboxController>,
        snapshots: Arc<dyn SnapshotStore>,
        registry: Arc<ProjectRegistry>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            provider,
            controller,
            snapshots,
            registry,
            policy,
            http: reqwest::Client::new(),
        }
    }

    /// Probe a project's sandbox and classify its liveness.
    ///
    /// Never returns a raw error: failures surface as status values. With
    /// `auto_restart`, an unreachable sandbox kicks off the background
    /// recovery flow and the immediate answer is `starting`.
    pub async fn check(self: &Arc<Self>, project_id: &str, auto_restart: bool) -> HealthReport {
        let record = match persistence::load_sandbox(self.registry.db_path(), project_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    component = "health_monitor",
                    event = "health.load_failed",
                    project_id = %project_id,
                    error = %e,
                    "Failed to load sandbox record"
                );
                return HealthReport::error("Could not read sandbox state");
            }
        };

        let Some(record) = record else {
            return HealthReport::sleeping();
        };

        // A create is in flight — report starting and leave it alone.
        if record.status == SandboxStatus::Starting {
            return HealthReport {
                healthy: false,
                status: HealthStatus::Starting,
                sandbox_alive: false,
                dev_server_running: false,
                url: record.dev_server_url,
                preview_code: record.preview_code,
                message: "Sandbox is starting".to_string(),
            };
        }

        let Some(sandbox_id) = record.sandbox_id.clone() else {
            return HealthReport::sleeping();
        };

        // Tier 0: is the instance itself reachable?
        if let Err(e) = self.provider.connect(&sandbox_id).await {
            info!(
                component = "health_monitor",
                event = "health.sandbox_unreachable",
                project_id = %project_id,
                sandbox_id = %sandbox_id,
                error = %e,
                auto_restart = auto_restart,
                "Sandbox unreachable, clearing reference"
            );
            let (_, actions) = lifecycle::step(record.status, Signal::ProbeDead);
            if actions.contains(&Action::ClearReference) {
                let _ = self
                    .registry
                    .persist()
                    .send(PersistCommand::SandboxClear {
                        project_id: project_id.to_string(),
                    })
                    .await;
            }

            if auto_restart {
                let monitor = self.clone();
                let project = project_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = monitor.recover(&project).await {
                        warn!(
                            component = "health_monitor",
                            event = "health.recovery_failed",
                            project_id = %project,
                            error = %e,
                            "Background recovery failed"
                        );
                        let _ = monitor
                            .registry
                            .persist()
                            .send(PersistCommand::SandboxStatus {
                                project_id: project.clone(),
                                status: SandboxStatus::Error,
                            })
                            .await;
                    }
                });
                return HealthReport {
                    healthy: false,
                    status: HealthStatus::Starting,
                    sandbox_alive: false,
                    dev_server_running: false,
                    url: None,
                    preview_code: None,
                    message: "Sandbox expired, restarting".to_string(),
                };
            }

            return HealthReport {
                healthy: false,
                status: HealthStatus::Sleeping,
                sandbox_alive: false,
                dev_server_running: false,
                url: None,
                preview_code: None,
                message: "Sandbox expired".to_string(),
            };
        }

        // Tier 1: process existence, with a secondary name pattern before
        // declaring dead.
        let process_alive = self.process_alive(&sandbox_id, DEV_SERVER_PATTERN).await
            || self
                .process_alive(&sandbox_id, DEV_SERVER_PATTERN_FALLBACK)
                .await;

        if !process_alive {
            return HealthReport {
                healthy: false,
                status: HealthStatus::Error,
                sandbox_alive: true,
                dev_server_running: false,
                url: record.dev_server_url,
                preview_code: record.preview_code,
                message: "Dev server is not running".to_string(),
            };
        }

        // Tier 2: is the port listening yet?
        if !self.port_listening(&sandbox_id).await {
            return HealthReport {
                healthy: false,
                status: HealthStatus::MetroStarting,
                sandbox_alive: true,
                dev_server_running: false,
                url: record.dev_server_url,
                preview_code: record.preview_code,
                message: "Dev server is starting".to_string(),
            };
        }

        // Tier 3: application-level probe with a short timeout. Without a
        // discovered URL yet, probe the provider's public hostname.
        let probe_url = match record.dev_server_url.clone() {
            Some(url) => Some(url),
            None => self
                .provider
                .public_host(&sandbox_id, DEV_SERVER_PORT)
                .await
                .ok()
                .map(|host| format!("http://{}", host)),
        };
        let http_ok = self.http_probe(probe_url.as_deref()).await;

        if http_ok {
            return HealthReport {
                healthy: true,
                status: HealthStatus::Ready,
                sandbox_alive: true,
                dev_server_running: true,
                url: record.dev_server_url,
                preview_code: record.preview_code,
                message: "App is running".to_string(),
            };
        }

        if self.policy.optimistic_http {
            // Alive-but-unconfirmed: don't force a restart on a slow boot.
            debug!(
                component = "health_monitor",
                event = "health.http_unconfirmed",
                project_id = %project_id,
                "Process and port alive, HTTP probe failed; reporting healthy"
            );
            return HealthReport {
                healthy: true,
                status: HealthStatus::Ready,
                sandbox_alive: true,
                dev_server_running: true,
                url: record.dev_server_url,
                preview_code: record.preview_code,
                message: "App is running (dev server not yet confirmed)".to_string(),
            };
        }

        HealthReport {
            healthy: false,
            status: HealthStatus::MetroStarting,
            sandbox_alive: true,
            dev_server_running: false,
            url: record.dev_server_url,
            preview_code: record.preview_code,
            message: "Dev server did not answer the readiness probe".to_string(),
        }
    }

    async fn process_alive(&self, sandbox_id: &str, pattern: &str) -> bool {
        match self
            .provider
            .run_command(
                sandbox_id,
                &format!("pgrep -f '{}'", pattern),
                ExecOpts::default(),
            )
            .await
        {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }

    async fn port_listening(&self, sandbox_id: &str) -> bool {
        match self
            .provider
            .run_command(
                sandbox_id,
                &format!("nc -z 127.0.0.1 {}", DEV_SERVER_PORT),
                ExecOpts::default(),
            )
            .await
        {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }

    async fn http_probe(&self, url: Option<&str>) -> bool {
        let Some(url) = url else {
            return false;
        };
        let probe_url = status_probe_url(url);
        match self
            .http
            .get(&probe_url)
            .timeout(self.policy.http_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Full recovery flow: recreate the sandbox, restore the latest source
    /// snapshot, reinstall dependencies, relaunch the dev server. Runs in
    /// the background; callers observe progress through health polls.
    pub async fn recover(&self, project_id: &str) -> anyhow::Result<()> {
        info!(
            component = "health_monitor",
            event = "health.recovery.started",
            project_id = %project_id,
            "Recreating sandbox"
        );

        let sandbox = self.controller.create(project_id).await?;

        if let Some(snapshot_url) = self.snapshots.latest_snapshot_url(project_id).await? {
            self.provider
                .run_command(
                    &sandbox.sandbox_id,
                    &format!(
                        "mkdir -p /workspace/app && curl -fsSL '{}' | tar xz -C /workspace/app",
                        snapshot_url
                    ),
                    ExecOpts {
                        timeout: Duration::from_secs(120),
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            debug!(
                component = "health_monitor",
                event = "health.recovery.no_snapshot",
                project_id = %project_id,
                "No snapshot to restore, starting from the template"
            );
        }

        self.provider
            .run_command(
                &sandbox.sandbox_id,
                "cd /workspace/app && npm install --no-audit --no-fund",
                ExecOpts {
                    timeout: Duration::from_secs(300),
                    ..Default::default()
                },
            )
            .await?;

        self.restart_dev_server(&sandbox.sandbox_id).await?;

        info!(
            component = "health_monitor",
            event = "health.recovery.finished",
            project_id = %project_id,
            sandbox_id = %sandbox.sandbox_id,
            "Recovery flow finished"
        );
        Ok(())
    }

    /// Kill any existing dev-server process, relaunch it detached, then
    /// wait for the readiness marker in its output. Marker absence after
    /// the bounded wait only logs a warning — if the port is listening the
    /// server is treated as up (optimistic completion).
    ///
    /// Returns whether the marker was observed.
    pub async fn restart_dev_server(&self, sandbox_id: &str) -> Result<bool, ProviderError> {
        // "No such process" is success here, hence the `|| true`.
        self.provider
            .run_command(
                sandbox_id,
                &format!("pkill -f '{}' || true", DEV_SERVER_PATTERN),
                ExecOpts::default(),
            )
            .await?;

        tokio::time::sleep(self.policy.restart_settle).await;

        self.provider
            .run_command(
                sandbox_id,
                &format!(
                    "cd /workspace/app && npx expo start --port {} > /tmp/devserver.log 2>&1",
                    DEV_SERVER_PORT
                ),
                ExecOpts {
                    background: true,
                    ..Default::default()
                },
            )
            .await?;

        let deadline = tokio::time::Instant::now() + self.policy.marker_timeout;
        loop {
            let output = self
                .provider
                .run_command(
                    sandbox_id,
                    "tail -n 200 /tmp/devserver.log",
                    ExecOpts::default(),
                )
                .await?;
            if DEV_SERVER_READY.is_match(&output.stdout) {
                info!(
                    component = "health_monitor",
                    event = "health.dev_server.ready_marker",
                    sandbox_id = %sandbox_id,
                    "Dev server reported ready"
                );
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.policy.marker_poll).await;
        }

        warn!(
            component = "health_monitor",
            event = "health.dev_server.marker_timeout",
            sandbox_id = %sandbox_id,
            "Readiness marker not seen before timeout, continuing anyway"
        );
        Ok(false)
    }

    /// Spawn the adaptive poll loop for a project: fast interval while not
    /// ready, slow while ready. The interval switch takes effect on the
    /// tick after any status-changing check. Status changes are broadcast.
    pub fn spawn_poll_loop(self: &Arc<Self>, project_id: &str, auto_restart: bool) {
        let monitor = self.clone();
        let project = project_id.to_string();

        let task = tokio::spawn(async move {
            let mut last_status: Option<HealthStatus> = None;
            loop {
                let report = monitor.check(&project, auto_restart).await;

                if last_status != Some(report.status) {
                    debug!(
                        component = "health_monitor",
                        event = "health.status_changed",
                        project_id = %project,
                        status = ?report.status,
                        "Health status changed"
                    );
                    last_status = Some(report.status);
                    monitor
                        .registry
                        .broadcast(
                            &project,
                            ServerMessage::HealthChanged {
                                project_id: project.clone(),
                                report: report.clone(),
                            },
                        )
                        .await;
                }

                let interval = if report.status == HealthStatus::Ready {
                    monitor.policy.slow_interval
                } else {
                    monitor.policy.fast_interval
                };
                tokio::time::sleep(interval).await;
            }
        });

        self.registry.set_health_task(project_id, task);
    }
}

/// Expo's dev server answers on `/status`; fall back to the bare URL for
/// anything that is not http(s) (e.g. `exp://` deep links).
fn status_probe_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        format!("{}/status", url.trim_end_matches('/'))
    } else if let Some(rest) = url.strip_prefix("exp://") {
        format!("http://{}/status", rest.trim_end_matches('/'))
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::flush_batch;
    use crate::provider::mock::{MockProvider, MockSnapshots};
    use crate::provider::{ExecOutput, ResourceProfile};
    use std::path::PathBuf;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn exec(exit_code: i64, stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
            pid: None,
        }
    }

    fn test_policy() -> HealthPolicy {
        HealthPolicy {
            http_timeout: Duration::from_millis(300),
            marker_timeout: Duration::from_millis(50),
            marker_poll: Duration::from_millis(10),
            restart_settle: Duration::from_millis(0),
            ..Default::default()
        }
    }

    struct Fixture {
        monitor: Arc<HealthMonitor>,
        provider: Arc<MockProvider>,
        persist_rx: mpsc::Receiver<PersistCommand>,
        _dir: tempfile::TempDir,
        db: PathBuf,
    }

    fn fixture(provider: Arc<MockProvider>, policy: HealthPolicy) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("driftbox.db");
        let (tx, rx) = mpsc::channel(256);
        let registry = Arc::new(ProjectRegistry::new(db.clone(), tx.clone()));
        let controller = Arc::new(SandboxController::new(
            provider.clone(),
            tx,
            ResourceProfile::default(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            provider.clone(),
            controller,
            Arc::new(MockSnapshots::default()),
            registry,
            policy,
        ));
        Fixture {
            monitor,
            provider,
            persist_rx: rx,
            _dir: dir,
            db,
        }
    }

    fn seed_ready_sandbox(db: &PathBuf, sandbox_id: &str, url: Option<&str>) {
        let mut batch = vec![PersistCommand::SandboxProvisioned {
            project_id: "proj-1".into(),
            sandbox_id: sandbox_id.into(),
        }];
        if let Some(url) = url {
            batch.push(PersistCommand::SandboxUrl {
                project_id: "proj-1".into(),
                dev_server_url: Some(url.into()),
                preview_code: None,
            });
        }
        flush_batch(db, batch).expect("seed");
    }

    fn drain(rx: &mut mpsc::Receiver<PersistCommand>) -> Vec<PersistCommand> {
        let mut cmds = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    /// One-shot HTTP listener answering 200 to whatever connects.
    async fn serve_ok_once() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                use tokio::io::AsyncReadExt;
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn no_sandbox_row_reports_sleeping() {
        let f = fixture(Arc::new(MockProvider::new()), test_policy());
        let report = f.monitor.check("proj-1", false).await;
        assert_eq!(report.status, HealthStatus::Sleeping);
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn starting_record_is_left_alone() {
        let f = fixture(Arc::new(MockProvider::new()), test_policy());
        flush_batch(
            &f.db,
            vec![PersistCommand::SandboxStarting {
                project_id: "proj-1".into(),
            }],
        )
        .expect("seed");

        let report = f.monitor.check("proj-1", true).await;
        assert_eq!(report.status, HealthStatus::Starting);
        // No recovery kicked off, no reference cleared.
        assert!(f.provider.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn optimistic_boot_reports_healthy_despite_http_failure() {
        let provider = Arc::new(MockProvider::with_alive("sbx-1"));
        // Process and port probes pass; the URL points at a closed port.
        let mut f = fixture(provider, test_policy());
        seed_ready_sandbox(&f.db, "sbx-1", Some("http://127.0.0.1:9"));

        let report = f.monitor.check("proj-1", false).await;
        assert!(report.healthy);
        assert_eq!(report.status, HealthStatus::Ready);
        assert!(report.dev_server_running);
        assert!(drain(&mut f.persist_rx).is_empty());
    }

    #[tokio::test]
    async fn strict_policy_demotes_unconfirmed_http() {
        let provider = Arc::new(MockProvider::with_alive("sbx-1"));
        let policy = HealthPolicy {
            optimistic_http: false,
            ..test_policy()
        };
        let f = fixture(provider, policy);
        seed_ready_sandbox(&f.db, "sbx-1", Some("http://127.0.0.1:9"));

        let report = f.monitor.check("proj-1", false).await;
        assert!(!report.healthy);
        assert_eq!(report.status, HealthStatus::MetroStarting);
    }

    #[tokio::test]
    async fn http_probe_success_reports_ready() {
        let provider = Arc::new(MockProvider::with_alive("sbx-1"));
        let f = fixture(provider, test_policy());
        let url = serve_ok_once().await;
        seed_ready_sandbox(&f.db, "sbx-1", Some(&url));

        let report = f.monitor.check("proj-1", false).await;
        assert!(report.healthy);
        assert_eq!(report.message, "App is running");
    }

    #[tokio::test]
    async fn dead_process_with_fallback_pattern_reports_error() {
        let provider = Arc::new(MockProvider::with_alive("sbx-1"));
        provider.respond("pgrep", exec(1, ""));
        let f = fixture(provider.clone(), test_policy());
        seed_ready_sandbox(&f.db, "sbx-1", None);

        let report = f.monitor.check("proj-1", false).await;
        assert_eq!(report.status, HealthStatus::Error);
        assert!(report.sandbox_alive);
        assert!(!report.dev_server_running);

        // Both the primary and the secondary pattern were tried.
        let commands = provider.commands.lock().unwrap();
        let pgreps: Vec<_> = commands
            .iter()
            .filter(|(_, cmd)| cmd.starts_with("pgrep"))
            .collect();
        assert_eq!(pgreps.len(), 2);
    }

    #[tokio::test]
    async fn port_not_listening_reports_metro_starting() {
        let provider = Arc::new(MockProvider::with_alive("sbx-1"));
        provider.respond("nc -z", exec(1, ""));
        let f = fixture(provider, test_policy());
        seed_ready_sandbox(&f.db, "sbx-1", None);

        let report = f.monitor.check("proj-1", false).await;
        assert_eq!(report.status, HealthStatus::MetroStarting);
        assert!(report.sandbox_alive);
    }

    #[tokio::test]
    async fn expired_sandbox_clears_reference_without_auto_restart() {
        // Record points at an instance the provider no longer knows.
        let provider = Arc::new(MockProvider::new());
        let mut f = fixture(provider, test_policy());
        seed_ready_sandbox(&f.db, "sbx-expired", None);

        let report = f.monitor.check("proj-1", false).await;
        assert_eq!(report.status, HealthStatus::Sleeping);
        assert_eq!(report.message, "Sandbox expired");

        let cmds = drain(&mut f.persist_rx);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, PersistCommand::SandboxClear { .. })));
    }

    #[tokio::test]
    async fn expired_sandbox_with_auto_restart_reports_starting() {
        let provider = Arc::new(MockProvider::new());
        let f = fixture(provider, test_policy());
        seed_ready_sandbox(&f.db, "sbx-expired", None);

        let report = f.monitor.check("proj-1", true).await;
        assert_eq!(report.status, HealthStatus::Starting);
        assert_eq!(report.message, "Sandbox expired, restarting");
    }

    #[tokio::test]
    async fn recovery_restores_snapshot_installs_and_relaunches() {
        let provider = Arc::new(MockProvider::new());
        provider.respond("tail", exec(0, "Metro waiting on exp://10.0.0.5:8081"));
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("driftbox.db");
        let (tx, _rx) = mpsc::channel(256);
        let registry = Arc::new(ProjectRegistry::new(db, tx.clone()));
        let controller = Arc::new(SandboxController::new(
            provider.clone(),
            tx,
            ResourceProfile::default(),
        ));
        let snapshots = Arc::new(MockSnapshots {
            url: Some("https://snapshots.example.dev/proj-1/latest.tgz".to_string()),
        });
        let monitor = Arc::new(HealthMonitor::new(
            provider.clone(),
            controller,
            snapshots,
            registry,
            test_policy(),
        ));

        monitor.recover("proj-1").await.expect("recover");

        assert!(provider.ran("curl -fsSL 'https://snapshots.example.dev/proj-1/latest.tgz'"));
        assert!(provider.ran("npm install"));
        assert!(provider.ran("pkill -f 'expo start'"));
        assert!(provider.ran("npx expo start --port 8081"));
    }

    #[tokio::test]
    async fn marker_timeout_is_not_fatal() {
        let provider = Arc::new(MockProvider::with_alive("sbx-1"));
        // tail never shows the marker
        provider.respond("tail", exec(0, "nothing interesting"));
        let f = fixture(provider, test_policy());

        let marker_seen = f
            .monitor
            .restart_dev_server("sbx-1")
            .await
            .expect("restart completes");
        assert!(!marker_seen);
    }
}
