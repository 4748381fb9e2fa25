//! Agent execution
//!
//! Launches the coding agent inside a project's sandbox, streams its NDJSON
//! stdout through the ingest pipeline, and persists + broadcasts the typed
//! events. The HTTP trigger returns as soon as the background task is
//! launched; everything after that is observed through the event stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use driftbox_ingest::{find_preview_url, parse_line, LineAssembler};
use driftbox_protocol::{
    new_id, AgentEvent, EventRecord, ResultOutcome, ServerMessage, SystemSubtype,
};

use crate::persistence::{self, PersistCommand};
use crate::provider::{ExecOpts, ProviderError, SandboxProvider};
use crate::state::ProjectRegistry;

/// Working directory of the generated app inside every sandbox image.
pub const AGENT_WORKDIR: &str = "/workspace/app";

/// Prompts can exceed argv limits, so they travel through a file.
const PROMPT_PATH: &str = "/tmp/driftbox-prompt.txt";

/// Upper bound on a single agent run; the provider enforces it remotely.
const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Cap on the event window kept for preview-URL scanning.
const URL_SCAN_WINDOW: usize = 256;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A launched agent run. `task` resolves when the stream is fully drained
/// and the terminal event is persisted.
pub struct StartedRun {
    pub pid: Option<i64>,
    pub task: JoinHandle<()>,
}

pub struct AgentExecutor {
    provider: Arc<dyn SandboxProvider>,
    registry: Arc<ProjectRegistry>,
}

impl AgentExecutor {
    pub fn new(provider: Arc<dyn SandboxProvider>, registry: Arc<ProjectRegistry>) -> Self {
        Self { provider, registry }
    }

    /// Launch the agent, fresh or resuming `resume_session_id`.
    ///
    /// The pid is recorded before returning so a later `stop()` can signal
    /// it. Any previous pid is assumed stale — the session record is always
    /// cleared on completion, and callers serialize starts per project.
    pub async fn start(
        &self,
        project_id: &str,
        user_id: &str,
        sandbox_id: &str,
        prompt: &str,
        resume_session_id: Option<&str>,
    ) -> Result<StartedRun, ExecutorError> {
        self.provider
            .write_file(sandbox_id, PROMPT_PATH, prompt.as_bytes())
            .await?;

        let mut cmd = format!(
            "cd {} && claude -p \"$(cat {})\" --output-format stream-json --verbose",
            AGENT_WORKDIR, PROMPT_PATH,
        );
        if let Some(sid) = resume_session_id {
            cmd.push_str(&format!(" --resume {}", shell_quote(sid)));
        }

        info!(
            component = "agent_executor",
            event = "agent.spawn",
            project_id = %project_id,
            sandbox_id = %sandbox_id,
            resume_session_id = ?resume_session_id,
            "Launching agent in sandbox"
        );

        let stream = self
            .provider
            .stream_command(
                sandbox_id,
                &cmd,
                ExecOpts {
                    timeout: RUN_TIMEOUT,
                    ..Default::default()
                },
            )
            .await?;

        let pid = stream.pid;
        if let Some(pid) = pid {
            let _ = self
                .registry
                .persist()
                .send(PersistCommand::SessionPidRecord {
                    project_id: project_id.to_string(),
                    pid,
                })
                .await;
        }

        let task = tokio::spawn(run_stream(
            self.registry.clone(),
            project_id.to_string(),
            user_id.to_string(),
            resume_session_id.map(String::from),
            stream.chunks,
        ));

        Ok(StartedRun { pid, task })
    }

    /// Signal the recorded pid. A missing/stale pid or an unreachable
    /// sandbox means the agent is already stopped — never an error.
    pub async fn stop(&self, project_id: &str) -> Result<(), ExecutorError> {
        let db_path = self.registry.db_path();
        let session = persistence::load_session_for_project(db_path, project_id)
            .await
            .ok()
            .flatten();
        let sandbox = persistence::load_sandbox(db_path, project_id)
            .await
            .ok()
            .flatten();

        let pid = session.and_then(|s| s.pid);
        let sandbox_id = sandbox.and_then(|s| s.sandbox_id);

        if let (Some(pid), Some(sandbox_id)) = (pid, sandbox_id) {
            let result = self
                .provider
                .run_command(
                    &sandbox_id,
                    &format!("kill -TERM {} 2>/dev/null || true", pid),
                    ExecOpts::default(),
                )
                .await;
            match result {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(
                        component = "agent_executor",
                        event = "agent.stop.sandbox_gone",
                        project_id = %project_id,
                        "Sandbox gone on stop, treating as already stopped"
                    );
                }
                Err(e) => {
                    warn!(
                        component = "agent_executor",
                        event = "agent.stop.signal_failed",
                        project_id = %project_id,
                        error = %e,
                        "Failed to signal agent, clearing pid anyway"
                    );
                }
            }
        }

        let _ = self
            .registry
            .persist()
            .send(PersistCommand::SessionPidClear {
                project_id: project_id.to_string(),
            })
            .await;

        self.registry
            .broadcast(
                project_id,
                ServerMessage::AgentStopped {
                    project_id: project_id.to_string(),
                },
            )
            .await;

        Ok(())
    }
}

/// Drain the agent's output stream: reassemble lines, parse, persist,
/// broadcast. Guarantees a terminal `result` event and a cleared pid even
/// when the process dies without reporting one.
async fn run_stream(
    registry: Arc<ProjectRegistry>,
    project_id: String,
    user_id: String,
    resume_session_id: Option<String>,
    mut chunks: tokio::sync::mpsc::Receiver<bytes::Bytes>,
) {
    let mut assembler = LineAssembler::new();
    let mut session_id = resume_session_id;
    let mut seen_result = false;
    let mut url_found = false;
    let mut url_window: Vec<AgentEvent> = Vec::new();

    while let Some(chunk) = chunks.recv().await {
        for line in assembler.push(&chunk) {
            if let Some(event) = parse_line(&line) {
                handle_event(
                    &registry,
                    &project_id,
                    &user_id,
                    &mut session_id,
                    &mut seen_result,
                    &mut url_found,
                    &mut url_window,
                    event,
                )
                .await;
            }
        }
    }

    // Output may not terminate with a newline.
    if let Some(line) = assembler.finish() {
        if let Some(event) = parse_line(&line) {
            handle_event(
                &registry,
                &project_id,
                &user_id,
                &mut session_id,
                &mut seen_result,
                &mut url_found,
                &mut url_window,
                event,
            )
            .await;
        }
    }

    // Terminal guarantee: a run killed externally still ends in exactly one
    // observable result event.
    if !seen_result {
        info!(
            component = "agent_executor",
            event = "agent.run.no_terminal_result",
            project_id = %project_id,
            "Stream ended without a result event, appending cancelled"
        );
        persist_and_broadcast(
            &registry,
            &project_id,
            session_id.clone(),
            AgentEvent::Result {
                outcome: ResultOutcome::Cancelled,
                duration_ms: None,
                num_turns: None,
            },
        )
        .await;
    }

    let _ = registry
        .persist()
        .send(PersistCommand::SessionPidClear {
            project_id: project_id.clone(),
        })
        .await;

    registry
        .broadcast(
            &project_id,
            ServerMessage::AgentStopped {
                project_id: project_id.clone(),
            },
        )
        .await;

    info!(
        component = "agent_executor",
        event = "agent.run.ended",
        project_id = %project_id,
        "Agent run ended"
    );
}

#[allow(clippy::too_many_arguments)]
async fn handle_event(
    registry: &Arc<ProjectRegistry>,
    project_id: &str,
    user_id: &str,
    session_id: &mut Option<String>,
    seen_result: &mut bool,
    url_found: &mut bool,
    url_window: &mut Vec<AgentEvent>,
    event: AgentEvent,
) {
    // Session id binding: the first system/init wins and is attached to
    // every subsequent persisted event and the session registry.
    if let AgentEvent::System {
        subtype: SystemSubtype::Init,
        session_id: Some(sid),
    } = &event
    {
        if session_id.as_deref() != Some(sid.as_str()) {
            info!(
                component = "agent_executor",
                event = "agent.session.bound",
                project_id = %project_id,
                session_id = %sid,
                "Agent session initialized"
            );
            *session_id = Some(sid.clone());
            let _ = registry
                .persist()
                .send(PersistCommand::SessionBind {
                    project_id: project_id.to_string(),
                    session_id: sid.clone(),
                    user_id: user_id.to_string(),
                    working_directory: AGENT_WORKDIR.to_string(),
                })
                .await;
        }
    }

    if matches!(event, AgentEvent::Result { .. }) {
        *seen_result = true;
    }

    // Preview URL: tool_result content first, assistant text as fallback,
    // arrival order, first hit wins.
    if !*url_found
        && matches!(
            event,
            AgentEvent::ToolResult { .. } | AgentEvent::Assistant { .. }
        )
    {
        url_window.push(event.clone());
        if url_window.len() > URL_SCAN_WINDOW {
            url_window.remove(0);
        }
        if let Some(url) = find_preview_url(url_window) {
            *url_found = true;
            info!(
                component = "agent_executor",
                event = "agent.preview_url.found",
                project_id = %project_id,
                url = %url,
                "Dev server URL discovered in agent output"
            );
            let _ = registry
                .persist()
                .send(PersistCommand::SandboxUrl {
                    project_id: project_id.to_string(),
                    dev_server_url: Some(url),
                    preview_code: None,
                })
                .await;
        }
    }

    if event.is_persisted() {
        persist_and_broadcast(registry, project_id, session_id.clone(), event).await;
    }
}

async fn persist_and_broadcast(
    registry: &Arc<ProjectRegistry>,
    project_id: &str,
    session_id: Option<String>,
    event: AgentEvent,
) {
    let record = EventRecord {
        id: new_id(),
        project_id: project_id.to_string(),
        session_id,
        event,
        created_at: Utc::now(),
    };

    let _ = registry
        .persist()
        .send(PersistCommand::EventAppend {
            record: record.clone(),
        })
        .await;

    registry
        .broadcast(
            project_id,
            ServerMessage::EventAppended {
                project_id: project_id.to_string(),
                event: record,
            },
        )
        .await;
}

/// POSIX single-quote escaping for prompts passed through the remote shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
