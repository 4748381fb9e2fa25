//! Persistence layer - batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Batches writes so high-frequency sources (agent events, dev-server log
//! lines) are flushed when either the batch-size or the time threshold is
//! reached, whichever comes first. A failed command is logged and skipped —
//! a missed event is preferable to halting the pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use driftbox_protocol::{
    AgentEvent, AgentSessionRecord, EventRecord, SandboxRecord, SandboxStatus,
};

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Append an agent event to the durable log
    EventAppend { record: EventRecord },

    /// Bind the agent-runtime session id to a project (registry upsert)
    SessionBind {
        project_id: String,
        session_id: String,
        user_id: String,
        working_directory: String,
    },

    /// Record the live agent pid for a project
    SessionPidRecord { project_id: String, pid: i64 },

    /// Clear the agent pid for a project (run ended or stop observed)
    SessionPidClear { project_id: String },

    /// New sandbox create in flight: status `starting`, reference cleared
    SandboxStarting { project_id: String },

    /// Provisioning finished: store the instance id and mark `ready`
    SandboxProvisioned {
        project_id: String,
        sandbox_id: String,
    },

    /// Administrative status transition that keeps the instance id
    SandboxStatus {
        project_id: String,
        status: SandboxStatus,
    },

    /// Store the dev-server URL / preview code once discovered
    SandboxUrl {
        project_id: String,
        dev_server_url: Option<String>,
        preview_code: Option<String>,
    },

    /// Drop the persisted sandbox reference
    SandboxClear { project_id: String },

    /// Project teardown: events, session, sandbox reference
    ProjectDelete { project_id: String },
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run the persistence writer (call from tokio::spawn)
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.writer.started",
            db_path = %self.db_path.display(),
            "Persistence writer started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.batch.push(cmd);
                            if self.batch.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => {
                            // All senders dropped — final flush and exit.
                            self.flush().await;
                            return;
                        }
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flush.ok",
                    commands = count,
                    "Persisted batch"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush.failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush.panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

/// Open a connection with the pragmas every access path needs.
fn open_db(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    if let Some(parent) = db_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Idempotent schema setup. Called at startup and before each batch.
pub fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            session_id TEXT,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_events_project_time
            ON events(project_id, created_at);

         CREATE TABLE IF NOT EXISTS sessions (
            project_id TEXT PRIMARY KEY,
            session_id TEXT,
            user_id TEXT,
            working_directory TEXT,
            pid INTEGER,
            last_activity_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_sessions_session
            ON sessions(session_id);

         CREATE TABLE IF NOT EXISTS sandboxes (
            project_id TEXT PRIMARY KEY,
            sandbox_id TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            dev_server_url TEXT,
            preview_code TEXT
         );",
    )
}

/// Flush a batch of commands to SQLite (runs in a blocking thread)
pub(crate) fn flush_batch(
    db_path: &Path,
    batch: Vec<PersistCommand>,
) -> Result<usize, rusqlite::Error> {
    let conn = open_db(db_path)?;
    ensure_schema(&conn)?;

    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command.failed",
                error = %e,
                "Failed to execute command, continuing batch"
            );
        }
    }

    tx.commit()?;
    Ok(count)
}

fn status_str(status: SandboxStatus) -> &'static str {
    match status {
        SandboxStatus::Idle => "idle",
        SandboxStatus::Starting => "starting",
        SandboxStatus::Ready => "ready",
        SandboxStatus::Error => "error",
    }
}

fn parse_status(raw: &str) -> SandboxStatus {
    match raw {
        "starting" => SandboxStatus::Starting,
        "ready" => SandboxStatus::Ready,
        "error" => SandboxStatus::Error,
        _ => SandboxStatus::Idle,
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Execute a single persist command
fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::EventAppend { record } => {
            let payload = serde_json::to_string(&record.event)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            conn.execute(
                "INSERT INTO events (id, project_id, session_id, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.project_id,
                    record.session_id,
                    record.event.kind(),
                    payload,
                    fmt_ts(record.created_at),
                ],
            )?;
        }

        PersistCommand::SessionBind {
            project_id,
            session_id,
            user_id,
            working_directory,
        } => {
            conn.execute(
                "INSERT INTO sessions (project_id, session_id, user_id, working_directory, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_id) DO UPDATE SET
                   session_id = excluded.session_id,
                   user_id = excluded.user_id,
                   working_directory = excluded.working_directory,
                   last_activity_at = excluded.last_activity_at",
                params![project_id, session_id, user_id, working_directory, now_rfc3339()],
            )?;
        }

        PersistCommand::SessionPidRecord { project_id, pid } => {
            conn.execute(
                "INSERT INTO sessions (project_id, pid, last_activity_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id) DO UPDATE SET
                   pid = excluded.pid,
                   last_activity_at = excluded.last_activity_at",
                params![project_id, pid, now_rfc3339()],
            )?;
        }

        PersistCommand::SessionPidClear { project_id } => {
            conn.execute(
                "UPDATE sessions SET pid = NULL, last_activity_at = ?1 WHERE project_id = ?2",
                params![now_rfc3339(), project_id],
            )?;
        }

        PersistCommand::SandboxStarting { project_id } => {
            conn.execute(
                "INSERT INTO sandboxes (project_id, sandbox_id, status, created_at)
                 VALUES (?1, NULL, 'starting', ?2)
                 ON CONFLICT(project_id) DO UPDATE SET
                   sandbox_id = NULL,
                   status = 'starting',
                   created_at = excluded.created_at,
                   dev_server_url = NULL,
                   preview_code = NULL",
                params![project_id, now_rfc3339()],
            )?;
        }

        PersistCommand::SandboxProvisioned {
            project_id,
            sandbox_id,
        } => {
            conn.execute(
                "INSERT INTO sandboxes (project_id, sandbox_id, status, created_at)
                 VALUES (?1, ?2, 'ready', ?3)
                 ON CONFLICT(project_id) DO UPDATE SET
                   sandbox_id = excluded.sandbox_id,
                   status = 'ready'",
                params![project_id, sandbox_id, now_rfc3339()],
            )?;
        }

        PersistCommand::SandboxStatus { project_id, status } => {
            conn.execute(
                "UPDATE sandboxes SET status = ?1 WHERE project_id = ?2",
                params![status_str(status), project_id],
            )?;
        }

        PersistCommand::SandboxUrl {
            project_id,
            dev_server_url,
            preview_code,
        } => {
            conn.execute(
                "UPDATE sandboxes SET
                   dev_server_url = COALESCE(?1, dev_server_url),
                   preview_code = COALESCE(?2, preview_code)
                 WHERE project_id = ?3",
                params![dev_server_url, preview_code, project_id],
            )?;
        }

        PersistCommand::SandboxClear { project_id } => {
            conn.execute(
                "DELETE FROM sandboxes WHERE project_id = ?1",
                params![project_id],
            )?;
        }

        PersistCommand::ProjectDelete { project_id } => {
            conn.execute("DELETE FROM events WHERE project_id = ?1", params![project_id])?;
            conn.execute(
                "DELETE FROM sessions WHERE project_id = ?1",
                params![project_id],
            )?;
            conn.execute(
                "DELETE FROM sandboxes WHERE project_id = ?1",
                params![project_id],
            )?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Reads — each opens its own connection in spawn_blocking
// ---------------------------------------------------------------------------

/// Load the persisted sandbox reference for a project.
pub async fn load_sandbox(
    db_path: &Path,
    project_id: &str,
) -> Result<Option<SandboxRecord>, anyhow::Error> {
    let db_path = db_path.to_path_buf();
    let project = project_id.to_string();

    let record = tokio::task::spawn_blocking(move || -> Result<_, anyhow::Error> {
        if !db_path.exists() {
            return Ok(None);
        }
        let conn = open_db(&db_path)?;
        ensure_schema(&conn)?;

        let row = conn
            .query_row(
                "SELECT sandbox_id, status, created_at, dev_server_url, preview_code
                 FROM sandboxes WHERE project_id = ?1",
                params![project],
                |row| {
                    let status: String = row.get(1)?;
                    let created_at: String = row.get(2)?;
                    Ok(SandboxRecord {
                        project_id: project.clone(),
                        sandbox_id: row.get(0)?,
                        status: parse_status(&status),
                        created_at: parse_ts(&created_at),
                        dev_server_url: row.get(3)?,
                        preview_code: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
    .await??;

    Ok(record)
}

/// Load the session registry record for a project.
pub async fn load_session_for_project(
    db_path: &Path,
    project_id: &str,
) -> Result<Option<AgentSessionRecord>, anyhow::Error> {
    let db_path = db_path.to_path_buf();
    let project = project_id.to_string();

    let record = tokio::task::spawn_blocking(move || -> Result<_, anyhow::Error> {
        if !db_path.exists() {
            return Ok(None);
        }
        let conn = open_db(&db_path)?;
        ensure_schema(&conn)?;
        query_session(
            &conn,
            "SELECT project_id, session_id, user_id, working_directory, pid, last_activity_at
             FROM sessions WHERE project_id = ?1",
            &project,
        )
    })
    .await??;

    Ok(record)
}

/// Registry lookup by the agent runtime's opaque session id.
pub async fn load_session_by_id(
    db_path: &Path,
    session_id: &str,
) -> Result<Option<AgentSessionRecord>, anyhow::Error> {
    let db_path = db_path.to_path_buf();
    let session = session_id.to_string();

    let record = tokio::task::spawn_blocking(move || -> Result<_, anyhow::Error> {
        if !db_path.exists() {
            return Ok(None);
        }
        let conn = open_db(&db_path)?;
        ensure_schema(&conn)?;
        query_session(
            &conn,
            "SELECT project_id, session_id, user_id, working_directory, pid, last_activity_at
             FROM sessions WHERE session_id = ?1",
            &session,
        )
    })
    .await??;

    Ok(record)
}

fn query_session(
    conn: &Connection,
    sql: &str,
    key: &str,
) -> Result<Option<AgentSessionRecord>, anyhow::Error> {
    let row = conn
        .query_row(sql, params![key], |row| {
            let session_id: Option<String> = row.get(1)?;
            let last_activity: String = row.get(5)?;
            Ok(AgentSessionRecord {
                project_id: row.get(0)?,
                session_id: session_id.unwrap_or_default(),
                user_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                working_directory: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                pid: row.get(4)?,
                last_activity_at: parse_ts(&last_activity),
            })
        })
        .optional()?;
    Ok(row)
}

/// Catch-up read: events for a project after `since`, oldest first.
pub async fn select_events_since(
    db_path: &Path,
    project_id: &str,
    since: Option<DateTime<Utc>>,
    limit: usize,
) -> Result<Vec<EventRecord>, anyhow::Error> {
    let db_path = db_path.to_path_buf();
    let project = project_id.to_string();

    let events = tokio::task::spawn_blocking(move || -> Result<_, anyhow::Error> {
        if !db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = open_db(&db_path)?;
        ensure_schema(&conn)?;

        let since_str = since
            .map(fmt_ts)
            .unwrap_or_else(|| "1970-01-01T00:00:00.000000Z".to_string());

        let mut stmt = conn.prepare(
            "SELECT id, session_id, payload, created_at
             FROM events
             WHERE project_id = ?1 AND created_at > ?2
             ORDER BY created_at ASC
             LIMIT ?3",
        )?;

        let rows: Vec<EventRecord> = stmt
            .query_map(params![project, since_str, limit as i64], |row| {
                let id: String = row.get(0)?;
                let session_id: Option<String> = row.get(1)?;
                let payload: String = row.get(2)?;
                let created_at: String = row.get(3)?;
                Ok((id, session_id, payload, created_at))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, session_id, payload, created_at)| {
                // A payload that no longer parses is skipped, not fatal.
                let event: AgentEvent = serde_json::from_str(&payload).ok()?;
                Some(EventRecord {
                    id,
                    project_id: project.clone(),
                    session_id,
                    event,
                    created_at: parse_ts(&created_at),
                })
            })
            .collect();

        Ok(rows)
    })
    .await??;

    Ok(events)
}

/// Create a sender for the persistence writer
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftbox_protocol::{new_id, ResultOutcome};

    fn temp_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("driftbox.db");
        (dir, path)
    }

    fn event(project_id: &str, event: AgentEvent) -> EventRecord {
        EventRecord {
            id: new_id(),
            project_id: project_id.to_string(),
            session_id: None,
            event,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_round_trip_in_order() {
        let (_dir, db) = temp_db();

        let first = event(
            "proj-1",
            AgentEvent::Log {
                line: "Metro waiting".to_string(),
            },
        );
        let second = event(
            "proj-1",
            AgentEvent::Result {
                outcome: ResultOutcome::Success,
                duration_ms: None,
                num_turns: None,
            },
        );
        let other_project = event(
            "proj-2",
            AgentEvent::Log {
                line: "elsewhere".to_string(),
            },
        );

        flush_batch(
            &db,
            vec![
                PersistCommand::EventAppend { record: first.clone() },
                PersistCommand::EventAppend { record: second.clone() },
                PersistCommand::EventAppend { record: other_project },
            ],
        )
        .expect("flush");

        let events = select_events_since(&db, "proj-1", None, 100)
            .await
            .expect("select");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, first.id);
        assert_eq!(events[1].id, second.id);
        assert_eq!(events[1].event.kind(), "result");
    }

    #[tokio::test]
    async fn select_since_cursor_skips_older_events() {
        let (_dir, db) = temp_db();

        let old = event("proj-1", AgentEvent::Log { line: "old".into() });
        flush_batch(&db, vec![PersistCommand::EventAppend { record: old.clone() }])
            .expect("flush");

        let cursor = old.created_at;
        let mut newer = event("proj-1", AgentEvent::Log { line: "new".into() });
        newer.created_at = cursor + chrono::Duration::seconds(1);
        flush_batch(&db, vec![PersistCommand::EventAppend { record: newer.clone() }])
            .expect("flush");

        let events = select_events_since(&db, "proj-1", Some(cursor), 100)
            .await
            .expect("select");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, newer.id);
    }

    #[tokio::test]
    async fn pid_record_and_clear() {
        let (_dir, db) = temp_db();

        flush_batch(
            &db,
            vec![PersistCommand::SessionPidRecord {
                project_id: "proj-1".into(),
                pid: 4242,
            }],
        )
        .expect("flush");

        let session = load_session_for_project(&db, "proj-1")
            .await
            .expect("load")
            .expect("row");
        assert_eq!(session.pid, Some(4242));

        flush_batch(
            &db,
            vec![PersistCommand::SessionPidClear {
                project_id: "proj-1".into(),
            }],
        )
        .expect("flush");

        let session = load_session_for_project(&db, "proj-1")
            .await
            .expect("load")
            .expect("row");
        assert_eq!(session.pid, None);
    }

    #[tokio::test]
    async fn second_start_overwrites_pid_keeping_one() {
        let (_dir, db) = temp_db();

        // A stale pid from a previous run is replaced, never accumulated —
        // one row per project means at most one non-null pid.
        flush_batch(
            &db,
            vec![
                PersistCommand::SessionPidRecord {
                    project_id: "proj-1".into(),
                    pid: 100,
                },
                PersistCommand::SessionPidClear {
                    project_id: "proj-1".into(),
                },
                PersistCommand::SessionPidRecord {
                    project_id: "proj-1".into(),
                    pid: 200,
                },
            ],
        )
        .expect("flush");

        let session = load_session_for_project(&db, "proj-1")
            .await
            .expect("load")
            .expect("row");
        assert_eq!(session.pid, Some(200));
    }

    #[tokio::test]
    async fn session_bind_preserves_recorded_pid() {
        let (_dir, db) = temp_db();

        flush_batch(
            &db,
            vec![
                PersistCommand::SessionPidRecord {
                    project_id: "proj-1".into(),
                    pid: 99,
                },
                PersistCommand::SessionBind {
                    project_id: "proj-1".into(),
                    session_id: "sess-abc".into(),
                    user_id: "user-1".into(),
                    working_directory: "/workspace/app".into(),
                },
            ],
        )
        .expect("flush");

        let by_id = load_session_by_id(&db, "sess-abc")
            .await
            .expect("load")
            .expect("row");
        assert_eq!(by_id.project_id, "proj-1");
        assert_eq!(by_id.pid, Some(99));
    }

    #[tokio::test]
    async fn sandbox_starting_clears_stale_reference() {
        let (_dir, db) = temp_db();

        flush_batch(
            &db,
            vec![
                PersistCommand::SandboxProvisioned {
                    project_id: "proj-1".into(),
                    sandbox_id: "sbx-old".into(),
                },
                PersistCommand::SandboxUrl {
                    project_id: "proj-1".into(),
                    dev_server_url: Some("exp://old:8081".into()),
                    preview_code: None,
                },
                PersistCommand::SandboxStarting {
                    project_id: "proj-1".into(),
                },
            ],
        )
        .expect("flush");

        let record = load_sandbox(&db, "proj-1").await.expect("load").expect("row");
        assert_eq!(record.status, SandboxStatus::Starting);
        assert!(record.sandbox_id.is_none());
        assert!(record.dev_server_url.is_none());
    }

    #[tokio::test]
    async fn sandbox_clear_removes_row() {
        let (_dir, db) = temp_db();

        flush_batch(
            &db,
            vec![
                PersistCommand::SandboxProvisioned {
                    project_id: "proj-1".into(),
                    sandbox_id: "sbx-1".into(),
                },
                PersistCommand::SandboxClear {
                    project_id: "proj-1".into(),
                },
            ],
        )
        .expect("flush");

        assert!(load_sandbox(&db, "proj-1").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn project_delete_tears_down_everything() {
        let (_dir, db) = temp_db();

        flush_batch(
            &db,
            vec![
                PersistCommand::EventAppend {
                    record: event("proj-1", AgentEvent::Log { line: "x".into() }),
                },
                PersistCommand::SessionPidRecord {
                    project_id: "proj-1".into(),
                    pid: 1,
                },
                PersistCommand::SandboxProvisioned {
                    project_id: "proj-1".into(),
                    sandbox_id: "sbx-1".into(),
                },
                PersistCommand::ProjectDelete {
                    project_id: "proj-1".into(),
                },
            ],
        )
        .expect("flush");

        assert!(select_events_since(&db, "proj-1", None, 10)
            .await
            .expect("select")
            .is_empty());
        assert!(load_session_for_project(&db, "proj-1")
            .await
            .expect("load")
            .is_none());
        assert!(load_sandbox(&db, "proj-1").await.expect("load").is_none());
    }

    #[test]
    fn redelivered_lines_get_distinct_rows() {
        let (_dir, db) = temp_db();

        // Same content reprocessed: fresh id each time, both rows land.
        let a = event("proj-1", AgentEvent::Log { line: "dup".into() });
        let b = event("proj-1", AgentEvent::Log { line: "dup".into() });
        assert_ne!(a.id, b.id);

        let count = flush_batch(
            &db,
            vec![
                PersistCommand::EventAppend { record: a },
                PersistCommand::EventAppend { record: b },
            ],
        )
        .expect("flush");
        assert_eq!(count, 2);
    }
}
