//! Reconnecting subscription
//!
//! One `SubscriptionManager` owns one logical channel onto a project's
//! event stream. Connection loss of any kind funnels into the same path:
//! `connected → reconnecting → connecting`, with a supervised timer whose
//! delay is the pure `delay_for_attempt` function. Teardown bumps an epoch
//! counter first, so no timer or socket callback fires after it begins.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use driftbox_protocol::{ClientMessage, EventRecord, HealthReport, ServerMessage};

use crate::backoff::delay_for_attempt;
use crate::dedup::RecentIds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// What the consumer receives.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Event(EventRecord),
    Health(HealthReport),
    Status(SubscriptionStatus),
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub server_url: String,
    pub project_id: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// None = retry forever.
    pub max_retries: Option<u32>,
    pub dedup_capacity: usize,
}

impl SubscriptionConfig {
    pub fn new(server_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            project_id: project_id.into(),
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
            max_retries: None,
            dedup_capacity: 512,
        }
    }
}

struct Shared {
    config: SubscriptionConfig,
    status: Mutex<SubscriptionStatus>,
    retry_count: AtomicU32,
    /// Bumped on every manual disconnect/reconnect; tasks carry the epoch
    /// they were spawned under and go inert when it no longer matches.
    epoch: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    conn: Mutex<Option<JoinHandle<()>>>,
    /// Command channel into the live connection. Teardown takes this slot
    /// BEFORE issuing the remote unsubscribe, so a close-triggered callback
    /// cannot re-enter teardown through it.
    cmd_tx: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    seen: Mutex<RecentIds>,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    events_tx: mpsc::Sender<SubscriptionEvent>,
}

pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    /// Create the subscription and start connecting immediately.
    pub fn connect(config: SubscriptionConfig) -> (Self, mpsc::Receiver<SubscriptionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let dedup_capacity = config.dedup_capacity;
        let shared = Arc::new(Shared {
            config,
            status: Mutex::new(SubscriptionStatus::Idle),
            retry_count: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            timer: Mutex::new(None),
            conn: Mutex::new(None),
            cmd_tx: Mutex::new(None),
            seen: Mutex::new(RecentIds::new(dedup_capacity)),
            last_event_at: Mutex::new(None),
            events_tx,
        });

        set_status(&shared, SubscriptionStatus::Connecting);
        let epoch = shared.epoch.load(Ordering::SeqCst);
        let task = tokio::spawn(run_connection(shared.clone(), epoch));
        *shared.conn.lock().unwrap() = Some(task);

        (Self { shared }, events_rx)
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.shared.status.lock().unwrap()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    /// Manual disconnect: cancels any pending reconnect timer, sends a
    /// best-effort unsubscribe, and forces `idle`. No callback fires after
    /// this begins.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        shared.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(timer) = shared.timer.lock().unwrap().take() {
            timer.abort();
        }

        // Null the channel reference first, then unsubscribe remotely.
        let taken = shared.cmd_tx.lock().unwrap().take();
        if let Some(tx) = taken {
            let _ = tx.try_send(ClientMessage::Unsubscribe {
                project_id: shared.config.project_id.clone(),
            });
        }

        if let Some(conn) = shared.conn.lock().unwrap().take() {
            conn.abort();
        }

        set_status(shared, SubscriptionStatus::Idle);
        info!(
            component = "subscription",
            event = "subscription.disconnected",
            project_id = %shared.config.project_id,
            "Subscription torn down"
        );
    }

    /// Manual reconnect: zero the retry counter and re-enter `connecting`
    /// immediately, discarding any pending timer.
    pub fn reconnect(&self) {
        let shared = &self.shared;
        shared.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(timer) = shared.timer.lock().unwrap().take() {
            timer.abort();
        }
        let _ = shared.cmd_tx.lock().unwrap().take();
        if let Some(conn) = shared.conn.lock().unwrap().take() {
            conn.abort();
        }

        shared.retry_count.store(0, Ordering::SeqCst);
        set_status(shared, SubscriptionStatus::Connecting);

        let epoch = shared.epoch.load(Ordering::SeqCst);
        let task = tokio::spawn(run_connection(shared.clone(), epoch));
        *shared.conn.lock().unwrap() = Some(task);
    }
}

fn stale(shared: &Shared, epoch: u64) -> bool {
    shared.epoch.load(Ordering::SeqCst) != epoch
}

fn set_status(shared: &Arc<Shared>, status: SubscriptionStatus) {
    let changed = {
        let mut current = shared.status.lock().unwrap();
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    };
    if changed {
        let _ = shared
            .events_tx
            .try_send(SubscriptionEvent::Status(status));
    }
}

async fn run_connection(shared: Arc<Shared>, epoch: u64) {
    if stale(&shared, epoch) {
        return;
    }

    let (ws, _) = match connect_async(&shared.config.server_url).await {
        Ok(ok) => ok,
        Err(e) => {
            debug!(
                component = "subscription",
                event = "subscription.connect_failed",
                error = %e,
                "WebSocket connect failed"
            );
            schedule_reconnect(&shared, epoch);
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientMessage>(32);
    {
        if stale(&shared, epoch) {
            return;
        }
        *shared.cmd_tx.lock().unwrap() = Some(cmd_tx);
    }

    // Catch-up from the last delivered event covers the gap accumulated
    // while disconnected; overlap with push delivery is dedup'd by id.
    let since = *shared.last_event_at.lock().unwrap();
    let subscribe = ClientMessage::Subscribe {
        project_id: shared.config.project_id.clone(),
        since,
    };
    let payload = match serde_json::to_string(&subscribe) {
        Ok(p) => p,
        Err(_) => return,
    };
    if sink.send(Message::Text(payload.into())).await.is_err() {
        schedule_reconnect(&shared, epoch);
        return;
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if let Ok(payload) = serde_json::to_string(&cmd) {
                    if sink.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(server_msg) = serde_json::from_str::<ServerMessage>(&text) {
                            handle_server_message(&shared, server_msg).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(
                            component = "subscription",
                            event = "subscription.stream_error",
                            error = %e,
                            "WebSocket stream error"
                        );
                        break;
                    }
                }
            }
        }
    }

    if !stale(&shared, epoch) {
        let _ = shared.cmd_tx.lock().unwrap().take();
        schedule_reconnect(&shared, epoch);
    }
}

async fn handle_server_message(shared: &Arc<Shared>, msg: ServerMessage) {
    match msg {
        ServerMessage::Subscribed { events, .. } => {
            // Successful (re)subscription resets the retry counter.
            shared.retry_count.store(0, Ordering::SeqCst);
            set_status(shared, SubscriptionStatus::Connected);
            for event in events {
                deliver_event(shared, event).await;
            }
        }
        ServerMessage::EventAppended { event, .. } => {
            deliver_event(shared, event).await;
        }
        ServerMessage::HealthChanged { report, .. } => {
            let _ = shared
                .events_tx
                .send(SubscriptionEvent::Health(report))
                .await;
        }
        ServerMessage::Error { code, message, .. } => {
            warn!(
                component = "subscription",
                event = "subscription.server_error",
                code = %code,
                message = %message,
                "Server reported an error"
            );
        }
        _ => {}
    }
}

async fn deliver_event(shared: &Arc<Shared>, event: EventRecord) {
    let fresh = shared.seen.lock().unwrap().insert(&event.id);
    if !fresh {
        return;
    }
    {
        let mut last = shared.last_event_at.lock().unwrap();
        if last.map(|t| event.created_at > t).unwrap_or(true) {
            *last = Some(event.created_at);
        }
    }
    let _ = shared
        .events_tx
        .send(SubscriptionEvent::Event(event))
        .await;
}

fn schedule_reconnect(shared: &Arc<Shared>, epoch: u64) {
    if stale(shared, epoch) {
        return;
    }

    let attempt = shared.retry_count.fetch_add(1, Ordering::SeqCst) + 1;

    if let Some(max) = shared.config.max_retries {
        if attempt > max {
            warn!(
                component = "subscription",
                event = "subscription.retries_exhausted",
                attempts = attempt - 1,
                "Giving up on reconnect"
            );
            set_status(shared, SubscriptionStatus::Error);
            return;
        }
    }

    set_status(shared, SubscriptionStatus::Reconnecting);
    let delay = delay_for_attempt(attempt, shared.config.base_delay, shared.config.max_delay);
    debug!(
        component = "subscription",
        event = "subscription.reconnect_scheduled",
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        "Reconnect scheduled"
    );

    let shared_for_timer = shared.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if stale(&shared_for_timer, epoch) {
            return;
        }
        set_status(&shared_for_timer, SubscriptionStatus::Connecting);
        let task = tokio::spawn(run_connection(shared_for_timer.clone(), epoch));
        *shared_for_timer.conn.lock().unwrap() = Some(task);
    });

    if let Some(old) = shared.timer.lock().unwrap().replace(timer) {
        old.abort();
    }
}
