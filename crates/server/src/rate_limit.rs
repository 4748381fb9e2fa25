//! Build-trigger rate limiting
//!
//! Owns the mapping from key to `{count, window_end}` with an injected
//! clock so tests never touch real timers. Expired windows are dropped
//! lazily on read; a periodic sweep bounds memory for keys that never
//! come back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u32,
    window_end: Instant,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    max_requests: u32,
    window: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            max_requests,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `key`. Returns false when the key is over its
    /// window budget. An expired window is reset on read.
    pub fn check(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            window_end: now + self.window,
        });

        if now >= entry.window_end {
            entry.count = 0;
            entry.window_end = now + self.window;
        }

        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop every entry whose window has passed.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.window_end);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(
                component = "rate_limiter",
                event = "rate_limit.sweep",
                evicted = evicted,
                "Evicted expired rate-limit entries"
            );
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Periodic sweep, one window apart — stale keys survive at most one
    /// extra window.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = self.clone();
        let interval = limiter.window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }
}
