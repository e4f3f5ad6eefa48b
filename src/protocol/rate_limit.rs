//! Per-sender fixed-window rate limiting.
//!
//! The window opens on a sender's first message and resets a fixed period
//! later. Bursts at window boundaries are allowed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    senders: HashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self::with_window(limit, RATE_LIMIT_WINDOW)
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            senders: HashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one message from `sender`. Returns `false` if over budget.
    pub fn try_acquire(&mut self, sender: &str) -> bool {
        let now = Instant::now();
        let window = self
            .senders
            .entry(sender.to_string())
            .or_insert(Window {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }
        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }

    /// Messages counted for `sender` in its current window.
    pub fn count(&self, sender: &str) -> u32 {
        let now = Instant::now();
        self.senders
            .get(sender)
            .filter(|w| now < w.reset_at)
            .map_or(0, |w| w.count)
    }

    /// Forget windows that have expired. Returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.senders.len();
        self.senders.retain(|_, w| now < w.reset_at);
        before - self.senders.len()
    }

    pub fn tracked_senders(&self) -> usize {
        self.senders.len()
    }
}
