//! Per-client request limiting.
//!
//! Fixed window per client IP: the first request opens a window, and at
//! most `max_requests` are admitted until it closes.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, trace};

use certgate_config::RateLimitConfig;

/// Windows tracked before expired entries are swept.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Limited { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    count: u32,
}

/// Fixed-window limiter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<IpAddr, Window>,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    /// Build a limiter, or `None` when limiting is disabled.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.window(), config.max_requests))
    }

    pub fn new(window: Duration, max_requests: u32) -> Self {
        debug!(
            window_secs = window.as_secs(),
            max_requests, "Created rate limiter"
        );
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
        }
    }

    /// Count a request from `client` at `now`.
    pub fn check(&self, client: IpAddr, now: Instant) -> RateLimitResult {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let mut entry = self.windows.entry(client).or_insert(Window {
            opened_at: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(entry.opened_at);
        if elapsed >= self.window {
            *entry = Window {
                opened_at: now,
                count: 0,
            };
        }

        if entry.count >= self.max_requests {
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.opened_at));
            debug!(client = %client, retry_after_secs = retry_after.as_secs(), "Rate limited");
            return RateLimitResult::Limited { retry_after };
        }

        entry.count += 1;
        trace!(client = %client, count = entry.count, "Request admitted");
        RateLimitResult::Allowed
    }

    /// Drop windows that have closed.
    pub fn sweep(&self, now: Instant) {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.opened_at) < self.window);
        trace!(before, after = self.windows.len(), "Swept rate limit windows");
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
