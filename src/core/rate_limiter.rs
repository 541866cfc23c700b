//! Per-client sliding-window rate limiting with temporary blocking.
//!
//! Each client owns a [`ClientRateState`] holding the timestamps of its admitted
//! requests inside the trailing window. Admission prunes, counts and appends
//! under the client's `scc` entry lock, so concurrent bursts from one client are
//! linearized and can never admit more than the configured limit. A client that
//! hits the limit is blocked for the configured block duration; while blocked
//! every request is rejected regardless of the window content.
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use scc::HashMap;

use crate::{config::RateLimitConfig, utils::graceful_shutdown::ShutdownToken};

/// Sliding-window bookkeeping for one client.
#[derive(Debug, Default)]
pub struct ClientRateState {
    timestamps: VecDeque<Instant>,
    blocked: bool,
    blocked_until: Option<Instant>,
}

impl ClientRateState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Remaining block time, clearing the block once it has expired.
    fn active_block(&mut self, now: Instant) -> Option<Duration> {
        if !self.blocked {
            return None;
        }
        match self.blocked_until {
            Some(until) if until > now => Some(until - now),
            _ => {
                self.blocked = false;
                self.blocked_until = None;
                None
            }
        }
    }

    fn is_idle(&mut self, now: Instant, window: Duration) -> bool {
        self.prune(now, window);
        self.active_block(now).is_none() && self.timestamps.is_empty()
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    clients: HashMap<String, ClientRateState>,
    limit: usize,
    window: Duration,
    block_duration: Duration,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            clients: HashMap::new(),
            limit: config.requests_per_window as usize,
            window: config.window(),
            block_duration: config.block_duration(),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admit or reject one request from `client`.
    pub async fn allow(&self, client: &str) -> bool {
        self.check(client).await.is_allowed()
    }

    pub async fn check(&self, client: &str) -> RateDecision {
        self.check_at(client, Instant::now()).await
    }

    /// Check-and-increment for `client` as of `now`.
    pub async fn check_at(&self, client: &str, now: Instant) -> RateDecision {
        let mut entry = self
            .clients
            .entry_async(client.to_string())
            .await
            .or_insert_with(ClientRateState::default);
        let state = entry.get_mut();

        if let Some(retry_after) = state.active_block(now) {
            return RateDecision::Limited { retry_after };
        }

        state.prune(now, self.window);
        if state.timestamps.len() >= self.limit {
            state.blocked = true;
            state.blocked_until = Some(now + self.block_duration);
            tracing::warn!(
                client = %client,
                limit = self.limit,
                block_secs = self.block_duration.as_secs(),
                "Client exceeded rate limit, blocking"
            );
            return RateDecision::Limited {
                retry_after: self.block_duration,
            };
        }

        state.timestamps.push_back(now);
        RateDecision::Allowed {
            remaining: self.limit - state.timestamps.len(),
        }
    }

    pub async fn is_blocked(&self, client: &str) -> bool {
        self.is_blocked_at(client, Instant::now()).await
    }

    pub async fn is_blocked_at(&self, client: &str, now: Instant) -> bool {
        match self.clients.get_async(client).await {
            Some(mut entry) => entry.get_mut().active_block(now).is_some(),
            None => false,
        }
    }

    /// Number of clients currently holding state.
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now()).await
    }

    /// Drop clients whose window is empty and who are not blocked. Returns the
    /// number of entries removed.
    pub async fn cleanup_at(&self, now: Instant) -> usize {
        let window = self.window;
        let mut removed = 0;
        let removed_ref = &mut removed;
        self.clients
            .retain_async(|_, state| {
                let keep = !state.is_idle(now, window);
                if !keep {
                    *removed_ref += 1;
                }
                keep
            })
            .await;
        removed
    }

    /// Periodic cleanup loop, exits when `shutdown` fires.
    pub async fn run_cleanup(&self, interval: Duration, mut shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.cleanup().await;
                    if removed > 0 {
                        tracing::debug!(
                            removed,
                            remaining = self.tracked_clients(),
                            "Rate limiter cleanup"
                        );
                    }
                }
                _ = shutdown.wait_for_shutdown() => {
                    tracing::debug!("Rate limiter cleanup stopped");
                    break;
                }
            }
        }
    }
}
