//! Per-upstream circuit breakers.
//!
//! One [`CircuitBreaker`] exists per configured service, created at startup and
//! never added or removed afterwards, so [`CircuitBreakerManager`] keeps them in
//! a plain map that is only ever read once built. Each breaker serializes its
//! own transitions behind a `std::sync::Mutex`; the lock is never held across
//! an `.await` and never while touching any other breaker or the rate limiter.
//!
//! ```text
//! Closed --failures >= threshold--> Open --open interval elapsed--> HalfOpen
//!   ^                                 ^                                |
//!   |                                 +------------failure-------------+
//!   +------------------------------success-----------------------------+
//! ```
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    config::CircuitBreakerConfig, core::error::GatewayError, metrics,
    utils::graceful_shutdown::ShutdownToken,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every entry to HalfOpen; probe tickets carry the value they
    /// were admitted under
    generation: u64,
}

/// Point-in-time view of a breaker, used by health reporting and tests.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Why a breaker refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Open and still inside the open interval
    Open { retry_after: Duration },
    /// Half-open with every probe slot taken
    ProbesExhausted,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    open_interval: Duration,
    max_probes: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold,
            open_interval: config.open_interval(),
            max_probes: config.half_open_max_probes,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probes_in_flight: 0,
                generation: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // state stays consistent even if a holder panicked: every write is a
        // plain field assignment
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.probes_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.probes_in_flight = 0;
                inner.generation = inner.generation.wrapping_add(1);
            }
            CircuitState::Open => {}
        }

        metrics::record_circuit_transition(&self.service, from, to);
        match to {
            CircuitState::Open => tracing::warn!(
                service = %self.service,
                from = %from,
                failures = inner.failure_count,
                "Circuit opened"
            ),
            _ => tracing::info!(
                service = %self.service,
                from = %from,
                to = %to,
                "Circuit state changed"
            ),
        }
    }

    /// Move Open to HalfOpen when the open interval has elapsed since the last
    /// failure. Caller holds the lock.
    fn try_half_open(&self, inner: &mut BreakerInner, now: Instant) -> bool {
        if inner.state != CircuitState::Open {
            return false;
        }
        let elapsed = inner
            .last_failure
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if elapsed > self.open_interval {
            self.transition(inner, CircuitState::HalfOpen);
            true
        } else {
            false
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Admission check. Does not reserve a probe slot; see [`Self::try_acquire_at`].
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        self.try_half_open(&mut inner, now);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                self.max_probes == 0 || inner.probes_in_flight < self.max_probes
            }
        }
    }

    /// Admission check that also reserves a half-open probe slot. Returns
    /// the half-open generation when the admitted call is a probe.
    pub fn try_acquire_at(&self, now: Instant) -> Result<Option<u64>, Rejection> {
        let mut inner = self.lock();
        self.try_half_open(&mut inner, now);
        match inner.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                Err(Rejection::Open {
                    retry_after: self.open_interval.saturating_sub(elapsed),
                })
            }
            CircuitState::HalfOpen => {
                if self.max_probes > 0 && inner.probes_in_flight >= self.max_probes {
                    return Err(Rejection::ProbesExhausted);
                }
                inner.probes_in_flight += 1;
                Ok(Some(inner.generation))
            }
        }
    }

    pub fn record_result(&self, failed: bool) {
        self.record_result_at(failed, Instant::now());
    }

    pub fn record_result_at(&self, failed: bool, now: Instant) {
        let mut inner = self.lock();
        self.apply_result(&mut inner, failed, now);
    }

    /// Caller holds the lock.
    fn apply_result(&self, inner: &mut BreakerInner, failed: bool, now: Instant) {
        if failed {
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.last_failure = Some(now);
            match inner.state {
                CircuitState::HalfOpen => self.transition(inner, CircuitState::Open),
                CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                    self.transition(inner, CircuitState::Open)
                }
                _ => {}
            }
        } else if inner.state == CircuitState::HalfOpen {
            self.transition(inner, CircuitState::Closed);
        }
    }

    /// Free a probe slot taken in half-open `generation`. Slots from an
    /// earlier half-open period were already reset. Caller holds the lock.
    fn release_probe(inner: &mut BreakerInner, generation: u64) {
        if inner.state == CircuitState::HalfOpen && inner.generation == generation {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Release the call's probe slot (if any) and record its outcome in a
    /// single critical section.
    fn settle_at(&self, probe: Option<u64>, failed: bool, now: Instant) {
        let mut inner = self.lock();
        if let Some(generation) = probe {
            Self::release_probe(&mut inner, generation);
        }
        self.apply_result(&mut inner, failed, now);
    }

    fn abandon(&self, generation: u64) {
        let mut inner = self.lock();
        Self::release_probe(&mut inner, generation);
    }

    pub fn probes_in_flight(&self) -> u32 {
        self.lock().probes_in_flight
    }

    /// Background-sweep step for this breaker.
    pub fn sweep_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        self.try_half_open(&mut inner, now)
    }
}

/// Permission to make one upstream call. Exactly one outcome is recorded
/// through [`BreakerTicket::settle`]; dropping an unsettled ticket records
/// nothing and frees its probe slot.
#[derive(Debug)]
pub struct BreakerTicket {
    breaker: Arc<CircuitBreaker>,
    /// Half-open generation for probe calls
    probe: Option<u64>,
    settled: bool,
}

impl BreakerTicket {
    pub fn service(&self) -> &str {
        self.breaker.service()
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn settle(self, failed: bool) {
        self.settle_at(failed, Instant::now());
    }

    pub fn settle_at(mut self, failed: bool, now: Instant) {
        self.settled = true;
        self.breaker.settle_at(self.probe, failed, now);
    }
}

impl Drop for BreakerTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(generation) = self.probe {
            self.breaker.abandon(generation);
        }
    }
}

pub struct CircuitBreakerManager {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new<'a>(
        services: impl IntoIterator<Item = &'a str>,
        config: &CircuitBreakerConfig,
    ) -> Self {
        let breakers = services
            .into_iter()
            .map(|name| {
                metrics::set_circuit_state(name, CircuitState::Closed);
                (name.to_string(), Arc::new(CircuitBreaker::new(name, config)))
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, service: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(service)
    }

    /// Unknown services are refused.
    pub fn allow(&self, service: &str) -> bool {
        self.breakers
            .get(service)
            .map(|breaker| breaker.allow())
            .unwrap_or(false)
    }

    pub fn admit(&self, service: &str) -> Result<BreakerTicket, GatewayError> {
        self.admit_at(service, Instant::now())
    }

    pub fn admit_at(&self, service: &str, now: Instant) -> Result<BreakerTicket, GatewayError> {
        let breaker = self
            .breakers
            .get(service)
            .ok_or_else(|| GatewayError::Internal(format!("no breaker for service '{service}'")))?;

        match breaker.try_acquire_at(now) {
            Ok(probe) => Ok(BreakerTicket {
                breaker: breaker.clone(),
                probe,
                settled: false,
            }),
            Err(Rejection::Open { retry_after }) => Err(GatewayError::CircuitOpen {
                service: service.to_string(),
                state: CircuitState::Open,
                retry_after: Some(retry_after),
            }),
            Err(Rejection::ProbesExhausted) => Err(GatewayError::CircuitOpen {
                service: service.to_string(),
                state: CircuitState::HalfOpen,
                retry_after: None,
            }),
        }
    }

    pub fn record_result(&self, service: &str, failed: bool) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_result(failed);
        }
    }

    pub fn state(&self, service: &str) -> Option<CircuitState> {
        self.breakers.get(service).map(|breaker| breaker.state())
    }

    /// Snapshots sorted by service name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    /// Flip every expired Open breaker to HalfOpen. Returns how many moved.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.breakers
            .values()
            .filter(|breaker| breaker.sweep_at(now))
            .count()
    }

    /// Recovery sweep loop, exits when `shutdown` fires.
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let recovered = self.sweep_at(Instant::now());
                    if recovered > 0 {
                        tracing::info!(recovered, "Breaker sweep moved circuits to half-open");
                    }
                }
                _ = shutdown.wait_for_shutdown() => {
                    tracing::debug!("Breaker sweeper stopped");
                    break;
                }
            }
        }
    }
}
