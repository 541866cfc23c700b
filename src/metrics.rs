//! Metric names and recording helpers for the gateway.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded: the
//! binary (or an embedding application) installs whichever recorder it wants,
//! and without one every call here is a no-op.
//!
//! Families:
//! * `rampart_requests_total` (counter; method, status)
//! * `rampart_request_duration_seconds` (histogram; method)
//! * `rampart_upstream_attempts_total` (counter; service, outcome)
//! * `rampart_upstream_request_duration_seconds` (histogram; service)
//! * `rampart_rate_limited_total` (counter)
//! * `rampart_admission_rejected_total` (counter)
//! * `rampart_circuit_transitions_total` (counter; service, from, to)
//! * `rampart_circuit_state` (gauge per service: 0 closed, 1 half-open, 2 open)
//! * `rampart_active_requests` (gauge)
use std::time::{Duration, Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::core::circuit_breaker::CircuitState;

pub const RAMPART_REQUESTS_TOTAL: &str = "rampart_requests_total";
pub const RAMPART_REQUEST_DURATION_SECONDS: &str = "rampart_request_duration_seconds";
pub const RAMPART_UPSTREAM_ATTEMPTS_TOTAL: &str = "rampart_upstream_attempts_total";
pub const RAMPART_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "rampart_upstream_request_duration_seconds";
pub const RAMPART_RATE_LIMITED_TOTAL: &str = "rampart_rate_limited_total";
pub const RAMPART_ADMISSION_REJECTED_TOTAL: &str = "rampart_admission_rejected_total";
pub const RAMPART_CIRCUIT_TRANSITIONS_TOTAL: &str = "rampart_circuit_transitions_total";
pub const RAMPART_CIRCUIT_STATE: &str = "rampart_circuit_state";
pub const RAMPART_ACTIVE_REQUESTS: &str = "rampart_active_requests";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        RAMPART_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        RAMPART_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        RAMPART_UPSTREAM_ATTEMPTS_TOTAL,
        Unit::Count,
        "Outbound attempts made to upstream services, by outcome."
    );
    describe_histogram!(
        RAMPART_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of proxied upstream calls including retries."
    );
    describe_counter!(
        RAMPART_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected by the per-client rate limiter."
    );
    describe_counter!(
        RAMPART_ADMISSION_REJECTED_TOTAL,
        Unit::Count,
        "Requests shed by the in-flight admission gate."
    );
    describe_counter!(
        RAMPART_CIRCUIT_TRANSITIONS_TOTAL,
        Unit::Count,
        "Circuit breaker state transitions."
    );
    describe_gauge!(
        RAMPART_CIRCUIT_STATE,
        "Current circuit state per upstream (0 closed, 1 half-open, 2 open)."
    );
    describe_gauge!(
        RAMPART_ACTIVE_REQUESTS,
        "Number of requests currently in flight."
    );
});

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    Lazy::force(&DESCRIPTIONS);
}

pub fn increment_request_total(method: &str, status: u16) {
    counter!(
        RAMPART_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(method: &str, duration: Duration) {
    histogram!(RAMPART_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// `outcome` is one of `response`, `connect_error`, `timeout`.
pub fn increment_upstream_attempt(service: &str, outcome: &'static str) {
    counter!(
        RAMPART_UPSTREAM_ATTEMPTS_TOTAL,
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn increment_rate_limited() {
    counter!(RAMPART_RATE_LIMITED_TOTAL).increment(1);
}

pub fn increment_admission_rejected() {
    counter!(RAMPART_ADMISSION_REJECTED_TOTAL).increment(1);
}

fn state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

pub fn set_circuit_state(service: &str, state: CircuitState) {
    gauge!(RAMPART_CIRCUIT_STATE, "service" => service.to_string()).set(state_value(state));
}

pub fn record_circuit_transition(service: &str, from: CircuitState, to: CircuitState) {
    counter!(
        RAMPART_CIRCUIT_TRANSITIONS_TOTAL,
        "service" => service.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    set_circuit_state(service, to);
}

pub fn set_active_requests(count: usize) {
    gauge!(RAMPART_ACTIVE_REQUESTS).set(count as f64);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

/// RAII helper measuring a whole proxied call, retries included.
pub struct UpstreamTimer {
    start: Instant,
    service: String,
}

impl UpstreamTimer {
    pub fn new(service: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
        }
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        histogram!(
            RAMPART_UPSTREAM_REQUEST_DURATION_SECONDS,
            "service" => self.service.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
