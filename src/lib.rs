//! Rampart - a resilient ingress gateway for game backend fleets.
//!
//! Rampart sits in front of a fleet of game services (auth, player, combat,
//! chat, ...) and gives every one of them the same protection:
//!
//! - Per-client sliding-window rate limiting with a temporary block for
//!   abusive callers
//! - One circuit breaker per upstream service (closed / open / half-open),
//!   with a background recovery sweep
//! - Longest-prefix routing with optional prefix stripping
//! - A retrying reverse proxy that replays buffered bodies on transport
//!   failures and records exactly one breaker outcome per request
//! - Health, upstream health and readiness endpoints, plus graceful drain on
//!   shutdown
//!
//! # Quick Example
//! ```no_run
//! use std::time::Duration;
//!
//! use rampart::{Gateway, config::loader::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("config.toml").await?;
//! let running = Gateway::new(config)?.start().await?;
//! running.wait_for_shutdown_signal().await;
//! running.shutdown(Duration::from_secs(30)).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Business logic lives in `core` and performs no I/O. The outbound HTTP client
//! and the authenticator sit behind traits in `ports`, implemented in
//! `adapters`, which also holds the request pipeline and its stages. `server`
//! wires everything together.
//!
//! # Error Handling
//! Per-request failures are [`core::GatewayError`] values rendered as a JSON
//! `{"error", "message"}` body. Startup paths return `eyre::Result<T>` with
//! context attached.
//!
//! # Metrics
//! Metrics are recorded through the `metrics` facade; install a recorder in the
//! embedding application to export them.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;
pub mod server;

pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    core::{CircuitState, GatewayError, GatewayService},
    ports::http_client::HttpClient,
    server::{DrainReport, Gateway, RunningGateway},
    utils::GracefulShutdown,
};
