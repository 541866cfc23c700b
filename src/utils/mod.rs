pub mod client_ip;
pub mod graceful_shutdown;
pub mod request_tracker;

pub use client_ip::{ClientId, resolve_client_id};
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason, ShutdownToken};
pub use request_tracker::{RequestGuard, RequestTracker};
