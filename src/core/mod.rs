pub mod circuit_breaker;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod rate_limiter;
pub mod router;
pub mod upstream;

pub use circuit_breaker::{BreakerTicket, CircuitBreakerManager, CircuitState};
pub use error::GatewayError;
pub use gateway::GatewayService;
pub use rate_limiter::{RateDecision, RateLimiter};
pub use router::{ResolvedRoute, Router};
