//! Gateway state object.
//!
//! `GatewayService` owns every piece of mutable resilience state the gateway
//! has (the per-client rate limiter and the per-upstream breakers) together
//! with the immutable routing table. It is built once from a validated
//! [`ServerConfig`], shared behind an `Arc` by all pipeline stages, and torn
//! down with the server. Nothing here performs I/O apart from the background
//! sweep loops started by [`GatewayService::spawn_background_tasks`].
use std::{collections::BTreeMap, sync::Arc};

use eyre::{Result, WrapErr};
use tokio::task::JoinHandle;

use crate::{
    config::ServerConfig,
    core::{
        circuit_breaker::CircuitBreakerManager, rate_limiter::RateLimiter, router::Router,
        upstream::UpstreamService,
    },
    utils::graceful_shutdown::GracefulShutdown,
};

pub struct GatewayService {
    config: Arc<ServerConfig>,
    services: BTreeMap<String, Arc<UpstreamService>>,
    router: Router,
    breakers: Arc<CircuitBreakerManager>,
    rate_limiter: Arc<RateLimiter>,
}

impl GatewayService {
    /// Build the routing table, one breaker per service and the rate limiter.
    pub fn new(config: Arc<ServerConfig>) -> Result<Self> {
        let services = config
            .services
            .iter()
            .map(|(name, service)| {
                UpstreamService::from_config(name, service)
                    .map(|upstream| (name.clone(), Arc::new(upstream)))
                    .wrap_err_with(|| format!("Invalid upstream service '{name}'"))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let router =
            Router::new(&config.routes, &services).wrap_err("Failed to build routing table")?;
        let breakers = Arc::new(CircuitBreakerManager::new(
            services.keys().map(String::as_str),
            &config.circuit_breaker,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        tracing::info!(
            services = services.len(),
            routes = router.len(),
            rate_limit = config.rate_limit.requests_per_window,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "Gateway state initialized"
        );

        Ok(Self {
            config,
            services,
            router,
            breakers,
            rate_limiter,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<UpstreamService>> {
        self.services.values()
    }

    pub fn service(&self, name: &str) -> Option<&Arc<UpstreamService>> {
        self.services.get(name)
    }

    /// Start the breaker recovery sweep and, when rate limiting is enabled,
    /// the limiter cleanup loop. Both stop when `shutdown` is triggered.
    pub fn spawn_background_tasks(&self, shutdown: &GracefulShutdown) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let breakers = self.breakers.clone();
        let sweep_interval = self.config.circuit_breaker.sweep_interval();
        let token = shutdown.shutdown_token();
        handles.push(tokio::spawn(async move {
            breakers.run_sweeper(sweep_interval, token).await;
        }));

        if self.rate_limiter.is_enabled() {
            let limiter = self.rate_limiter.clone();
            let cleanup_interval = self.config.rate_limit.cleanup_interval();
            let token = shutdown.shutdown_token();
            handles.push(tokio::spawn(async move {
                limiter.run_cleanup(cleanup_interval, token).await;
            }));
        }

        handles
    }
}
