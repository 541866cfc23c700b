//! Gateway composition root and server lifecycle.
//!
//! [`Gateway`] validates the configuration, builds the shared state object,
//! the outbound client and the ordered stage pipeline, and exposes the axum
//! router. [`Gateway::start`] binds (plain or TLS) and returns a
//! [`RunningGateway`] whose [`RunningGateway::shutdown`] drains in-flight
//! requests within a deadline before force-closing the rest.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    response::Response,
    routing::get,
};
use axum::serve::ListenerExt;
use eyre::{Result, WrapErr, eyre};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::{
    adapters::{
        HttpClientAdapter, HttpHandler, Pipeline, ProxyExecutor, Stage, TlsListenerAdapter,
        authenticator,
        stages::{
            AdmissionStage, AuthStage, CircuitBreakerStage, CorsStage, IdentityStage,
            LoggingStage, PanicRecoveryStage, ProxyStage, RateLimitStage, TimeoutStage,
        },
    },
    config::{ServerConfig, ServerConfigValidator},
    core::GatewayService,
    ports::{authenticator::Authenticator, http_client::HttpClient},
    utils::{GracefulShutdown, RequestTracker, ShutdownReason},
};

/// How long the server task gets to wind down after requests were drained or
/// force-closed before it is aborted.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Gateway {
    config: Arc<ServerConfig>,
    state: Arc<GatewayService>,
    pipeline: Arc<Pipeline>,
    handler: HttpHandler,
    shutdown: Arc<GracefulShutdown>,
}

impl Gateway {
    /// Build a gateway with the production HTTP client and the authenticator
    /// selected by `auth.mode`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let http_client: Arc<dyn HttpClient> =
            Arc::new(HttpClientAdapter::new().wrap_err("Failed to create HTTP client adapter")?);
        let authenticator = authenticator::from_config(&config.auth);
        Self::from_parts(config, http_client, authenticator)
    }

    /// Build a gateway around caller-supplied collaborators.
    pub fn from_parts(
        config: ServerConfig,
        http_client: Arc<dyn HttpClient>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        ServerConfigValidator::validate(&config).wrap_err("Invalid gateway configuration")?;

        let config = Arc::new(config);
        let state = Arc::new(
            GatewayService::new(config.clone()).wrap_err("Failed to build gateway state")?,
        );
        let executor = Arc::new(ProxyExecutor::new(http_client.clone(), &config));
        let pipeline = Arc::new(build_pipeline(&state, executor, authenticator));
        let handler = HttpHandler::new(
            state.clone(),
            pipeline.clone(),
            http_client,
            RequestTracker::new(),
        );

        tracing::info!(
            gateway = %config.gateway_name,
            stages = ?pipeline.stage_names(),
            "Gateway pipeline assembled"
        );

        Ok(Self {
            config,
            state,
            pipeline,
            handler,
            shutdown: Arc::new(GracefulShutdown::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<GatewayService> {
        &self.state
    }

    pub fn handler(&self) -> &HttpHandler {
        &self.handler
    }

    pub fn pipeline_stage_names(&self) -> Vec<&'static str> {
        self.pipeline.stage_names()
    }

    /// Shutdown coordinator; hand it to a signal handler.
    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    /// Health and readiness bypass the pipeline; every other request goes
    /// through it.
    pub fn router(&self) -> axum::Router {
        axum::Router::new()
            .route("/health", get(health))
            .route("/health/upstreams", get(upstream_health))
            .route("/ready", get(ready))
            .fallback(proxy)
            .with_state(self.handler.clone())
    }

    /// Bind the configured listen address and start serving.
    pub async fn start(self) -> Result<RunningGateway> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .wrap_err_with(|| format!("Invalid listen address '{}'", self.config.listen_addr))?;
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("Failed to bind to {addr}"))?;
        self.start_with_listener(listener).await
    }

    /// Serve on an already bound listener, terminating TLS when configured.
    pub async fn start_with_listener(self, listener: TcpListener) -> Result<RunningGateway> {
        let local_addr = listener
            .local_addr()
            .wrap_err("Failed to read local address")?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let mut token = self.shutdown.shutdown_token();
        let stop = async move { token.wait_for_shutdown().await };

        let server = match &self.config.tls {
            Some(tls) => {
                let listener = TlsListenerAdapter::bind(listener, tls)
                    .wrap_err("Failed to set up TLS listener")?
                    .tap_io(|_| {});
                let serve = axum::serve(listener, app).with_graceful_shutdown(stop);
                tokio::spawn(async move { serve.await })
            }
            None => {
                let serve = axum::serve(listener, app).with_graceful_shutdown(stop);
                tokio::spawn(async move { serve.await })
            }
        };

        let background = self.state.spawn_background_tasks(&self.shutdown);

        tracing::info!(
            %local_addr,
            tls = self.config.tls.is_some(),
            routes = self.state.router().len(),
            "Rampart gateway listening"
        );

        Ok(RunningGateway {
            local_addr,
            handler: self.handler,
            shutdown: self.shutdown,
            server,
            background,
        })
    }
}

/// Order matters: identity first so every later log line carries the client,
/// rate limiting before auth and the breaker, proxy last.
fn build_pipeline(
    state: &Arc<GatewayService>,
    executor: Arc<ProxyExecutor>,
    authenticator: Arc<dyn Authenticator>,
) -> Pipeline {
    let config = state.config();

    let mut stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(IdentityStage),
        Arc::new(PanicRecoveryStage),
        Arc::new(TimeoutStage::new(config.server.request_timeout())),
        Arc::new(CorsStage::new(config.cors.clone())),
        Arc::new(LoggingStage),
    ];
    if let Some(max_in_flight) = config.server.max_in_flight {
        stages.push(Arc::new(AdmissionStage::new(max_in_flight)));
    }
    stages.push(Arc::new(RateLimitStage::new(state.clone())));
    stages.push(Arc::new(AuthStage::new(
        authenticator,
        config.auth.public_prefixes.clone(),
    )));
    stages.push(Arc::new(CircuitBreakerStage::new(state.clone())));
    stages.push(Arc::new(ProxyStage::new(executor)));

    Pipeline::new(stages)
}

async fn health(State(handler): State<HttpHandler>) -> Response {
    handler.handle_health().await
}

async fn upstream_health(State(handler): State<HttpHandler>) -> Response {
    handler.handle_upstream_health().await
}

async fn ready(State(handler): State<HttpHandler>) -> Response {
    handler.handle_ready().await
}

async fn proxy(State(handler): State<HttpHandler>, req: Request) -> Response {
    handler.handle_request(req).await
}

/// What happened to in-flight requests during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every in-flight request finished before the deadline
    pub drained: bool,
    /// Requests still running when the deadline passed
    pub abandoned: usize,
}

pub struct RunningGateway {
    local_addr: SocketAddr,
    handler: HttpHandler,
    shutdown: Arc<GracefulShutdown>,
    server: JoinHandle<std::io::Result<()>>,
    background: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handler(&self) -> &HttpHandler {
        &self.handler
    }

    pub fn in_flight(&self) -> usize {
        self.handler.tracker().in_flight()
    }

    /// Resolves once shutdown was triggered, by a signal or by another holder
    /// of the shutdown handle.
    pub async fn wait_for_shutdown_signal(&self) {
        self.shutdown.shutdown_token().wait_for_shutdown().await;
    }

    /// Stop accepting, drain in-flight requests within `deadline`, then
    /// force-close whatever is left and stop the background sweeps.
    pub async fn shutdown(self, deadline: Duration) -> Result<DrainReport> {
        let Self {
            handler,
            shutdown,
            mut server,
            background,
            ..
        } = self;

        handler.stop_accepting();
        shutdown.trigger_shutdown(ShutdownReason::Requested);

        let tracker = handler.tracker();
        tracing::info!(
            in_flight = tracker.in_flight(),
            deadline_ms = deadline.as_millis() as u64,
            "Draining in-flight requests"
        );

        let drained = tracker.wait_for_drain(deadline).await;
        let abandoned = if drained {
            0
        } else {
            let remaining = tracker.in_flight();
            tracing::warn!(
                abandoned = remaining,
                "Drain deadline exceeded, force-closing remaining requests"
            );
            tracker.force_close();
            remaining
        };

        let server_result = match tokio::time::timeout(SERVER_STOP_GRACE, &mut server).await {
            Ok(joined) => joined
                .map_err(|e| eyre!("Server task failed: {e}"))
                .and_then(|served| served.wrap_err("Server error")),
            Err(_) => {
                tracing::warn!("Server did not stop in time, aborting");
                server.abort();
                Ok(())
            }
        };

        for mut task in background {
            if tokio::time::timeout(SERVER_STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        server_result?;
        tracing::info!(drained, abandoned, "Gateway shutdown complete");
        Ok(DrainReport { drained, abandoned })
    }
}
