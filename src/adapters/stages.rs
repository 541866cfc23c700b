//! Concrete pipeline stages, in the order the gateway composes them:
//! identity, panic recovery, timeout, CORS, logging, admission, rate limit,
//! auth, circuit breaker, proxy.
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body as AxumBody,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;
use http::{HeaderValue, Method, StatusCode, header};
use tokio::{sync::Semaphore, time::Instant};
use tracing::Instrument;

use crate::{
    adapters::{
        pipeline::{Next, PipelineRequest, Stage},
        proxy::ProxyExecutor,
    },
    config::CorsConfig,
    core::{GatewayError, GatewayService, RateDecision, headers::X_REQUEST_ID},
    metrics,
    ports::authenticator::{AuthRequest, Authenticator},
    tracing_setup,
    utils::resolve_client_id,
};

/// Resolves the client identity and request id, and opens the request span.
pub struct IdentityStage;

impl IdentityStage {
    fn valid_request_id(value: &HeaderValue) -> Option<String> {
        let id = value.to_str().ok()?;
        let acceptable = !id.is_empty()
            && id.len() <= 128
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        acceptable.then(|| id.to_string())
    }
}

#[async_trait]
impl Stage for IdentityStage {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn handle(&self, mut req: PipelineRequest, next: Next<'_>) -> Response {
        req.client = resolve_client_id(req.request.headers(), req.peer);

        let request_id = req
            .request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(Self::valid_request_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let header_value = HeaderValue::from_str(&request_id).ok();
        if let Some(value) = &header_value {
            req.request.headers_mut().insert(X_REQUEST_ID, value.clone());
        }
        req.request_id = Some(request_id.clone());

        let span = tracing_setup::create_request_span(&request_id, req.client.as_str());
        let mut response = next.run(req).instrument(span).await;

        if let Some(value) = header_value {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }
}

/// Converts a panic anywhere downstream into a 500.
pub struct PanicRecoveryStage;

#[async_trait]
impl Stage for PanicRecoveryStage {
    fn name(&self) -> &'static str {
        "panic_recovery"
    }

    async fn handle(&self, req: PipelineRequest, next: Next<'_>) -> Response {
        let method = req.request.method().clone();
        let path = req.path().to_string();

        match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(response) => response,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(%method, %path, panic = %message, "Request handler panicked");
                GatewayError::Internal("request handler panicked".to_string()).into_response()
            }
        }
    }
}

/// Extra time past the request deadline before the stage cuts downstream
/// work short. The proxy stops at the deadline itself and settles its breaker
/// ticket; this backstops the stages in front of it.
const DEADLINE_GRACE: Duration = Duration::from_millis(100);

/// Bounds total request latency, retries included.
pub struct TimeoutStage {
    timeout: Duration,
}

impl TimeoutStage {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Stage for TimeoutStage {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn handle(&self, mut req: PipelineRequest, next: Next<'_>) -> Response {
        let deadline = Instant::now() + self.timeout;
        req.deadline = Some(deadline);
        match tokio::time::timeout_at(deadline + DEADLINE_GRACE, next.run(req)).await {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "Request exceeded gateway deadline");
                GatewayError::RequestTimeout(self.timeout).into_response()
            }
        }
    }
}

/// Answers preflights and decorates responses with CORS headers.
pub struct CorsStage {
    config: CorsConfig,
}

impl CorsStage {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    fn allow_origin(&self, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        if self.config.allowed_origins.iter().any(|o| o == "*") {
            return Some(HeaderValue::from_static("*"));
        }
        let origin = origin?;
        let origin_str = origin.to_str().ok()?;
        self.config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin_str)
            .then(|| origin.clone())
    }

    fn decorate(&self, response: &mut Response, allow: HeaderValue) {
        let headers = response.headers_mut();
        let reflected = allow != "*";
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow);
        if reflected {
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
    }
}

#[async_trait]
impl Stage for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn handle(&self, req: PipelineRequest, next: Next<'_>) -> Response {
        if !self.config.enabled {
            return next.run(req).await;
        }

        let headers = req.request.headers();
        let origin = headers.get(header::ORIGIN).cloned();
        let is_preflight = req.request.method() == Method::OPTIONS
            && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);
        let allow = self.allow_origin(origin.as_ref());

        if is_preflight {
            let mut response = Response::new(AxumBody::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            if let Some(allow) = allow {
                self.decorate(&mut response, allow);
                let headers = response.headers_mut();
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
                );
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static("Content-Type, Authorization, X-Request-ID"),
                );
                headers.insert(
                    header::ACCESS_CONTROL_MAX_AGE,
                    HeaderValue::from_static("86400"),
                );
            }
            return response;
        }

        let mut response = next.run(req).await;
        if let Some(allow) = allow {
            self.decorate(&mut response, allow);
        }
        response
    }
}

/// Start/complete log lines plus request metrics.
pub struct LoggingStage;

#[async_trait]
impl Stage for LoggingStage {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, req: PipelineRequest, next: Next<'_>) -> Response {
        let method = req.request.method().clone();
        let uri = req.request.uri().clone();
        let timer = metrics::RequestTimer::new(method.as_str());

        tracing::debug!(%method, %uri, "Started processing request");
        let response = next.run(req).await;

        let status = response.status();
        let latency_ms = timer.elapsed().as_millis() as u64;
        let code = status.as_u16();
        if status.is_server_error() {
            tracing::warn!(%method, %uri, status = code, latency_ms, "Completed request");
        } else {
            tracing::info!(%method, %uri, status = code, latency_ms, "Completed request");
        }
        metrics::increment_request_total(method.as_str(), code);
        response
    }
}

/// Sheds load once `max_in_flight` requests are being processed.
pub struct AdmissionStage {
    permits: Arc<Semaphore>,
}

impl AdmissionStage {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }
}

#[async_trait]
impl Stage for AdmissionStage {
    fn name(&self) -> &'static str {
        "admission"
    }

    async fn handle(&self, req: PipelineRequest, next: Next<'_>) -> Response {
        let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
            metrics::increment_admission_rejected();
            tracing::warn!(client = %req.client, "Admission gate saturated, shedding request");
            return GatewayError::Overloaded.into_response();
        };
        next.run(req).await
    }
}

pub struct RateLimitStage {
    gateway: Arc<GatewayService>,
}

impl RateLimitStage {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, req: PipelineRequest, next: Next<'_>) -> Response {
        let limiter = self.gateway.rate_limiter();
        if !limiter.is_enabled() {
            return next.run(req).await;
        }

        match limiter.check(req.client.as_str()).await {
            RateDecision::Allowed { .. } => next.run(req).await,
            RateDecision::Limited { retry_after } => {
                metrics::increment_rate_limited();
                tracing::debug!(client = %req.client, ?retry_after, "Rate limited");
                GatewayError::RateLimited {
                    client: req.client.to_string(),
                    retry_after,
                }
                .into_response()
            }
        }
    }
}

/// Delegates to the external authenticator unless the path is public.
pub struct AuthStage {
    authenticator: Arc<dyn Authenticator>,
    public_prefixes: Vec<String>,
}

impl AuthStage {
    pub fn new(authenticator: Arc<dyn Authenticator>, public_prefixes: Vec<String>) -> Self {
        Self {
            authenticator,
            public_prefixes,
        }
    }

    fn is_public(&self, path: &str) -> bool {
        self.public_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

#[async_trait]
impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn handle(&self, mut req: PipelineRequest, next: Next<'_>) -> Response {
        if self.is_public(req.path()) {
            return next.run(req).await;
        }

        let result = self
            .authenticator
            .authenticate(AuthRequest {
                method: req.request.method(),
                uri: req.request.uri(),
                headers: req.request.headers(),
            })
            .await;

        match result {
            Ok(identity) => {
                req.identity = Some(identity);
                next.run(req).await
            }
            Err(e) => {
                tracing::debug!(client = %req.client, error = %e, "Authentication failed");
                GatewayError::Unauthorized(e.to_string()).into_response()
            }
        }
    }
}

/// Resolves the route and asks the upstream's breaker for admission.
pub struct CircuitBreakerStage {
    gateway: Arc<GatewayService>,
}

impl CircuitBreakerStage {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for CircuitBreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn handle(&self, mut req: PipelineRequest, next: Next<'_>) -> Response {
        let route = match self.gateway.router().resolve(req.path()) {
            Ok(route) => route,
            Err(e) => return e.into_response(),
        };

        match self.gateway.breakers().admit(route.service_name()) {
            Ok(ticket) => {
                req.route = Some(route);
                req.ticket = Some(ticket);
                next.run(req).await
            }
            Err(e) => {
                tracing::debug!(service = route.service_name(), "Circuit rejected request");
                e.into_response()
            }
        }
    }
}

/// Terminal stage: forwards to the upstream.
pub struct ProxyStage {
    executor: Arc<ProxyExecutor>,
}

impl ProxyStage {
    pub fn new(executor: Arc<ProxyExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Stage for ProxyStage {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn handle(&self, req: PipelineRequest, _next: Next<'_>) -> Response {
        let PipelineRequest {
            request,
            client,
            route,
            ticket,
            deadline,
            ..
        } = req;
        let (Some(route), Some(ticket)) = (route, ticket) else {
            return GatewayError::Internal("request reached proxy without a route".to_string())
                .into_response();
        };

        match self
            .executor
            .execute(request, route, client, ticket, deadline)
            .await
        {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }
}
