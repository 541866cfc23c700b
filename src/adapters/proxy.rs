//! Retrying reverse-proxy executor.
//!
//! The inbound body is buffered (bounded by `max_request_body_bytes`) so it can
//! be replayed; every attempt is bounded by the service timeout and by whatever
//! is left of the request deadline. Only transport failures are retried, and
//! never past that deadline. The first HTTP response that comes back, whatever its
//! status, is streamed to the client as-is. Each call settles its breaker
//! ticket exactly once: failed when the final status is 5xx or every attempt
//! failed on the wire.
use std::{sync::Arc, time::Duration};

use axum::{body::Body as AxumBody, response::Response};
use bytes::Bytes;
use http::{HeaderValue, Request, header, request::Parts};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::time::Instant;
use tracing::Instrument;

use crate::{
    config::ServerConfig,
    core::{
        BreakerTicket, GatewayError, ResolvedRoute,
        headers::{
            X_FORWARDED_FOR, X_FORWARDED_HOST, X_GATEWAY, X_GATEWAY_SERVICE, strip_hop_by_hop,
        },
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup,
    utils::ClientId,
};

/// Per-request proxy state, discarded once a response or terminal error is
/// produced.
#[derive(Debug)]
pub struct ProxyRequestContext {
    pub parts: Parts,
    pub body: Bytes,
    pub route: ResolvedRoute,
    pub client: ClientId,
    /// Zero-based index of the current attempt
    pub attempt: u32,
    /// Deadline of the current attempt
    pub deadline: Instant,
    /// Deadline of the whole request, retries included
    pub request_deadline: Option<Instant>,
}

impl ProxyRequestContext {
    pub fn new(
        parts: Parts,
        body: Bytes,
        route: ResolvedRoute,
        client: ClientId,
        request_deadline: Option<Instant>,
    ) -> Self {
        let mut ctx = Self {
            parts,
            body,
            route,
            client,
            attempt: 0,
            deadline: Instant::now(),
            request_deadline,
        };
        ctx.begin_attempt(0);
        ctx
    }

    fn begin_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        let attempt_deadline = Instant::now() + self.route.service.timeout();
        self.deadline = match self.request_deadline {
            Some(request_deadline) => attempt_deadline.min(request_deadline),
            None => attempt_deadline,
        };
    }

    /// Whether another attempt can still start after waiting `backoff`.
    fn has_budget_after(&self, backoff: Duration) -> bool {
        self.request_deadline
            .is_none_or(|deadline| Instant::now() + backoff < deadline)
    }

    fn service_name(&self) -> &str {
        self.route.service_name()
    }

    /// Build the outbound request for the current attempt.
    pub fn outbound_request(
        &self,
        gateway_name: &HeaderValue,
    ) -> Result<Request<AxumBody>, GatewayError> {
        let path_and_query = match self.parts.uri.query() {
            Some(query) => format!("{}?{query}", self.route.upstream_path),
            None => self.route.upstream_path.clone(),
        };
        let uri = self
            .route
            .service
            .base_url()
            .join(&path_and_query)
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

        let mut headers = self.parts.headers.clone();
        strip_hop_by_hop(&mut headers);

        let original_host = self
            .parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                self.parts
                    .uri
                    .authority()
                    .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
            });
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Ok(client) = HeaderValue::from_str(self.client.as_str()) {
            headers.insert(X_FORWARDED_FOR, client);
        }
        headers.insert(X_GATEWAY, gateway_name.clone());
        if let Ok(service) = HeaderValue::from_str(self.service_name()) {
            headers.insert(X_GATEWAY_SERVICE, service);
        }
        // the client picks the upstream host
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let mut request = Request::builder()
            .method(self.parts.method.clone())
            .uri(uri)
            .body(AxumBody::from(self.body.clone()))
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        *request.headers_mut() = headers;
        if !self.body.is_empty() {
            request
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        }
        Ok(request)
    }
}

/// Transport failure of a single attempt.
enum AttemptFailure {
    Unreachable(String),
    TimedOut,
}

pub struct ProxyExecutor {
    client: Arc<dyn HttpClient>,
    gateway_name: HeaderValue,
    retry_backoff: Duration,
    max_body_bytes: usize,
}

impl ProxyExecutor {
    pub fn new(client: Arc<dyn HttpClient>, config: &ServerConfig) -> Self {
        let gateway_name = HeaderValue::from_str(&config.gateway_name)
            .unwrap_or_else(|_| HeaderValue::from_static("rampart"));
        Self {
            client,
            gateway_name,
            retry_backoff: config.proxy.retry_backoff(),
            max_body_bytes: config.proxy.max_request_body_bytes,
        }
    }

    /// Forward `request` to the routed upstream, giving up at `deadline`.
    /// The ticket is settled once an outcome is known; client errors leave it
    /// unsettled.
    pub async fn execute(
        &self,
        request: Request<AxumBody>,
        route: ResolvedRoute,
        client: ClientId,
        ticket: BreakerTicket,
        deadline: Option<Instant>,
    ) -> Result<Response, GatewayError> {
        let (parts, body) = request.into_parts();
        let body = self.buffer_body(body).await?;
        let mut ctx = ProxyRequestContext::new(parts, body, route, client, deadline);
        let _timer = metrics::UpstreamTimer::new(ctx.service_name());

        let max_retries = ctx.route.service.max_retries();
        let mut last_failure = AttemptFailure::TimedOut;

        for attempt in 0..=max_retries {
            ctx.begin_attempt(attempt);
            let outbound = ctx.outbound_request(&self.gateway_name)?;

            let span = tracing_setup::create_upstream_span(ctx.service_name(), attempt + 1);
            let send = self.client.send_request(outbound).instrument(span);
            let outcome = tokio::time::timeout_at(ctx.deadline, send).await;
            match outcome {
                Ok(Ok(response)) => {
                    metrics::increment_upstream_attempt(ctx.service_name(), "response");
                    let failed = response.status().is_server_error();
                    tracing::debug!(
                        service = ctx.service_name(),
                        attempt = attempt + 1,
                        status = response.status().as_u16(),
                        "Upstream responded"
                    );
                    ticket.settle(failed);
                    return Ok(self.finish_response(response, ctx.service_name()));
                }
                Ok(Err(HttpClientError::InvalidRequest(reason))) => {
                    return Err(GatewayError::BadRequest(reason));
                }
                Ok(Err(e)) => {
                    metrics::increment_upstream_attempt(ctx.service_name(), "connect_error");
                    last_failure = AttemptFailure::Unreachable(e.to_string());
                }
                Err(_) => {
                    metrics::increment_upstream_attempt(ctx.service_name(), "timeout");
                    last_failure = AttemptFailure::TimedOut;
                }
            }

            if attempt == max_retries {
                break;
            }
            let backoff = self.retry_backoff * (attempt + 1);
            if !ctx.has_budget_after(backoff) {
                tracing::warn!(
                    service = ctx.service_name(),
                    attempt = attempt + 1,
                    "Request deadline reached, no further retries"
                );
                break;
            }
            tracing::warn!(
                service = ctx.service_name(),
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                "Upstream attempt failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }

        let service = ctx.service_name().to_string();
        let attempts = ctx.attempt + 1;
        tracing::error!(service = %service, attempts, "Upstream unavailable after retries");
        let err = match last_failure {
            AttemptFailure::TimedOut => GatewayError::UpstreamTimeout { service, attempts },
            AttemptFailure::Unreachable(reason) => GatewayError::UpstreamUnreachable {
                service,
                attempts,
                reason,
            },
        };
        ticket.settle(true);
        Err(err)
    }

    async fn buffer_body(&self, body: AxumBody) -> Result<Bytes, GatewayError> {
        match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.is::<LengthLimitError>() => Err(GatewayError::PayloadTooLarge {
                limit: self.max_body_bytes,
            }),
            Err(e) => Err(GatewayError::BadRequest(format!(
                "failed to read request body: {e}"
            ))),
        }
    }

    fn finish_response(&self, response: Response, service: &str) -> Response {
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(X_GATEWAY, self.gateway_name.clone());
        if let Ok(service) = HeaderValue::from_str(service) {
            parts.headers.insert(X_GATEWAY_SERVICE, service);
        }
        Response::from_parts(parts, body)
    }
}
