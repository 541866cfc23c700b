use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use axum::{
    body::{Body as AxumBody, BodyDataStream},
    extract::ConnectInfo,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use hyper::Request;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::pipeline::{Pipeline, PipelineRequest},
    core::{GatewayError, GatewayService},
    ports::http_client::HttpClient,
    utils::{RequestGuard, RequestTracker},
};

/// Entry point for every inbound request.
///
/// Health and readiness endpoints are answered here directly; everything else
/// runs through the stage pipeline while being counted by the request tracker.
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    pipeline: Arc<Pipeline>,
    http_client: Arc<dyn HttpClient>,
    tracker: RequestTracker,
    accepting: Arc<AtomicBool>,
    started_at: Instant,
}

impl HttpHandler {
    pub fn new(
        gateway: Arc<GatewayService>,
        pipeline: Arc<Pipeline>,
        http_client: Arc<dyn HttpClient>,
        tracker: RequestTracker,
    ) -> Self {
        Self {
            gateway,
            pipeline,
            http_client,
            tracker,
            accepting: Arc::new(AtomicBool::new(true)),
            started_at: Instant::now(),
        }
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Flip readiness to draining.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Run a request through the pipeline. The request stays in flight until
    /// its response body has been sent. Once the drain deadline passes the
    /// request is abandoned (aborting any upstream call) with a 503, or its
    /// body is cut off if the response is already streaming.
    pub async fn handle_request(&self, req: Request<AxumBody>) -> Response {
        let guard = self.tracker.track();
        let force_close = self.tracker.force_close_token();
        if force_close.is_cancelled() {
            return GatewayError::ShuttingDown.into_response();
        }

        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        tokio::select! {
            response = self.pipeline.run(PipelineRequest::new(req, peer)) => {
                response.map(|body| tracked_body(body, guard, force_close))
            }
            _ = force_close.cancelled() => {
                tracing::warn!("Request cancelled by forced shutdown");
                GatewayError::ShuttingDown.into_response()
            }
        }
    }

    /// Liveness plus every breaker's current state.
    pub async fn handle_health(&self) -> Response {
        let config = self.gateway.config();
        let body = serde_json::json!({
            "status": "healthy",
            "gateway": config.gateway_name,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "in_flight": self.tracker.in_flight(),
            "routes": self.gateway.router().len(),
            "circuits": self.gateway.breakers().snapshots(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(StatusCode::OK, body)
    }

    /// Probe every upstream's health path concurrently.
    pub async fn handle_upstream_health(&self) -> Response {
        let probes = self.gateway.services().map(|service| {
            let client = self.http_client.clone();
            let url = service.health_url();
            let timeout = service.timeout();
            let name = service.name().to_string();
            let circuit = self.gateway.breakers().state(&name);
            async move {
                let result = client.health_check(&url, timeout).await;
                let healthy = matches!(result, Ok(true));
                let error = result.err().map(|e| e.to_string());
                (
                    healthy,
                    serde_json::json!({
                        "service": name,
                        "url": url,
                        "healthy": healthy,
                        "circuit": circuit,
                        "error": error,
                    }),
                )
            }
        });

        let results = futures_util::future::join_all(probes).await;
        let all_healthy = results.iter().all(|(healthy, _)| *healthy);
        let services: Vec<_> = results.into_iter().map(|(_, report)| report).collect();

        let status = if all_healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body = serde_json::json!({
            "status": if all_healthy { "healthy" } else { "degraded" },
            "services": services,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(status, body)
    }

    pub async fn handle_ready(&self) -> Response {
        if self.is_accepting() {
            json_response(StatusCode::OK, serde_json::json!({ "status": "ready" }))
        } else {
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "status": "draining" }),
            )
        }
    }
}

struct TrackedStream {
    data: BodyDataStream,
    force_close: CancellationToken,
    _guard: RequestGuard,
}

/// Hold `guard` until `body` ends, and fail the body once `force_close` fires
/// so the connection carrying it is torn down.
fn tracked_body(body: AxumBody, guard: RequestGuard, force_close: CancellationToken) -> AxumBody {
    let state = TrackedStream {
        data: body.into_data_stream(),
        force_close,
        _guard: guard,
    };
    let stream = futures_util::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        tokio::select! {
            biased;
            _ = state.force_close.cancelled() => {
                tracing::warn!("Response body cut off by forced shutdown");
                Some((Err(axum::Error::new(GatewayError::ShuttingDown)), None))
            }
            chunk = state.data.next() => chunk.map(|chunk| (chunk, Some(state))),
        }
    });
    AxumBody::from_stream(stream)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
