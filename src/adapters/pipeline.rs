//! Ordered request pipeline.
//!
//! The gateway's cross-cutting behaviour is a flat list of named [`Stage`]s.
//! Each stage receives the request plus a [`Next`] handle for the rest of the
//! list and either short-circuits with its own response or delegates. The list
//! is fixed at startup, so ordering is inspectable through
//! [`Pipeline::stage_names`] and each stage can be tested in isolation.
use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body as AxumBody,
    response::{IntoResponse, Response},
};
use http::Request;
use tokio::time::Instant;

use crate::{
    core::{BreakerTicket, GatewayError, ResolvedRoute},
    ports::authenticator::Identity,
    utils::ClientId,
};

/// An inbound request plus everything earlier stages learned about it.
pub struct PipelineRequest {
    pub request: Request<AxumBody>,
    /// Socket address of the directly connected peer
    pub peer: Option<SocketAddr>,
    pub client: ClientId,
    pub request_id: Option<String>,
    pub identity: Option<Identity>,
    pub route: Option<ResolvedRoute>,
    /// Breaker admission, settled by the proxy stage
    pub ticket: Option<BreakerTicket>,
    /// When the whole request must be answered by
    pub deadline: Option<Instant>,
}

impl PipelineRequest {
    pub fn new(request: Request<AxumBody>, peer: Option<SocketAddr>) -> Self {
        Self {
            request,
            peer,
            client: ClientId::unknown(),
            request_id: None,
            identity: None,
            route: None,
            ticket: None,
            deadline: None,
        }
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }
}

#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle(&self, req: PipelineRequest, next: Next<'_>) -> Response;
}

/// The stages after the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    pub async fn run(self, req: PipelineRequest) -> Response {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(req, Next { stages: rest }).await,
            None => {
                tracing::error!(path = req.path(), "Pipeline ended without a terminal stage");
                GatewayError::Internal("request was not handled".to_string()).into_response()
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn run(&self, req: PipelineRequest) -> Response {
        Next {
            stages: &self.stages,
        }
        .run(req)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::StatusCode;

    use super::*;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, req: PipelineRequest, next: Next<'_>) -> Response {
            self.log.lock().unwrap().push(self.name);
            if self.short_circuit {
                return StatusCode::TOO_MANY_REQUESTS.into_response();
            }
            next.run(req).await
        }
    }

    struct Terminal;

    #[async_trait]
    impl Stage for Terminal {
        fn name(&self) -> &'static str {
            "terminal"
        }

        async fn handle(&self, _req: PipelineRequest, _next: Next<'_>) -> Response {
            StatusCode::OK.into_response()
        }
    }

    fn request() -> PipelineRequest {
        PipelineRequest::new(
            Request::builder()
                .uri("/api/v1/chat")
                .body(AxumBody::empty())
                .unwrap(),
            None,
        )
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        short_circuit: bool,
    ) -> Arc<dyn Stage> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            short_circuit,
        })
    }

    #[tokio::test]
    async fn stages_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("first", &log, false),
            recorder("second", &log, false),
            Arc::new(Terminal),
        ]);

        assert_eq!(pipeline.stage_names(), ["first", "second", "terminal"]);
        let response = pipeline.run(request()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), ["first", "second"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_later_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("limit", &log, true),
            recorder("never", &log, false),
            Arc::new(Terminal),
        ]);

        let response = pipeline.run(request()).await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(*log.lock().unwrap(), ["limit"]);
    }

    #[tokio::test]
    async fn missing_terminal_stage_is_internal_error() {
        let response = Pipeline::default().run(request()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
