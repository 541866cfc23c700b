use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Failures reaching an upstream. Any HTTP response that was actually
/// received, whatever its status, is a success at this layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connecting, writing the request or reading the response head failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The outbound request could not be built or has no host
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Port for outbound HTTP calls to upstream services
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request and return the upstream response with its body streaming.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// GET `url`, returning whether it answered with a 2xx status inside `timeout`.
    ///
    /// Connection failures yield `Ok(false)`; only an elapsed timeout is an error.
    async fn health_check(&self, url: &str, timeout: Duration) -> HttpClientResult<bool>;
}
