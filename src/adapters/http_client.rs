use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

const USER_AGENT: &str = concat!("rampart/", env!("CARGO_PKG_VERSION"));

/// Outbound client built on hyper-util's pooled client with rustls.
///
/// Plain `http://` and `https://` upstreams are both supported; TLS roots come
/// from the platform store. Deadlines and retries are owned by the proxy
/// executor, so `send_request` itself never times out.
#[derive(Clone)]
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // ignore the error if another component installed a provider first
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }
        tracing::debug!("Loaded {} native root certificates", root_cert_store.len());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, AxumBody>(https_connector);

        Ok(Self { client })
    }

    /// Point the Host header at the upstream and default the User-Agent.
    fn prepare_headers(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let host = req.uri().host().ok_or_else(|| {
            HttpClientError::InvalidRequest(format!("Outgoing URI has no host: {}", req.uri()))
        })?;
        let host_value = match req.uri().port_u16() {
            Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
            None => HeaderValue::from_str(host),
        }
        .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let headers = req.headers_mut();
        headers.insert(header::HOST, host_value);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::prepare_headers(&mut req)?;
        *req.version_mut() = Version::HTTP_11;

        let method = req.method().clone();
        let uri = req.uri().clone();
        tracing::debug!(%method, %uri, "Sending upstream request");

        match self.client.request(req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                // framing is re-done by the inbound server
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(body)))
            }
            Err(e) => {
                tracing::debug!(%method, %uri, error = %e, "Upstream request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "{method} {uri} failed: {e}"
                )))
            }
        }
    }

    async fn health_check(&self, url: &str, deadline: Duration) -> HttpClientResult<bool> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        Self::prepare_headers(&mut request)?;

        match timeout(deadline, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let is_healthy = response.status().is_success();
                // drain so the connection can return to the pool
                let _ = response.into_body().collect().await;
                tracing::debug!(url, is_healthy, "Health check finished");
                Ok(is_healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!(url, error = %err, "Health check connection error");
                Ok(false)
            }
            Err(_) => {
                tracing::debug!(url, "Health check timed out");
                Err(HttpClientError::Timeout(deadline))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[test]
    fn test_prepare_headers_sets_host_and_agent() {
        let mut req = Request::builder()
            .uri("http://combat:8081/api/v1/combat/initiate")
            .header(header::HOST, "gateway.example.com")
            .body(AxumBody::empty())
            .unwrap();

        HttpClientAdapter::prepare_headers(&mut req).unwrap();

        assert_eq!(req.headers()[header::HOST], "combat:8081");
        assert_eq!(req.headers()[header::USER_AGENT], USER_AGENT);
    }

    #[test]
    fn test_prepare_headers_requires_host() {
        let mut req = Request::builder()
            .uri("/relative/path")
            .body(AxumBody::empty())
            .unwrap();

        assert!(matches!(
            HttpClientAdapter::prepare_headers(&mut req),
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        let client = HttpClientAdapter::new().unwrap();
        // port 9 (discard) is closed on test hosts
        let result = client
            .health_check("http://127.0.0.1:9/health", Duration::from_secs(2))
            .await;

        assert!(matches!(result, Ok(false)));
    }
}
