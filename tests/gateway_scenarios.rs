// End-to-end gateway behaviour: real upstream stubs on loopback sockets for
// proxying, breaking and draining; a scripted client where exact call counts
// matter more than the wire.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{Body as AxumBody, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
};
use http::Request;
use http_body_util::BodyExt;
use rampart::{
    CircuitState, DrainReport, Gateway, HttpClient, HttpClientAdapter, RunningGateway,
    adapters::NoAuth,
    config::{
        CircuitBreakerConfig, ProxyConfig, RateLimitConfig, ServerConfig, UpstreamServiceConfig,
    },
    ports::http_client::{HttpClientError, HttpClientResult},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tower::ServiceExt;

#[derive(Clone, Default)]
struct Hits(Arc<AtomicUsize>);

impl Hits {
    fn record(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

async fn spawn_upstream(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fleet_config(upstream: SocketAddr) -> ServerConfig {
    ServerConfig::builder()
        .listen_addr("127.0.0.1:0")
        .service(
            "combat",
            UpstreamServiceConfig::new(format!("http://{upstream}")).with_timeout_ms(5_000),
        )
        .route("/api/v1/combat", "combat")
        .proxy(ProxyConfig {
            retry_backoff_ms: 1,
            ..ProxyConfig::default()
        })
        .build()
        .unwrap()
}

async fn start(gateway: Gateway) -> RunningGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    gateway.start_with_listener(listener).await.unwrap()
}

async fn send(
    client: &HttpClientAdapter,
    gateway: SocketAddr,
    method: &str,
    path: &str,
    body: &'static str,
) -> Response {
    let req = Request::builder()
        .method(method)
        .uri(format!("http://{gateway}{path}"))
        .body(AxumBody::from(body))
        .unwrap();
    client.send_request(req).await.unwrap()
}

async fn body_bytes(response: Response) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn echo(State(hits): State<Hits>, headers: HeaderMap, body: Bytes) -> Response {
    hits.record();
    let forwarded = headers
        .get("x-forwarded-for")
        .cloned()
        .unwrap_or_else(|| http::HeaderValue::from_static("missing"));
    (
        StatusCode::OK,
        [("x-seen-forwarded-for", forwarded)],
        body,
    )
        .into_response()
}

async fn broken(State(hits): State<Hits>) -> Response {
    hits.record();
    (StatusCode::INTERNAL_SERVER_ERROR, "combat engine crashed").into_response()
}

async fn slow(State(hits): State<Hits>) -> Response {
    hits.record();
    tokio::time::sleep(Duration::from_millis(300)).await;
    (StatusCode::OK, "resolved").into_response()
}

async fn stuck(State(hits): State<Hits>) -> Response {
    hits.record();
    tokio::time::sleep(Duration::from_secs(30)).await;
    StatusCode::OK.into_response()
}

/// A match event feed that never ends.
async fn feed(State(hits): State<Hits>) -> Response {
    hits.record();
    let ticks = futures_util::stream::unfold(0u64, |tick| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Some((
            Ok::<_, std::io::Error>(Bytes::from(format!("tick {tick}\n"))),
            tick + 1,
        ))
    });
    AxumBody::from_stream(ticks).into_response()
}

// Scenario A: a healthy upstream answers and the body comes back untouched
#[tokio::test(flavor = "multi_thread")]
async fn healthy_upstream_is_proxied_unchanged() {
    let hits = Hits::default();
    let upstream = spawn_upstream(
        axum::Router::new()
            .fallback(any(echo))
            .with_state(hits.clone()),
    )
    .await;

    let gateway = Gateway::new(fleet_config(upstream)).unwrap();
    let state = gateway.state().clone();
    let running = start(gateway).await;
    let client = HttpClientAdapter::new().unwrap();

    let payload = r#"{"attacker":"p-1","target":"p-2","skill":"fireball"}"#;
    let response = send(
        &client,
        running.local_addr(),
        "POST",
        "/api/v1/combat/attack",
        payload,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway"], "rampart");
    assert_eq!(response.headers()["x-gateway-service"], "combat");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.headers()["x-seen-forwarded-for"], "127.0.0.1");
    assert_eq!(body_bytes(response).await, payload.as_bytes());

    assert_eq!(hits.count(), 1);
    assert_eq!(state.breakers().state("combat"), Some(CircuitState::Closed));

    running.shutdown(Duration::from_secs(1)).await.unwrap();
}

// Scenario B: five upstream 500s open the circuit; the sixth never leaves the gateway
#[tokio::test(flavor = "multi_thread")]
async fn repeated_server_errors_open_the_circuit() {
    let hits = Hits::default();
    let upstream = spawn_upstream(
        axum::Router::new()
            .fallback(any(broken))
            .with_state(hits.clone()),
    )
    .await;

    let gateway = Gateway::new(fleet_config(upstream)).unwrap();
    let state = gateway.state().clone();
    let running = start(gateway).await;
    let client = HttpClientAdapter::new().unwrap();

    for _ in 0..5 {
        let response = send(&client, running.local_addr(), "GET", "/api/v1/combat/1", "").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_bytes(response).await, "combat engine crashed".as_bytes());
    }
    assert_eq!(state.breakers().state("combat"), Some(CircuitState::Open));

    let response = send(&client, running.local_addr(), "GET", "/api/v1/combat/1", "").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["x-circuit-state"], "open");
    assert!(response.headers().contains_key("retry-after"));

    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"], "circuit_open");
    assert_eq!(hits.count(), 5);

    running.shutdown(Duration::from_secs(1)).await.unwrap();
}

/// Upstream stand-in that answers `200` after `failures` connection errors.
struct ScriptedUpstream {
    calls: AtomicUsize,
    failures: usize,
}

impl ScriptedUpstream {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for ScriptedUpstream {
    async fn send_request(&self, _req: Request<AxumBody>) -> HttpClientResult<Response> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(HttpClientError::ConnectionError(
                "connection refused".to_string(),
            ));
        }
        Ok((StatusCode::OK, "ok").into_response())
    }

    async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<bool> {
        Ok(true)
    }
}

fn scripted_gateway(config: ServerConfig, upstream: Arc<ScriptedUpstream>) -> Gateway {
    Gateway::from_parts(config, upstream, Arc::new(NoAuth)).unwrap()
}

fn get(path: &str, client_ip: &str) -> Request<AxumBody> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", client_ip)
        .body(AxumBody::empty())
        .unwrap()
}

// Scenario C: the 1001st request in the window is limited, and so is the next one
#[tokio::test]
async fn rate_limit_blocks_after_window_budget() {
    let upstream = ScriptedUpstream::failing(0);
    let mut config = fleet_config("127.0.0.1:9".parse().unwrap());
    config.rate_limit = RateLimitConfig {
        requests_per_window: 1000,
        window_secs: 60,
        block_secs: 900,
        ..RateLimitConfig::default()
    };
    let router = scripted_gateway(config, upstream.clone()).router();

    for _ in 0..1000 {
        let response = router
            .clone()
            .oneshot(get("/api/v1/combat/ping", "198.51.100.23"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let limited = router
        .clone()
        .oneshot(get("/api/v1/combat/ping", "198.51.100.23"))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 800 && retry_after <= 900);

    let still_blocked = router
        .clone()
        .oneshot(get("/api/v1/combat/ping", "198.51.100.23"))
        .await
        .unwrap();
    assert_eq!(still_blocked.status(), StatusCode::TOO_MANY_REQUESTS);

    // other players are unaffected
    let other = router
        .oneshot(get("/api/v1/combat/ping", "198.51.100.24"))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(upstream.calls(), 1001);
}

#[tokio::test]
async fn transient_transport_failures_are_retried_without_breaker_failure() {
    let upstream = ScriptedUpstream::failing(2);
    let mut config = fleet_config("127.0.0.1:9".parse().unwrap());
    config.services.insert(
        "combat".to_string(),
        UpstreamServiceConfig::new("http://combat:8081").with_max_retries(3),
    );
    config.proxy.retry_backoff_ms = 50;
    let gateway = scripted_gateway(config, upstream.clone());
    let state = gateway.state().clone();

    let started = std::time::Instant::now();
    let response = gateway
        .router()
        .oneshot(get("/api/v1/combat/attack", "198.51.100.23"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(upstream.calls(), 3);
    // 50ms after the first failure, 100ms after the second
    assert!(started.elapsed() >= Duration::from_millis(150));
    let breaker = state.breakers().get("combat").unwrap();
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn exhausted_retries_count_as_one_breaker_failure() {
    let upstream = ScriptedUpstream::failing(usize::MAX);
    let mut config = fleet_config("127.0.0.1:9".parse().unwrap());
    config.services.insert(
        "combat".to_string(),
        UpstreamServiceConfig::new("http://combat:8081").with_max_retries(2),
    );
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        ..CircuitBreakerConfig::default()
    };
    let gateway = scripted_gateway(config, upstream.clone());
    let state = gateway.state().clone();
    let router = gateway.router();

    let response = router
        .clone()
        .oneshot(get("/api/v1/combat/attack", "198.51.100.23"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.calls(), 3);
    assert_eq!(state.breakers().get("combat").unwrap().failure_count(), 1);
    assert_eq!(state.breakers().state("combat"), Some(CircuitState::Closed));

    let response = router
        .oneshot(get("/api/v1/combat/attack", "198.51.100.23"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.calls(), 6);
    assert_eq!(state.breakers().state("combat"), Some(CircuitState::Open));
}

#[tokio::test(flavor = "multi_thread")]
async fn health_endpoints_answer_over_the_wire() {
    let hits = Hits::default();
    let upstream = spawn_upstream(
        axum::Router::new()
            .fallback(any(echo))
            .with_state(hits.clone()),
    )
    .await;

    let running = start(Gateway::new(fleet_config(upstream)).unwrap()).await;
    let client = HttpClientAdapter::new().unwrap();

    let health = send(&client, running.local_addr(), "GET", "/health", "").await;
    assert_eq!(health.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(health).await).unwrap();
    assert_eq!(body["circuits"][0]["service"], "combat");

    let upstreams = send(&client, running.local_addr(), "GET", "/health/upstreams", "").await;
    assert_eq!(upstreams.status(), StatusCode::OK);

    let ready = send(&client, running.local_addr(), "GET", "/ready", "").await;
    assert_eq!(ready.status(), StatusCode::OK);

    // the upstream health probe is the only call that reached the upstream
    assert_eq!(hits.count(), 1);

    running.shutdown(Duration::from_secs(1)).await.unwrap();
}

async fn wait_for_in_flight(running: &RunningGateway, expected: usize) {
    for _ in 0..200 {
        if running.in_flight() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("in-flight count never reached {expected}");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_in_flight_requests() {
    let hits = Hits::default();
    let upstream = spawn_upstream(
        axum::Router::new()
            .fallback(any(slow))
            .with_state(hits.clone()),
    )
    .await;

    let running = start(Gateway::new(fleet_config(upstream)).unwrap()).await;
    let addr = running.local_addr();
    let request = tokio::spawn(async move {
        let client = HttpClientAdapter::new().unwrap();
        let response = send(&client, addr, "GET", "/api/v1/combat/resolve", "").await;
        (response.status(), body_bytes(response).await)
    });

    wait_for_in_flight(&running, 1).await;
    let report = running.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            drained: true,
            abandoned: 0
        }
    );

    let (status, body) = request.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "resolved".as_bytes());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_deadline_force_closes_stragglers() {
    let hits = Hits::default();
    let upstream = spawn_upstream(
        axum::Router::new()
            .fallback(any(stuck))
            .with_state(hits.clone()),
    )
    .await;

    let gateway = Gateway::new(fleet_config(upstream)).unwrap();
    let state = gateway.state().clone();
    let running = start(gateway).await;
    let addr = running.local_addr();
    let request = tokio::spawn(async move {
        let client = HttpClientAdapter::new().unwrap();
        send(&client, addr, "GET", "/api/v1/combat/resolve", "")
            .await
            .status()
    });

    wait_for_in_flight(&running, 1).await;
    let report = running
        .shutdown(Duration::from_millis(200))
        .await
        .unwrap();
    assert!(!report.drained);
    assert_eq!(report.abandoned, 1);

    assert_eq!(request.await.unwrap(), StatusCode::SERVICE_UNAVAILABLE);
    // an abandoned call is not an upstream failure
    assert_eq!(state.breakers().get("combat").unwrap().failure_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_deadline_cuts_off_streaming_responses() {
    let hits = Hits::default();
    let upstream = spawn_upstream(
        axum::Router::new()
            .fallback(any(feed))
            .with_state(hits.clone()),
    )
    .await;

    let running = start(Gateway::new(fleet_config(upstream)).unwrap()).await;
    let client = HttpClientAdapter::new().unwrap();
    let response = send(&client, running.local_addr(), "GET", "/api/v1/combat/feed", "").await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert!(first.is_data());
    assert_eq!(running.in_flight(), 1);

    let reader = tokio::spawn(async move { body.collect().await.is_err() });

    let report = running
        .shutdown(Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(
        report,
        DrainReport {
            drained: false,
            abandoned: 1
        }
    );

    let cut_off = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("response stream outlived shutdown")
        .unwrap();
    assert!(cut_off);
}

/// Upstream stand-in whose calls never complete. Records when an in-flight
/// call is dropped.
#[derive(Default)]
struct HangingUpstream {
    calls: AtomicUsize,
    dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpClient for HangingUpstream {
    async fn send_request(&self, _req: Request<AxumBody>) -> HttpClientResult<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _flag = DropFlag(self.dropped.clone());
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<bool> {
        Ok(false)
    }
}

// A black-holed upstream must trip its breaker even when the request deadline
// is shorter than the service timeout.
#[tokio::test]
async fn request_deadline_on_hung_upstream_opens_the_circuit() {
    let upstream = Arc::new(HangingUpstream::default());
    let mut config = fleet_config("127.0.0.1:9".parse().unwrap());
    config.services.insert(
        "combat".to_string(),
        UpstreamServiceConfig::new("http://combat:8081"),
    );
    config.server.request_timeout_secs = 1;
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        ..CircuitBreakerConfig::default()
    };
    let gateway = Gateway::from_parts(config, upstream.clone(), Arc::new(NoAuth)).unwrap();
    let state = gateway.state().clone();
    let router = gateway.router();

    let started = std::time::Instant::now();
    let response = router
        .clone()
        .oneshot(get("/api/v1/combat/attack", "198.51.100.23"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.breakers().state("combat"), Some(CircuitState::Open));

    let response = router
        .oneshot(get("/api/v1/combat/attack", "198.51.100.23"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_disconnect_cancels_upstream_call_without_outcome() {
    let upstream = Arc::new(HangingUpstream::default());
    let dropped = upstream.dropped.clone();
    let gateway = Gateway::from_parts(
        fleet_config("127.0.0.1:9".parse().unwrap()),
        upstream.clone(),
        Arc::new(NoAuth),
    )
    .unwrap();
    let state = gateway.state().clone();
    let running = start(gateway).await;

    let mut conn = TcpStream::connect(running.local_addr()).await.unwrap();
    conn.write_all(b"GET /api/v1/combat/attack HTTP/1.1\r\nHost: play.example.com\r\n\r\n")
        .await
        .unwrap();
    wait_for_in_flight(&running, 1).await;
    for _ in 0..200 {
        if upstream.calls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    drop(conn);
    wait_for_in_flight(&running, 0).await;

    assert!(dropped.load(Ordering::SeqCst));
    let breaker = state.breakers().get("combat").unwrap();
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.state(), CircuitState::Closed);

    running.shutdown(Duration::from_secs(1)).await.unwrap();
}
