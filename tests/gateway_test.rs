use api_gateway::auth::JwtAuthenticator;
use api_gateway::config::{GatewayConfig, PolicyConfig};
use api_gateway::server::GatewayState;
use api_gateway::store::MemoryStore;
use api_gateway::Gateway;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const SECRET: &str = "integration-secret";

fn token(user_id: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 600;
    encode(
        &Header::default(),
        &json!({ "userId": user_id, "exp": exp }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// A backend that answers every request with `respond` and counts hits.
async fn backend<F>(hits: Arc<AtomicUsize>, respond: F) -> SocketAddr
where
    F: Fn(Request<Body>) -> Response<Body> + Clone + Send + Sync + 'static,
{
    let make_service = make_service_fn(move |_| {
        let respond = respond.clone();
        let hits = hits.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                hits.fetch_add(1, Ordering::SeqCst);
                let response = respond(req);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn echo_path(req: Request<Body>) -> Response<Body> {
    let body = json!({ "path": req.uri().to_string(), "user": req.headers().get("x-user-id").and_then(|v| v.to_str().ok()) });
    Response::builder()
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn config_for(addr: SocketAddr) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    for service in &mut config.services {
        service.base_url = format!("http://{}", addr);
    }
    config.health.probe_timeout_ms = 300;
    config
}

struct Running {
    base: String,
    gateway: Arc<Gateway>,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start(config: GatewayConfig) -> Running {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let state = GatewayState::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(JwtAuthenticator::new(SECRET)),
    )
    .unwrap();
    let gateway = Arc::new(Gateway::with_state(state));
    let serving = gateway.clone();
    let handle = tokio::spawn(async move { serving.serve(listener).await });
    Running {
        base: format!("http://{}", addr),
        gateway,
        handle,
    }
}

#[tokio::test]
async fn unknown_prefix_lists_available_endpoints() {
    let hits = Arc::new(AtomicUsize::new(0));
    let gw = start(config_for(backend(hits.clone(), echo_path).await)).await;

    let response = reqwest::get(format!("{}/api/nothing-here", gw.base)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    let endpoints: Vec<&str> = body["availableEndpoints"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    for prefix in ["/api/documents", "/api/chat", "/ws/chat", "/api/files", "/api/ai", "/api/vectors"] {
        assert!(endpoints.contains(&prefix), "missing {}", prefix);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn identical_gets_hit_the_backend_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let gw = start(config_for(backend(hits.clone(), echo_path).await)).await;
    let client = reqwest::Client::new();
    let bearer = format!("Bearer {}", token("user-42"));

    let first = client
        .get(format!("{}/api/vectors/search?query=x&limit=5", gw.base))
        .header("authorization", &bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "MISS");
    let first_body = first.bytes().await.unwrap();

    let second = client
        .get(format!("{}/api/vectors/search?limit=5&query=x", gw.base))
        .header("authorization", &bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");
    let second_body = second.bytes().await.unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let forwarded: Value = serde_json::from_slice(&first_body).unwrap();
    assert_eq!(forwarded["path"], "/search?query=x&limit=5");
    assert_eq!(forwarded["user"], "user-42");
}

#[tokio::test]
async fn chat_creation_without_token_never_reaches_backend() {
    let hits = Arc::new(AtomicUsize::new(0));
    let gw = start(config_for(backend(hits.clone(), echo_path).await)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/chat", gw.base))
        .json(&json!({ "title": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Access token required");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upstream_quota_becomes_429() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = backend(hits.clone(), |_| {
        Response::builder()
            .status(429)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"error":{"message":"You exceeded your current quota"}}"#))
            .unwrap()
    })
    .await;
    let gw = start(config_for(addr)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/ai/chat", gw.base))
        .header("authorization", format!("Bearer {}", token("u1")))
        .json(&json!({ "prompt": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().starts_with("API quota exceeded"));
}

#[tokio::test]
async fn dead_service_is_503_naming_it() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut config = config_for(backend(hits, echo_path).await);
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    for service in &mut config.services {
        if service.name == "file-storage-service" {
            service.base_url = format!("http://{}", dead);
        }
    }
    let gw = start(config).await;

    let response = reqwest::Client::new()
        .get(format!("{}/api/files/123", gw.base))
        .header("authorization", format!("Bearer {}", token("u1")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Service temporarily unavailable");
    assert!(body["message"].as_str().unwrap().contains("file-storage-service"));
}

#[tokio::test]
async fn exhausted_policy_returns_retry_after() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut config = config_for(backend(hits.clone(), echo_path).await);
    config.rate_limits = vec![PolicyConfig {
        name: "general".to_string(),
        window_secs: 60,
        max_requests: 2,
        methods: Vec::new(),
        path_prefixes: Vec::new(),
        exact_paths: Vec::new(),
        message: None,
    }];
    let gw = start(config).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/documents", gw.base);
    let bearer = format!("Bearer {}", token("u7"));

    for remaining in ["1", "0"] {
        let ok = client.post(&url).header("authorization", &bearer).send().await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()["x-ratelimit-remaining"], remaining);
    }

    let limited = client.post(&url).header("authorization", &bearer).send().await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
    let body: Value = limited.json().await.unwrap();
    assert_eq!(body["retryAfter"], retry_after);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // another user has their own counter
    let other = client
        .post(&url)
        .header("authorization", format!("Bearer {}", token("u8")))
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_report_is_bounded_by_one_probe_timeout() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut config = config_for(backend(hits, echo_path).await);

    let hung = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hung_addr = hung.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = hung.accept().await {
            held.push(socket);
        }
    });
    for service in &mut config.services {
        if service.name == "ai-service" {
            service.base_url = format!("http://{}", hung_addr);
        }
    }
    let gw = start(config).await;

    let started = Instant::now();
    let response = reqwest::get(format!("{}/health/services", gw.base)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["services"]["ai-service"]["status"], "unhealthy");
    assert_eq!(body["services"]["document-service"]["status"], "healthy");
    assert!(body["services"]["chat-service"]["responseTime"].is_string());
}

/// Backend that accepts an upgrade and echoes raw bytes afterwards.
async fn echo_upgrade_backend() -> SocketAddr {
    let make_service = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|mut req: Request<Body>| async move {
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = on_upgrade.await {
                    let (mut read, mut write) = tokio::io::split(upgraded);
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                }
            });
            Ok::<_, Infallible>(
                Response::builder()
                    .status(101)
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .header("sec-websocket-accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
                    .body(Body::empty())
                    .unwrap(),
            )
        }))
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

#[tokio::test]
async fn websocket_upgrade_is_spliced() {
    let gw = start(config_for(echo_upgrade_backend().await)).await;
    let addr = gw.base.trim_start_matches("http://").to_string();

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let handshake = format!(
        "GET /ws/chat?token={} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        token("u1"),
        addr
    );
    stream.write_all(handshake.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected handshake: {}", head);
    assert!(head.to_ascii_lowercase().contains("sec-websocket-accept"));

    stream.write_all(b"hello through the gateway").await.unwrap();
    let mut echoed = [0u8; 25];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello through the gateway");
}

#[tokio::test]
async fn shutdown_stops_the_server() {
    let hits = Arc::new(AtomicUsize::new(0));
    let gw = start(config_for(backend(hits, echo_path).await)).await;
    let response = reqwest::get(format!("{}/health", gw.base)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    gw.gateway.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), gw.handle).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
}

/// Sends the response head and one chunk, then never finishes the body.
fn stalled(status: u16) -> impl Fn(Request<Body>) -> Response<Body> + Clone + Send + Sync + 'static {
    move |_| {
        let (mut sender, body) = Body::channel();
        tokio::spawn(async move {
            let _ = sender.send_data(hyper::body::Bytes::from_static(b"[1,")).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(sender);
        });
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }
}

#[tokio::test]
async fn stalled_error_body_is_answered_within_the_request_timeout() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut config = config_for(backend(hits, stalled(500)).await);
    config.request_timeout_ms = 500;
    let gw = start(config).await;

    let started = Instant::now();
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        reqwest::Client::new()
            .get(format!("{}/api/ai/x", gw.base))
            .bearer_auth(token("u1"))
            .send(),
    )
    .await
    .expect("gateway answered within 5s")
    .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stalled_cacheable_body_still_sends_headers() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut config = config_for(backend(hits, stalled(200)).await);
    config.request_timeout_ms = 500;
    let gw = start(config).await;

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        reqwest::Client::new()
            .get(format!("{}/api/vectors/search?q=1", gw.base))
            .bearer_auth(token("u1"))
            .send(),
    )
    .await
    .expect("response headers within 5s")
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "MISS");
    // the body is cut off once the upstream stops sending
    let body = tokio::time::timeout(Duration::from_secs(5), response.bytes())
        .await
        .expect("body ends within 5s");
    assert!(body.is_err());
}

#[tokio::test]
async fn query_token_is_not_forwarded() {
    let hits = Arc::new(AtomicUsize::new(0));
    let gw = start(config_for(backend(hits.clone(), echo_path).await)).await;
    let client = reqwest::Client::new();

    let anonymous = client
        .get(format!("{}/api/documents?token={}", gw.base, token("u1")))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let response = client
        .get(format!("{}/api/documents?page=2&token=stale", gw.base))
        .bearer_auth(token("u1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["path"], "/?page=2");
    assert_eq!(body["user"], "u1");
}
