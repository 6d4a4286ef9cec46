//! The gateway front door: request driver, local endpoints and the hyper server.

use crate::auth::{Authenticator, JwtAuthenticator};
use crate::cache::{ResponseCache, X_CACHE};
use crate::config::{Environment, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::health::{HealthAggregator, SERVICES_PATH};
use crate::pipeline::{
    Authenticate, CacheLookup, Flow, Pipeline, RateLimit, RequestContext, RequireRoute,
    ResolveRoute, ValidateJson,
};
use crate::proxy::{Dispatcher, X_REQUEST_ID};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::routes::RouteTable;
use crate::store::{self, SharedStore};
use futures_util::FutureExt;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use metrics::{counter, histogram};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub const HEALTH_PATH: &str = "/health";
pub const DOCS_PATH: &str = "/api/docs";
pub const LOCAL_PATHS: [&str; 3] = [HEALTH_PATH, SERVICES_PATH, DOCS_PATH];

const SERVICE_NAME: &str = "api-gateway";

/// Everything a request needs, built once at startup and shared by `Arc`.
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub routes: Arc<RouteTable>,
    pub store: SharedStore,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
    pub health: Arc<HealthAggregator>,
    pipeline: Pipeline,
    dispatcher: Dispatcher,
    started_at: Instant,
}

impl GatewayState {
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let store = store::from_config(&config.store)?;
        let authenticator = Arc::new(JwtAuthenticator::from_config(&config.auth, config.environment));
        Self::new(config, store, authenticator)
    }

    pub fn new(
        config: GatewayConfig,
        store: SharedStore,
        authenticator: Arc<dyn Authenticator>,
    ) -> anyhow::Result<Self> {
        let routes = Arc::new(RouteTable::from_config(&config)?);
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limits, store.clone())?);
        let cache = Arc::new(
            ResponseCache::new(store.clone(), config.cache.clone())
                .with_fill_timeout(Duration::from_millis(config.request_timeout_ms)),
        );
        let health = Arc::new(HealthAggregator::new(
            routes.services().to_vec(),
            &config.health,
            Some(cache.clone()),
        )?);

        let pipeline = Pipeline::new(vec![
            Box::new(ResolveRoute { routes: routes.clone() }),
            Box::new(Authenticate { authenticator }),
            Box::new(RateLimit { limiter: limiter.clone() }),
            Box::new(RequireRoute {
                routes: routes.clone(),
                local_paths: LOCAL_PATHS.to_vec(),
            }),
            Box::new(ValidateJson {
                max_body_bytes: config.max_body_bytes,
            }),
            Box::new(CacheLookup { cache: cache.clone() }),
        ]);
        let dispatcher = Dispatcher::new(
            Duration::from_millis(config.request_timeout_ms),
            Duration::from_millis(config.upgrade_close_grace_ms),
        );

        Ok(Self {
            config: Arc::new(config),
            routes,
            store,
            limiter,
            cache,
            health,
            pipeline,
            dispatcher,
            started_at: Instant::now(),
        })
    }

    fn environment(&self) -> Environment {
        self.config.environment
    }

    /// Drive one request to a response. Never fails: every error and panic is
    /// rendered as a JSON envelope.
    pub async fn handle(self: Arc<Self>, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let request_id = request_id(&req);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let started = Instant::now();

        let (parts, body) = req.into_parts();
        let ctx = RequestContext::new(parts, body, remote_addr, request_id.clone());

        let outcome = AssertUnwindSafe(self.drive(ctx)).catch_unwind().await;
        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                err.log(&request_id);
                err.to_response(self.environment())
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "request handler panicked".to_string());
                let err = GatewayError::internal(detail);
                err.log(&request_id);
                err.to_response(self.environment())
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        let status = response.status().as_u16().to_string();
        counter!("gateway.requests", 1, "method" => method.to_string(), "status" => status);
        histogram!("gateway.request.duration_ms", started.elapsed().as_millis() as f64);
        tracing::debug!(
            request_id = %request_id,
            %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }

    async fn drive(&self, mut ctx: RequestContext) -> Result<Response<Body>> {
        let flow = self.pipeline.run(&mut ctx).await?;
        let rate = ctx.rate_limit.clone();

        let mut response = match flow {
            Flow::Respond(response) => response,
            Flow::Continue if ctx.route.is_some() => self.forward(ctx).await?,
            Flow::Continue => self.local(&ctx.parts.method, ctx.parts.uri.path()).await?,
        };

        if let Some(RateDecision::Allowed { limit, remaining, .. }) = rate {
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
        }
        Ok(response)
    }

    async fn forward(&self, ctx: RequestContext) -> Result<Response<Body>> {
        let plan = ctx.cache_plan.clone();
        let response = self.dispatcher.dispatch(ctx).await?;
        Ok(match plan {
            Some(plan) => self.cache.write_through(&plan, response),
            None => response,
        })
    }

    async fn local(&self, method: &Method, path: &str) -> Result<Response<Body>> {
        if method != Method::GET {
            return Err(GatewayError::RouteNotFound {
                path: path.to_string(),
                available: self.available_endpoints(),
            });
        }

        match path {
            HEALTH_PATH => {
                // the gateway stays live without its store; limits and cache pass through
                let reachable = match self.store.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(backend = self.store.backend(), error = %e, "Store ping failed");
                        false
                    }
                };
                json_response(
                    StatusCode::OK,
                    &json!({
                        "status": "healthy",
                        "service": SERVICE_NAME,
                        "timestamp": chrono::Utc::now(),
                        "uptime": self.started_at.elapsed().as_secs_f64(),
                        "store": {
                            "backend": self.store.backend(),
                            "reachable": reachable,
                        },
                    }),
                )
            }
            SERVICES_PATH => {
                let (report, cached) = self.health.report().await;
                let mut response = json_response(StatusCode::OK, &report)?;
                let hit = if cached { "HIT" } else { "MISS" };
                response.headers_mut().insert(X_CACHE, HeaderValue::from_static(hit));
                Ok(response)
            }
            DOCS_PATH => json_response(StatusCode::OK, &self.docs()),
            other => Err(GatewayError::internal(format!("no local handler for {}", other))),
        }
    }

    fn available_endpoints(&self) -> Vec<String> {
        let mut endpoints = self.routes.prefixes();
        endpoints.extend(LOCAL_PATHS.iter().map(|p| p.to_string()));
        endpoints
    }

    fn docs(&self) -> serde_json::Value {
        let endpoints: Vec<_> = self
            .routes
            .routes()
            .iter()
            .map(|route| {
                json!({
                    "prefix": route.prefix,
                    "service": route.service.name,
                    "requiresAuth": route.requires_auth,
                    "upgrade": route.upgrade,
                    "description": route.description,
                })
            })
            .collect();
        let rate_limits: Vec<_> = self
            .limiter
            .policies()
            .iter()
            .map(|policy| {
                json!({
                    "name": policy.name,
                    "windowSecs": policy.window.as_secs(),
                    "maxRequests": policy.max_requests,
                })
            })
            .collect();

        json!({
            "name": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": endpoints,
            "local": LOCAL_PATHS,
            "rateLimits": rate_limits,
            "store": self.store.backend(),
        })
    }
}

/// Reuse a sane client-supplied request id, otherwise mint one.
fn request_id(req: &Request<Body>) -> String {
    req.headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>> {
    let body = serde_json::to_vec(value).map_err(|e| GatewayError::internal(e.to_string()))?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| GatewayError::internal(e.to_string()))
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(
    state: Arc<GatewayState>,
    listener: std::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let make_service = make_service_fn(move |conn: &AddrStream| {
        let remote_addr = conn.remote_addr();
        let state = state.clone();

        async move {
            let service = ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .service(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(state.handle(req, remote_addr).await) }
                }));
            Ok::<_, Infallible>(service)
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_service);
    tracing::info!(addr = %server.local_addr(), "Gateway listening");
    server.with_graceful_shutdown(shutdown).await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::token_for;
    use crate::store::testing::UnavailableStore;
    use crate::store::MemoryStore;
    use hyper::header::AUTHORIZATION;

    const SECRET: &str = "server-secret";

    fn state(config: GatewayConfig) -> Arc<GatewayState> {
        state_with_store(config, Arc::new(MemoryStore::new()))
    }

    fn state_with_store(mut config: GatewayConfig, store: SharedStore) -> Arc<GatewayState> {
        config.health.probe_timeout_ms = 200;
        Arc::new(
            GatewayState::new(config, store, Arc::new(JwtAuthenticator::new(SECRET))).unwrap(),
        )
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn remote() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn liveness_is_local() {
        let response = state(GatewayConfig::default())
            .handle(Request::get("/health").body(Body::empty()).unwrap(), remote())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(X_REQUEST_ID));
        assert_eq!(response.headers()["x-ratelimit-limit"], "1000");
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "api-gateway");
        assert_eq!(body["store"]["backend"], "memory");
        assert_eq!(body["store"]["reachable"], true);
    }

    #[tokio::test]
    async fn liveness_survives_store_outage() {
        let response = state_with_store(GatewayConfig::default(), Arc::new(UnavailableStore))
            .handle(
                Request::get("/health")
                    .header(AUTHORIZATION, "Bearer stale.token.value")
                    .body(Body::empty())
                    .unwrap(),
                remote(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"]["reachable"], false);
    }

    #[tokio::test]
    async fn unknown_path_gets_envelope() {
        let response = state(GatewayConfig::default())
            .handle(Request::get("/api/unknown").body(Body::empty()).unwrap(), remote())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Endpoint not found");
        let endpoints = body["availableEndpoints"].as_array().unwrap();
        assert!(endpoints.iter().any(|e| e == "/api/vectors"));
        assert!(endpoints.iter().any(|e| e == "/api/docs"));
    }

    #[tokio::test]
    async fn docs_list_routes_and_policies() {
        let response = state(GatewayConfig::default())
            .handle(Request::get("/api/docs").body(Body::empty()).unwrap(), remote())
            .await;
        let body = body_json(response).await;
        assert_eq!(body["endpoints"].as_array().unwrap().len(), 6);
        assert_eq!(body["rateLimits"][0]["name"], "chat-creation");
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn down_services_report_degraded() {
        let mut config = GatewayConfig::default();
        for service in &mut config.services {
            // nothing listens on port 1
            service.base_url = "http://127.0.0.1:1".to_string();
        }
        let response = state(config)
            .handle(Request::get("/health/services").body(Body::empty()).unwrap(), remote())
            .await;
        assert_eq!(response.headers()[X_CACHE], "MISS");
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"]["chat-service"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn client_request_id_is_echoed() {
        let response = state(GatewayConfig::default())
            .handle(
                Request::get("/health")
                    .header(X_REQUEST_ID, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
                remote(),
            )
            .await;
        assert_eq!(response.headers()[X_REQUEST_ID], "abc-123");
    }

    #[tokio::test]
    async fn invalid_token_is_forbidden_and_unreachable_service_is_503() {
        let mut config = GatewayConfig::default();
        for service in &mut config.services {
            service.base_url = "http://127.0.0.1:1".to_string();
        }
        let state = state(config);

        let forbidden = state
            .clone()
            .handle(
                Request::get("/api/chat")
                    .header(AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
                remote(),
            )
            .await;
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let unavailable = state
            .handle(
                Request::get("/api/chat")
                    .header(AUTHORIZATION, format!("Bearer {}", token_for(SECRET, "u1")))
                    .body(Body::empty())
                    .unwrap(),
                remote(),
            )
            .await;
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(unavailable).await;
        assert_eq!(body["error"], "Service temporarily unavailable");
        assert!(body["message"].as_str().unwrap().contains("chat-service"));
    }
}
