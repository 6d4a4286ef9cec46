//! Ordered request pipeline.
//!
//! Each stage either lets the request continue or short-circuits it with a
//! response. Errors returned by a stage end the pipeline and are rendered by
//! the request driver; stages never write error responses themselves.

use crate::auth::{strip_token_param, Authenticator, Identity, TOKEN_PARAM};
use crate::cache::{CachePlan, ResponseCache};
use crate::error::{GatewayError, Result};
use crate::rate_limit::{scope_key, RateDecision, RateLimiter};
use crate::routes::{RouteEntry, RouteTable};
use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::http::uri::PathAndQuery;
use hyper::{Body, Method, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Everything the stages learn about a request on its way through.
pub struct RequestContext {
    pub parts: Parts,
    pub body: Body,
    pub remote_addr: SocketAddr,
    pub request_id: String,
    pub route: Option<Arc<RouteEntry>>,
    pub identity: Option<Identity>,
    pub rate_limit: Option<RateDecision>,
    pub cache_plan: Option<CachePlan>,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(parts: Parts, body: Body, remote_addr: SocketAddr, request_id: String) -> Self {
        Self {
            parts,
            body,
            remote_addr,
            request_id,
            route: None,
            identity: None,
            rate_limit: None,
            cache_plan: None,
            started: Instant::now(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.parts.uri.query()
    }
}

#[derive(Debug)]
pub enum Flow {
    Continue,
    Respond(Response<Body>),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut RequestContext) -> Result<Flow>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut RequestContext) -> Result<Flow> {
        for stage in &self.stages {
            match stage.run(ctx).await? {
                Flow::Continue => {}
                Flow::Respond(response) => {
                    tracing::debug!(request_id = %ctx.request_id, stage = stage.name(), "Request answered by stage");
                    return Ok(Flow::Respond(response));
                }
            }
        }
        Ok(Flow::Continue)
    }
}

/// Attaches the matching route, if any.
pub struct ResolveRoute {
    pub routes: Arc<RouteTable>,
}

#[async_trait]
impl Stage for ResolveRoute {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<Flow> {
        ctx.route = self.routes.resolve(ctx.path());
        Ok(Flow::Continue)
    }
}

/// Verifies credentials. Runs before rate limiting so that authenticated
/// traffic is counted per user.
pub struct Authenticate {
    pub authenticator: Arc<dyn Authenticator>,
}

#[async_trait]
impl Stage for Authenticate {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<Flow> {
        let required = ctx.route.as_ref().map_or(false, |r| r.requires_auth);
        let credentials = self
            .authenticator
            .authenticate(&ctx.parts.headers, ctx.parts.uri.query());
        ctx.identity = credentials.require(required)?;
        scrub_query_token(&mut ctx.parts.uri)?;
        Ok(Flow::Continue)
    }
}

/// Drop any `token` query parameter so it is neither forwarded upstream nor
/// folded into a cache key.
fn scrub_query_token(uri: &mut Uri) -> Result<()> {
    let query = match uri.query() {
        Some(query) if query.split('&').any(|pair| pair.split('=').next() == Some(TOKEN_PARAM)) => query,
        _ => return Ok(()),
    };
    let path_and_query = match strip_token_param(query) {
        Some(rest) => format!("{}?{}", uri.path(), rest),
        None => uri.path().to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query)
            .map_err(|e| GatewayError::internal(e.to_string()))?,
    );
    *uri = Uri::from_parts(parts).map_err(|e| GatewayError::internal(e.to_string()))?;
    Ok(())
}

pub struct RateLimit {
    pub limiter: Arc<RateLimiter>,
}

#[async_trait]
impl Stage for RateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<Flow> {
        let scope = scope_key(ctx.identity.as_ref(), ctx.remote_addr.ip());
        let decision = self
            .limiter
            .check(&ctx.parts.method, ctx.parts.uri.path(), &scope)
            .await;
        match decision {
            RateDecision::Limited {
                policy,
                retry_after_secs,
                message,
                ..
            } => Err(GatewayError::RateLimited {
                policy,
                message,
                retry_after_secs,
            }),
            decision => {
                ctx.rate_limit = Some(decision);
                Ok(Flow::Continue)
            }
        }
    }
}

/// Rejects paths that match neither a route nor a local endpoint.
pub struct RequireRoute {
    pub routes: Arc<RouteTable>,
    pub local_paths: Vec<&'static str>,
}

#[async_trait]
impl Stage for RequireRoute {
    fn name(&self) -> &'static str {
        "require_route"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<Flow> {
        if ctx.route.is_some() || self.local_paths.iter().any(|p| *p == ctx.path()) {
            return Ok(Flow::Continue);
        }
        let mut available = self.routes.prefixes();
        available.extend(self.local_paths.iter().map(|p| p.to_string()));
        Err(GatewayError::RouteNotFound {
            path: ctx.path().to_string(),
            available,
        })
    }
}

/// Requires JSON bodies on writes to parse, bounded by `max_body_bytes`.
pub struct ValidateJson {
    pub max_body_bytes: usize,
}

impl ValidateJson {
    fn applies(ctx: &RequestContext) -> bool {
        let route_wants_it = ctx.route.as_ref().map_or(false, |r| r.validate_json && !r.upgrade);
        let is_write = matches!(*ctx.method(), Method::POST | Method::PUT | Method::PATCH);
        let is_json = ctx
            .parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.to_ascii_lowercase().contains("json"));
        route_wants_it && is_write && is_json
    }

    async fn read_bounded(&self, body: &mut Body) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| GatewayError::validation(format!("Failed to read request body: {}", e)))?;
            if buf.len() + chunk.len() > self.max_body_bytes {
                return Err(self.too_large());
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    fn too_large(&self) -> GatewayError {
        GatewayError::validation(format!(
            "Request body exceeds {} bytes",
            self.max_body_bytes
        ))
    }
}

#[async_trait]
impl Stage for ValidateJson {
    fn name(&self) -> &'static str {
        "validate_json"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<Flow> {
        if !Self::applies(ctx) {
            return Ok(Flow::Continue);
        }

        let declared = ctx
            .parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.map_or(false, |len| len > self.max_body_bytes) {
            return Err(self.too_large());
        }

        let bytes = self.read_bounded(&mut ctx.body).await?;
        if !bytes.iter().all(u8::is_ascii_whitespace) {
            serde_json::from_slice::<serde::de::IgnoredAny>(&bytes)
                .map_err(|e| GatewayError::validation(format!("Malformed JSON body: {}", e)))?;
        }
        ctx.body = Body::from(bytes);
        Ok(Flow::Continue)
    }
}

/// Answers GETs from the cache on a definitive hit.
pub struct CacheLookup {
    pub cache: Arc<ResponseCache>,
}

#[async_trait]
impl Stage for CacheLookup {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<Flow> {
        let route = match &ctx.route {
            Some(route) => route.clone(),
            None => return Ok(Flow::Continue),
        };
        ctx.cache_plan = self.cache.plan(
            ctx.method(),
            &route,
            ctx.path(),
            ctx.query(),
            ctx.identity.as_ref(),
        );
        let hit = match &ctx.cache_plan {
            Some(plan) => self.cache.lookup(plan).await,
            None => None,
        };
        Ok(match hit {
            Some(entry) => Flow::Respond(entry.into_response()),
            None => Flow::Continue,
        })
    }
}
