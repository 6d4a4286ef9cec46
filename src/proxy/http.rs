//! HTTP forwarding to the service a route points at.
//!
//! Bodies stream in both directions. Only responses with an error status are
//! buffered (up to a small bound) so the error mapper can inspect them.

use super::upgrade::{is_upgrade_request, splice};
use super::{prepare_upstream_headers, strip_hop_by_hop};
use crate::error::{map_upstream_failure, GatewayError, Result};
use crate::pipeline::RequestContext;
use crate::routes::RouteEntry;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response, StatusCode};
use metrics::{counter, histogram};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

const ERROR_BODY_LIMIT: usize = 64 * 1024;

pub struct Dispatcher {
    client: Client<HttpConnector, Body>,
    request_timeout: Duration,
    upgrade_grace: Duration,
}

impl Dispatcher {
    pub fn new(request_timeout: Duration, upgrade_grace: Duration) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build_http();

        Self {
            client,
            request_timeout,
            upgrade_grace,
        }
    }

    /// Forward the request to its route's service.
    pub async fn dispatch(&self, ctx: RequestContext) -> Result<Response<Body>> {
        let route = ctx
            .route
            .clone()
            .ok_or_else(|| GatewayError::internal("dispatch called without a route"))?;
        let service = route.service.name.as_str();

        let upgrading = route.upgrade && is_upgrade_request(&ctx.parts.headers);
        let RequestContext {
            mut parts,
            body,
            remote_addr,
            request_id,
            identity,
            ..
        } = ctx;

        let uri = route
            .upstream_uri(parts.uri.path(), parts.uri.query())
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        prepare_upstream_headers(
            &mut parts.headers,
            &uri,
            remote_addr.ip(),
            &request_id,
            identity.as_ref().map(|i| i.user_id.as_str()),
            upgrading,
        );

        let client_upgrade = if upgrading {
            parts.extensions.remove::<hyper::upgrade::OnUpgrade>()
        } else {
            None
        };

        let mut upstream = Request::from_parts(parts, body);
        *upstream.uri_mut() = uri;
        tracing::debug!(request_id = %request_id, service, uri = %upstream.uri(), upgrading, "Forwarding request");

        let started = Instant::now();
        let deadline = started + self.request_timeout;
        let response = match timeout_at(deadline, self.client.request(upstream)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                counter!("gateway.upstream.failures", 1, "service" => service.to_string());
                return Err(GatewayError::service_unavailable(service, e.to_string()));
            }
            Err(_) => {
                counter!("gateway.upstream.timeouts", 1, "service" => service.to_string());
                return Err(GatewayError::service_unavailable(
                    service,
                    format!("no response within {}ms", self.request_timeout.as_millis()),
                ));
            }
        };
        histogram!(
            "gateway.upstream.latency_ms",
            started.elapsed().as_millis() as f64,
            "service" => service.to_string()
        );

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return match client_upgrade {
                Some(on_client) => Ok(self.bridge(&route, on_client, response, request_id)),
                None => Err(GatewayError::internal(format!(
                    "{} switched protocols on a plain request",
                    service
                ))),
            };
        }

        let (mut head, body) = response.into_parts();
        strip_hop_by_hop(&mut head.headers, false);

        if head.status.is_client_error() || head.status.is_server_error() {
            let (bytes, complete) = read_bounded(body, ERROR_BODY_LIMIT, deadline).await;
            if !complete {
                counter!("gateway.upstream.timeouts", 1, "service" => service.to_string());
                tracing::warn!(
                    request_id = %request_id,
                    service,
                    status = head.status.as_u16(),
                    received = bytes.len(),
                    "Upstream error body stalled, mapping what arrived"
                );
            }
            return Err(map_upstream_failure(service, head.status, &bytes));
        }

        Ok(Response::from_parts(head, body))
    }

    /// Answer the client's handshake with the upstream's 101 and splice the
    /// two upgraded connections in the background.
    fn bridge(
        &self,
        route: &RouteEntry,
        on_client: hyper::upgrade::OnUpgrade,
        mut upstream_response: Response<Body>,
        request_id: String,
    ) -> Response<Body> {
        let on_upstream = hyper::upgrade::on(&mut upstream_response);
        let grace = self.upgrade_grace;
        let service = route.service.name.clone();

        tokio::spawn(async move {
            let (client_io, upstream_io) = match tokio::try_join!(on_client, on_upstream) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(request_id = %request_id, service = %service, error = %e, "Upgrade handshake failed");
                    return;
                }
            };
            counter!("gateway.upgrade.opened", 1, "service" => service.clone());
            let stats = splice(client_io, upstream_io, grace).await;
            tracing::info!(
                request_id = %request_id,
                service = %service,
                sent = stats.client_to_upstream,
                received = stats.upstream_to_client,
                forced = stats.forced_close,
                "Upgraded connection closed"
            );
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = upstream_response.headers().clone();
        response
    }
}

/// Read at most `limit` bytes of a body before `deadline`; the rest is
/// discarded. The flag is false when the deadline cut the read short.
async fn read_bounded(mut body: Body, limit: usize, deadline: Instant) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    loop {
        let chunk = match timeout_at(deadline, body.data()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(_) => return (buf, true),
            Err(_) => return (buf, false),
        };
        let room = limit - buf.len();
        if chunk.len() >= room {
            buf.extend_from_slice(&chunk[..room]);
            return (buf, true);
        }
        buf.extend_from_slice(&chunk);
    }
}
