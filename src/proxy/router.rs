//! Request dispatch.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State, WebSocketUpgrade};
use axum::http::header::{CONTENT_LENGTH, HOST, UPGRADE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::FutureExt;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use super::context::{host_label, GatewayContext};
use super::forward::forward;
use super::websocket;
use crate::error::Rejection;
use crate::identity::{resolve_client_identity, ClientIdentity};
use crate::ratelimit::SetDecision;
use crate::rpc::ClassifyError;

pub const X_POWERED_BY: &str = "x-powered-by";

/// Where a plain HTTP request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// JSON-RPC handling: classify, then sentry, local answer or origin.
    Rpc,
    /// Anything that is not a POST to an RPC host goes to the static default target.
    Default,
}

pub fn route(is_rpc_host: bool, method: &Method) -> Route {
    if is_rpc_host && method == Method::POST {
        Route::Rpc
    } else {
        Route::Default
    }
}

/// The gateway's axum application. Every path is handled by one fallback.
pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(middleware::from_fn(recover_panics))
        .with_state(ctx)
}

async fn handle(
    State(ctx): State<Arc<GatewayContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    let host = request_host(&request);
    let id = match resolve_client_identity(peer, request.headers(), ctx.cdn.as_ref(), &ctx.config.cdn)
    {
        Ok(id) => id,
        Err(rejection) => return rejection.into_response(),
    };

    if is_websocket_request(request.headers()) {
        return match upgrade {
            Some(upgrade) if request.uri().path() == ctx.config.server.ws_path => {
                let path_and_query = request
                    .uri()
                    .path_and_query()
                    .map(|p| p.as_str())
                    .unwrap_or("/");
                websocket::accept(
                    ctx.clone(),
                    upgrade,
                    id,
                    host,
                    path_and_query,
                    request.headers(),
                )
                .await
            }
            _ => Rejection::WebSocketNotAllowed.into_response(),
        };
    }

    let mut decision = ctx.limiters.check(&id, 1);
    if !decision.allowed() {
        let window = decision.denied_window().unwrap_or_default().to_string();
        debug!(client = %id, window = %window, "Request rate limited");
        return finish(&ctx, &decision, Err(Rejection::RateLimited { window }));
    }

    if request.method() == Method::OPTIONS {
        return finish(&ctx, &decision, Ok(StatusCode::OK.into_response()));
    }

    let (parts, body) = request.into_parts();
    let body = match read_body(&parts.headers, body, ctx.config.rpc.max_request_body_bytes).await {
        Ok(body) => body,
        Err(rejection) => return finish(&ctx, &decision, Err(rejection)),
    };

    let peer_ip = peer.ip().to_canonical();
    let result = match route(ctx.config.rpc.is_rpc_host(&host), &parts.method) {
        Route::Rpc => handle_rpc(&ctx, &id, &host, peer_ip, &parts, body, &mut decision).await,
        Route::Default => match admit_one(&ctx, &id, &mut decision) {
            Ok(()) => forward(&ctx, &ctx.config.upstreams.default_target, peer_ip, &parts, body).await,
            Err(rejection) => Err(rejection),
        },
    };
    finish(&ctx, &decision, result)
}

#[instrument(skip_all, fields(client = %id, host = %host))]
async fn handle_rpc(
    ctx: &GatewayContext,
    id: &ClientIdentity,
    host: &str,
    peer_ip: IpAddr,
    parts: &Parts,
    body: Bytes,
    decision: &mut SetDecision,
) -> Result<Response, Rejection> {
    let label = host_label(host);
    let classification = match ctx.classifier.decode(true, label, &body) {
        Ok(classification) => classification,
        Err(ClassifyError::TooExpensive { cost, ceiling }) => {
            warn!(cost, ceiling, "Batch exceeds the cost ceiling");
            ctx.abuse.report_abuse_ip(id);
            return Err(Rejection::BatchTooExpensive { cost, ceiling });
        }
        Err(e) => {
            debug!(error = %e, "Rejecting undecodable payload");
            return Err(e.into());
        }
    };

    *decision = ctx.limiters.commit(id, classification.charged_cost);
    if !decision.allowed() {
        let window = decision.denied_window().unwrap_or_default().to_string();
        debug!(window = %window, cost = classification.charged_cost, "Request rate limited");
        return Err(Rejection::RateLimited { window });
    }
    if let Some(aggregate) = &ctx.aggregate {
        if !aggregate.acquire(classification.charged_cost) {
            return Err(Rejection::GatewayBusy);
        }
    }

    if classification.must_route_to_sentry {
        let pending = ctx.record_transactions(classification.raw_transactions, label);
        let result = forward(ctx, &ctx.config.upstreams.sentry, peer_ip, parts, body).await;
        if result.is_err() {
            ctx.forget_transactions(pending).await;
        }
        return result;
    }

    if let Some(reply) = &classification.local_reply {
        match ctx.resolve_local(label, reply).await {
            Ok(value) => return Ok(Json(value).into_response()),
            Err(e) => warn!(error = %e, "Local answer failed, forwarding to origin"),
        }
    }

    forward_to_origin(ctx, peer_ip, parts, body).await
}

fn admit_one(
    ctx: &GatewayContext,
    id: &ClientIdentity,
    decision: &mut SetDecision,
) -> Result<(), Rejection> {
    *decision = ctx.limiters.commit(id, 1);
    match decision.denied_window() {
        Some(window) => Err(Rejection::RateLimited {
            window: window.to_string(),
        }),
        None => Ok(()),
    }
}

async fn forward_to_origin(
    ctx: &GatewayContext,
    peer_ip: IpAddr,
    parts: &Parts,
    body: Bytes,
) -> Result<Response, Rejection> {
    let lease = ctx.origins.pick();
    let result = forward(ctx, lease.url(), peer_ip, parts, body).await;
    match &result {
        Ok(_) => ctx.origins.record_success(&lease),
        Err(_) => ctx.origins.record_failure(&lease),
    }
    ctx.origins.release(lease);
    result
}

/// Buffer the request body under `limit`. A declared length over the cap is
/// refused before reading; an understated one is caught by the bounded read.
async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes, Rejection> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(Rejection::BodyTooLarge);
    }
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        debug!(error = %e, "Request body read failed");
        Rejection::BodyTooLarge
    })
}

fn finish(
    ctx: &GatewayContext,
    decision: &SetDecision,
    result: Result<Response, Rejection>,
) -> Response {
    let mut response = match result {
        Ok(response) => response,
        Err(rejection) => rejection.into_response(),
    };
    let headers = response.headers_mut();
    headers.extend(decision.headers());
    if let Ok(value) = HeaderValue::from_str(&ctx.config.rpc.powered_by) {
        headers.insert(X_POWERED_BY, value);
    }
    response
}

fn request_host(request: &Request) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default()
        .to_string()
}

fn is_websocket_request(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn recover_panics(request: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(panic = %message, "Request handler panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
