//! Reverse proxying to a single upstream target.

use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use futures::{Stream, StreamExt};
use std::io;
use std::net::IpAddr;
use tracing::{debug, warn};

use super::context::GatewayContext;
use crate::error::{GatewayError, Rejection, Result};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Forward the request described by `parts` and `body` to `target`, keeping
/// the inbound path and query. Transport failures surface as
/// [`Rejection::UpstreamUnavailable`] and are never retried here.
pub async fn forward(
    ctx: &GatewayContext,
    target: &str,
    peer_ip: IpAddr,
    parts: &Parts,
    body: Bytes,
) -> std::result::Result<Response, Rejection> {
    let mut url = reqwest::Url::parse(target).map_err(|e| {
        warn!(upstream = %target, error = %e, "Invalid upstream URL");
        Rejection::UpstreamUnavailable
    })?;
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(CONTENT_LENGTH);
    strip_reserved(&mut headers, &ctx.config.rpc.reserved_header_prefixes);
    if let Ok(proto) = HeaderValue::from_str(url.scheme()) {
        headers.insert(X_FORWARDED_PROTO, proto);
    }
    append_forwarded_for(&mut headers, peer_ip);

    debug!(upstream = %target, method = %parts.method, path = %parts.uri.path(), "Forwarding request");

    let response = ctx
        .http
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(upstream = %target, error = %e, "Upstream request failed");
            Rejection::UpstreamUnavailable
        })?;

    let limit = ctx.config.rpc.max_response_body_bytes;
    let declared = response.content_length();
    if declared.is_some_and(|len| len > limit as u64) {
        warn!(upstream = %target, declared, limit, "Upstream response exceeds the size cap");
        return Err(Rejection::UpstreamUnavailable);
    }

    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);
    strip_cors(&mut headers);
    if declared.unwrap_or(0) == 0 {
        headers.remove(CONTENT_LENGTH);
    }

    let mut out = Response::new(Body::from_stream(bounded(response.bytes_stream(), limit)));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    Ok(out)
}

/// POST a JSON-RPC payload to the sentry and return its answer. Used for
/// submissions arriving over WebSocket.
pub async fn post_to_sentry(ctx: &GatewayContext, host: &str, payload: &str) -> Result<String> {
    let mut request = ctx
        .http
        .post(&ctx.config.upstreams.sentry)
        .header(CONTENT_TYPE, "application/json")
        .body(payload.to_string());
    if let Ok(host) = HeaderValue::from_str(host) {
        request = request.header(HOST, host);
    }

    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(GatewayError::Server(format!("sentry answered {}", status)));
    }
    Ok(text)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Drop headers the gateway reserves for itself.
pub fn strip_reserved(headers: &mut HeaderMap, prefixes: &[String]) {
    let reserved: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            prefixes
                .iter()
                .any(|p| name.as_str().starts_with(&p.to_ascii_lowercase()))
        })
        .cloned()
        .collect();
    for name in reserved {
        headers.remove(name);
    }
}

/// The gateway owns CORS; upstream CORS headers never reach the client.
pub fn strip_cors(headers: &mut HeaderMap) {
    let cors: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("access-control-"))
        .cloned()
        .collect();
    for name in cors {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer_ip: IpAddr) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, peer_ip),
        _ => peer_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Fail the body stream once more than `limit` bytes have passed.
fn bounded<S>(stream: S, limit: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let mut seen = 0usize;
    stream.map(move |chunk| {
        let chunk = chunk.map_err(io::Error::other)?;
        seen = seen.saturating_add(chunk.len());
        if seen > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream response exceeds the size cap",
            ));
        }
        Ok(chunk)
    })
}
