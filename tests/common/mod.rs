//! Shared harness: loopback upstreams and a gateway context wired to them.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sentry_gate::collab::{AbuseReporter, CidrCdnMembership, LogTxSink, MemoryTxLog};
use sentry_gate::config::{GatewayConfig, WindowConfig};
use sentry_gate::identity::ClientIdentity;
use sentry_gate::proxy::{build_http_client, Collaborators, GatewayContext};
use sentry_gate::ratelimit::RateLimiterSet;

pub const RPC_HOST: &str = "rpc.test";

pub const RAW_TX: &str = "0x02f8a9388223d88080829f3a9455d398326f99059ff775485246999027b319795580b844a9059cbb000000000000000000000000c37ac5194e1fb34a0935ed42ecb861991755913e0000000000000000000000000000000000000000000000000000000000000000c080a056d20e26818edbe771e1278ecfb1563f758e4ac439ffd7b62149bd2a31435004a04a6df5516d0e20e9471ea4a08bf8c32471ab85ba09134bc1002acb22d1b9036b";

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<String>>,
}

impl AbuseReporter for RecordingReporter {
    fn report_abuse_ip(&self, ip: &ClientIdentity) {
        self.reports.lock().push(ip.to_string());
    }
}

/// Poll `condition` until it holds, for background work the response does not wait on.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub struct Harness {
    pub ctx: Arc<GatewayContext>,
    pub tx_log: Arc<MemoryTxLog>,
    pub abuse: Arc<RecordingReporter>,
}

async fn answer(State(role): State<&'static str>, body: Bytes) -> impl IntoResponse {
    (
        [("access-control-allow-origin", "*")],
        Json(json!({ "role": role, "received": String::from_utf8_lossy(&body) })),
    )
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// HTTP upstream that answers every request with its role and the body it got.
pub async fn http_upstream(role: &'static str) -> String {
    let addr = serve(Router::new().fallback(answer).with_state(role)).await;
    format!("http://{}", addr)
}

/// Address nothing listens on.
pub async fn dead_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

async fn echo(upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(echo_socket)
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            // simulated upstream crash: drop the socket without a close frame
            Message::Text(text) if text == "close-me" => return,
            Message::Text(text) => {
                if socket.send(Message::Text(format!("echo:{}", text))).await.is_err() {
                    return;
                }
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

/// WebSocket upstream echoing text frames on `/ws/`.
pub async fn ws_upstream() -> String {
    let addr = serve(Router::new().route("/ws/", get(echo))).await;
    format!("http://{}", addr)
}

pub fn config(sentry: &str, origin: &str, default_target: &str) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.rpc.hosts = vec![RPC_HOST.to_string()];
    config.upstreams.sentry = sentry.to_string();
    config.upstreams.origins = vec![origin.to_string()];
    config.upstreams.default_target = default_target.to_string();
    config.upstreams.request_timeout_secs = 5;
    config.cdn.cloudflare_ranges = false;
    config.rate_limits.windows = vec![WindowConfig::new("1m", 100)];
    config.rate_limits.aggregate = None;
    config
}

pub fn harness(config: GatewayConfig) -> Harness {
    let limiters = RateLimiterSet::from_windows(&config.rate_limits.windows).unwrap();
    let http = build_http_client(&config.upstreams).unwrap();
    let (tx_log, _writer) = MemoryTxLog::spawn(Arc::new(LogTxSink), 64, CancellationToken::new());
    let abuse = Arc::new(RecordingReporter::default());
    let ctx = GatewayContext::new(
        config,
        limiters,
        http,
        Collaborators {
            cdn: Arc::new(CidrCdnMembership::default()),
            tx_log: tx_log.clone(),
            abuse: abuse.clone(),
        },
    )
    .unwrap();
    Harness {
        ctx: Arc::new(ctx),
        tx_log,
        abuse,
    }
}
