//! WebSocket relay.
//!
//! A connection is served by two tasks, client to upstream and upstream to
//! client, sharing one [`CancellationToken`]. Whichever task stops first
//! cancels the other, both close their outbound sockets, and
//! [`WebSocketPump::run`] returns only once both have finished.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket};
use axum::extract::WebSocketUpgrade;
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::stream::BoxStream;
use futures::{future, Sink, SinkExt, StreamExt};
use std::borrow::Cow;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HOST, ORIGIN as UPSTREAM_ORIGIN};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument, Span};
use uuid::Uuid;

use super::context::{host_label, GatewayContext};
use super::forward::post_to_sentry;
use crate::error::{Rejection, Result};
use crate::identity::ClientIdentity;
use crate::rpc::ClassifyError;

pub const POLICY_VIOLATION: u16 = 1008;
pub const INTERNAL_ERROR: u16 = 1011;

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn too_many_requests() -> Self {
        Self::new(POLICY_VIOLATION, "Too many requests")
    }
}

impl From<ClientMessage> for Frame {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Text(text) => Frame::Text(text),
            ClientMessage::Binary(data) => Frame::Binary(data),
            ClientMessage::Ping(data) => Frame::Ping(data),
            ClientMessage::Pong(data) => Frame::Pong(data),
            ClientMessage::Close(close) => Frame::Close(close.map(|c| CloseReason {
                code: c.code,
                reason: c.reason.into_owned(),
            })),
        }
    }
}

impl From<Frame> for ClientMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => ClientMessage::Text(text),
            Frame::Binary(data) => ClientMessage::Binary(data),
            Frame::Ping(data) => ClientMessage::Ping(data),
            Frame::Pong(data) => ClientMessage::Pong(data),
            Frame::Close(close) => ClientMessage::Close(close.map(|c| ClientCloseFrame {
                code: c.code,
                reason: Cow::Owned(c.reason),
            })),
        }
    }
}

impl Frame {
    /// Raw frames only appear when writing; they are never read back.
    fn from_upstream(msg: UpstreamMessage) -> Option<Self> {
        Some(match msg {
            UpstreamMessage::Text(text) => Frame::Text(text),
            UpstreamMessage::Binary(data) => Frame::Binary(data),
            UpstreamMessage::Ping(data) => Frame::Ping(data),
            UpstreamMessage::Pong(data) => Frame::Pong(data),
            UpstreamMessage::Close(close) => Frame::Close(close.map(|c| CloseReason {
                code: c.code.into(),
                reason: c.reason.into_owned(),
            })),
            UpstreamMessage::Frame(_) => return None,
        })
    }
}

impl From<Frame> for UpstreamMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => UpstreamMessage::Text(text),
            Frame::Binary(data) => UpstreamMessage::Binary(data),
            Frame::Ping(data) => UpstreamMessage::Ping(data),
            Frame::Pong(data) => UpstreamMessage::Pong(data),
            Frame::Close(close) => UpstreamMessage::Close(close.map(|c| UpstreamCloseFrame {
                code: CloseCode::from(c.code),
                reason: Cow::Owned(c.reason),
            })),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PumpError {
    #[error("websocket transport error: {0}")]
    Transport(String),
}

pub type FrameStream = BoxStream<'static, std::result::Result<Frame, PumpError>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = PumpError> + Send>>;

/// What to do with one client text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Relay the frame unchanged.
    Forward,
    /// Answer the client directly; nothing reaches the upstream.
    Reply(String),
    /// Close the client socket and end the connection.
    Close(CloseReason),
}

/// Policy applied to client text frames. The upstream direction is never
/// inspected.
#[async_trait]
pub trait FrameInspector: Send + Sync {
    async fn inspect(&self, text: &str) -> Verdict;
}

/// Relays every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait]
impl FrameInspector for PassThrough {
    async fn inspect(&self, _text: &str) -> Verdict {
        Verdict::Forward
    }
}

/// Why one direction of the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The other direction stopped first.
    Cancelled,
    /// The reading side closed cleanly.
    Closed,
    /// The inspector closed the connection.
    PolicyClose,
    ReadError,
    WriteError,
    Panicked,
}

/// How each direction ended. Returned once both tasks have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub client_to_upstream: PumpEnd,
    pub upstream_to_client: PumpEnd,
}

pub struct WebSocketPump {
    inspector: Arc<dyn FrameInspector>,
}

impl WebSocketPump {
    pub fn new(inspector: Arc<dyn FrameInspector>) -> Self {
        Self { inspector }
    }

    pub async fn run(
        self,
        client_rx: FrameStream,
        client_tx: FrameSink,
        upstream_rx: FrameStream,
        upstream_tx: FrameSink,
    ) -> PumpReport {
        let cancel = CancellationToken::new();
        // replies to the client come from the inbound task too
        let client_tx = Arc::new(Mutex::new(client_tx));

        let inbound = tokio::spawn(client_to_upstream(
            self.inspector,
            client_rx,
            upstream_tx,
            client_tx.clone(),
            cancel.clone(),
        ));
        let outbound = tokio::spawn(upstream_to_client(upstream_rx, client_tx, cancel));

        let (inbound, outbound) = tokio::join!(inbound, outbound);
        PumpReport {
            client_to_upstream: inbound.unwrap_or(PumpEnd::Panicked),
            upstream_to_client: outbound.unwrap_or(PumpEnd::Panicked),
        }
    }
}

async fn client_to_upstream(
    inspector: Arc<dyn FrameInspector>,
    mut client_rx: FrameStream,
    mut upstream_tx: FrameSink,
    client_tx: Arc<Mutex<FrameSink>>,
    cancel: CancellationToken,
) -> PumpEnd {
    // cancels the other direction even if this task unwinds
    let _guard = cancel.clone().drop_guard();

    let end = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            frame = client_rx.next() => frame,
        };
        let frame = match frame {
            None => break PumpEnd::Closed,
            Some(Err(e)) => {
                debug!(error = %e, "Client read failed");
                break PumpEnd::ReadError;
            }
            Some(Ok(frame)) => frame,
        };

        match frame {
            Frame::Text(text) => match inspector.inspect(&text).await {
                Verdict::Forward => {
                    if upstream_tx.send(Frame::Text(text)).await.is_err() {
                        break PumpEnd::WriteError;
                    }
                }
                Verdict::Reply(answer) => {
                    if client_tx.lock().await.send(Frame::Text(answer)).await.is_err() {
                        break PumpEnd::WriteError;
                    }
                }
                Verdict::Close(reason) => {
                    debug!(code = reason.code, reason = %reason.reason, "Closing client connection");
                    let _ = client_tx.lock().await.send(Frame::Close(Some(reason))).await;
                    break PumpEnd::PolicyClose;
                }
            },
            Frame::Close(reason) => {
                let _ = upstream_tx.send(Frame::Close(reason)).await;
                break PumpEnd::Closed;
            }
            other => {
                if upstream_tx.send(other).await.is_err() {
                    break PumpEnd::WriteError;
                }
            }
        }
    };

    cancel.cancel();
    let _ = upstream_tx.close().await;
    end
}

async fn upstream_to_client(
    mut upstream_rx: FrameStream,
    client_tx: Arc<Mutex<FrameSink>>,
    cancel: CancellationToken,
) -> PumpEnd {
    let _guard = cancel.clone().drop_guard();

    let end = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            frame = upstream_rx.next() => frame,
        };
        match frame {
            None => break PumpEnd::Closed,
            Some(Err(e)) => {
                debug!(error = %e, "Upstream read failed");
                break PumpEnd::ReadError;
            }
            Some(Ok(Frame::Close(reason))) => {
                let _ = client_tx.lock().await.send(Frame::Close(reason)).await;
                break PumpEnd::Closed;
            }
            Some(Ok(frame)) => {
                if client_tx.lock().await.send(frame).await.is_err() {
                    break PumpEnd::WriteError;
                }
            }
        }
    };

    cancel.cancel();
    let _ = client_tx.lock().await.close().await;
    end
}

/// Split an accepted client socket into frame halves.
pub fn split_client(socket: WebSocket) -> (FrameStream, FrameSink) {
    let (sink, stream) = socket.split();
    let stream = stream
        .map(|msg| {
            msg.map(Frame::from)
                .map_err(|e| PumpError::Transport(e.to_string()))
        })
        .boxed();
    let sink = sink
        .sink_map_err(|e| PumpError::Transport(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, PumpError>(ClientMessage::from(frame))));
    (stream, Box::pin(sink))
}

/// Split a dialed upstream socket into frame halves.
pub fn split_upstream<S>(socket: WebSocketStream<S>) -> (FrameStream, FrameSink)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    let stream = stream
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => Frame::from_upstream(msg).map(Ok),
                Err(e) => Some(Err(PumpError::Transport(e.to_string()))),
            })
        })
        .boxed();
    let sink = sink
        .sink_map_err(|e| PumpError::Transport(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, PumpError>(UpstreamMessage::from(frame))));
    (stream, Box::pin(sink))
}

/// Map an http(s) target to its ws(s) equivalent and append the inbound
/// path and query.
pub fn ws_url(target: &str, path_and_query: &str) -> String {
    let base = if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        target.to_string()
    };
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

/// Open the upstream socket, carrying the client's Host and Origin.
pub async fn dial(
    url: &str,
    host: &str,
    origin: Option<&str>,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut request = url.into_client_request()?;
    if let Ok(host) = HeaderValue::from_str(host) {
        request.headers_mut().insert(HOST, host);
    }
    if let Some(origin) = origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        request.headers_mut().insert(UPSTREAM_ORIGIN, origin);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

/// Applies the gateway's limits and routing to client frames.
pub struct GatewayInspector {
    ctx: Arc<GatewayContext>,
    id: ClientIdentity,
    host: String,
    is_rpc: bool,
}

impl GatewayInspector {
    pub fn new(ctx: Arc<GatewayContext>, id: ClientIdentity, host: String, is_rpc: bool) -> Self {
        Self {
            ctx,
            id,
            host,
            is_rpc,
        }
    }

    fn admit(&self, cost: u64) -> bool {
        if !self.ctx.limiters.commit(&self.id, cost).allowed() {
            return false;
        }
        match &self.ctx.aggregate {
            Some(aggregate) => aggregate.acquire(cost),
            None => true,
        }
    }
}

#[async_trait]
impl FrameInspector for GatewayInspector {
    async fn inspect(&self, text: &str) -> Verdict {
        let ctx = &self.ctx;
        if !ctx.limiters.check(&self.id, 1).allowed() {
            debug!(client = %self.id, "WebSocket frame rate limited");
            return Verdict::Close(CloseReason::too_many_requests());
        }
        if !self.is_rpc {
            return if self.admit(1) {
                Verdict::Forward
            } else {
                Verdict::Close(CloseReason::too_many_requests())
            };
        }

        let label = host_label(&self.host);
        let classification = match ctx.classifier.decode(true, label, text.as_bytes()) {
            Ok(classification) => classification,
            Err(ClassifyError::TooExpensive { cost, ceiling }) => {
                warn!(client = %self.id, cost, ceiling, "WebSocket batch exceeds the cost ceiling");
                ctx.abuse.report_abuse_ip(&self.id);
                return Verdict::Close(CloseReason::too_many_requests());
            }
            Err(e) => {
                // opaque frames are relayed at the cost of one call
                debug!(client = %self.id, error = %e, "Relaying unclassified frame");
                return if self.admit(1) {
                    Verdict::Forward
                } else {
                    Verdict::Close(CloseReason::too_many_requests())
                };
            }
        };

        if !self.admit(classification.charged_cost) {
            debug!(client = %self.id, cost = classification.charged_cost, "WebSocket request rate limited");
            return Verdict::Close(CloseReason::too_many_requests());
        }

        if classification.must_route_to_sentry {
            let pending = ctx.record_transactions(classification.raw_transactions, label);
            return match post_to_sentry(ctx, &self.host, text).await {
                Ok(answer) => Verdict::Reply(answer),
                Err(e) => {
                    warn!(client = %self.id, error = %e, "Sentry relay failed");
                    ctx.forget_transactions(pending).await;
                    Verdict::Close(CloseReason::new(INTERNAL_ERROR, "Upstream unavailable"))
                }
            };
        }

        if let Some(reply) = &classification.local_reply {
            match ctx.resolve_local(label, reply).await {
                Ok(value) => return Verdict::Reply(value.to_string()),
                Err(e) => warn!(error = %e, "Local answer failed, relaying to origin"),
            }
        }
        Verdict::Forward
    }
}

/// Upgrade a client connection and relay it to its upstream.
///
/// The upstream is dialed before the upgrade completes, so a dial failure
/// is answered with 502 instead of an accepted socket that closes at once.
#[instrument(skip_all, fields(client = %id, conn = %Uuid::new_v4()))]
pub async fn accept(
    ctx: Arc<GatewayContext>,
    upgrade: WebSocketUpgrade,
    id: ClientIdentity,
    host: String,
    path_and_query: &str,
    headers: &HeaderMap,
) -> Response {
    let decision = ctx.limiters.check(&id, 1);
    if !decision.allowed() {
        let window = decision.denied_window().unwrap_or_default().to_string();
        debug!(window = %window, "WebSocket upgrade rate limited");
        return (decision.headers(), Rejection::RateLimited { window }).into_response();
    }

    let is_rpc = ctx.config.rpc.is_rpc_host(&host);
    let (lease, target) = if is_rpc {
        let lease = ctx.origins.pick();
        let target = ws_url(lease.url(), path_and_query);
        (Some(lease), target)
    } else {
        match &ctx.config.upstreams.default_ws_target {
            Some(target) => (None, ws_url(target, path_and_query)),
            None => return Rejection::WebSocketNotAllowed.into_response(),
        }
    };

    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    let upstream = match dial(&target, &host, origin).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(upstream = %target, error = %e, "WebSocket dial failed");
            if let Some(lease) = &lease {
                ctx.origins.record_failure(lease);
            }
            return Rejection::UpstreamUnavailable.into_response();
        }
    };
    if let Some(lease) = &lease {
        ctx.origins.record_success(lease);
    }
    ctx.limiters.allow_pass_check(&id);

    info!(upstream = %target, "WebSocket connection opened");
    let inspector: Arc<dyn FrameInspector> =
        Arc::new(GatewayInspector::new(ctx.clone(), id, host, is_rpc));
    let span = Span::current();
    upgrade.on_upgrade(move |socket| {
        async move {
            let (client_rx, client_tx) = split_client(socket);
            let (upstream_rx, upstream_tx) = split_upstream(upstream);
            let report = WebSocketPump::new(inspector)
                .run(client_rx, client_tx, upstream_rx, upstream_tx)
                .await;
            info!(?report, "WebSocket connection closed");
            drop(lease);
        }
        .instrument(span)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Pipe {
        rx: FrameStream,
        tx: FrameSink,
    }

    /// One end feeds the pump, the other is driven by the test.
    fn pipe() -> (Pipe, mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>) {
        let (in_tx, in_rx) = mpsc::unbounded::<Frame>();
        let (out_tx, out_rx) = mpsc::unbounded::<Frame>();
        let pipe = Pipe {
            rx: in_rx.map(Ok).boxed(),
            tx: Box::pin(out_tx.sink_map_err(|e| PumpError::Transport(e.to_string()))),
        };
        (pipe, in_tx, out_rx)
    }

    struct Scripted;

    #[async_trait]
    impl FrameInspector for Scripted {
        async fn inspect(&self, text: &str) -> Verdict {
            match text {
                "local" => Verdict::Reply("answered".to_string()),
                "abuse" => Verdict::Close(CloseReason::too_many_requests()),
                _ => Verdict::Forward,
            }
        }
    }

    fn start(
        inspector: Arc<dyn FrameInspector>,
    ) -> (
        tokio::task::JoinHandle<PumpReport>,
        (mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>),
        (mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>),
    ) {
        let (client, client_in, client_out) = pipe();
        let (upstream, upstream_in, upstream_out) = pipe();
        let handle = tokio::spawn(WebSocketPump::new(inspector).run(
            client.rx,
            client.tx,
            upstream.rx,
            upstream.tx,
        ));
        (handle, (client_in, client_out), (upstream_in, upstream_out))
    }

    #[tokio::test]
    async fn test_relays_both_directions_and_upstream_disconnect_closes_client() {
        let (handle, (client_in, mut client_out), (upstream_in, mut upstream_out)) =
            start(Arc::new(PassThrough));

        client_in.unbounded_send(Frame::Text("ping".into())).unwrap();
        assert_eq!(upstream_out.next().await, Some(Frame::Text("ping".into())));

        upstream_in.unbounded_send(Frame::Binary(vec![1, 2])).unwrap();
        assert_eq!(client_out.next().await, Some(Frame::Binary(vec![1, 2])));

        // upstream goes away without a close frame
        drop(upstream_in);
        let closed = timeout(Duration::from_secs(1), client_out.next()).await.unwrap();
        assert_eq!(closed, None);

        let report = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(report.upstream_to_client, PumpEnd::Closed);
        assert_eq!(report.client_to_upstream, PumpEnd::Cancelled);
        assert_eq!(upstream_out.next().await, None);
        drop(client_in);
    }

    #[tokio::test]
    async fn test_reply_is_not_forwarded() {
        let (handle, (client_in, mut client_out), (_upstream_in, mut upstream_out)) =
            start(Arc::new(Scripted));

        client_in.unbounded_send(Frame::Text("local".into())).unwrap();
        assert_eq!(client_out.next().await, Some(Frame::Text("answered".into())));

        client_in.unbounded_send(Frame::Text("other".into())).unwrap();
        assert_eq!(upstream_out.next().await, Some(Frame::Text("other".into())));

        client_in
            .unbounded_send(Frame::Close(Some(CloseReason::new(1000, "bye"))))
            .unwrap();
        assert_eq!(
            upstream_out.next().await,
            Some(Frame::Close(Some(CloseReason::new(1000, "bye"))))
        );

        let report = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(report.client_to_upstream, PumpEnd::Closed);
        assert_eq!(report.upstream_to_client, PumpEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_policy_close_tears_down() {
        let (handle, (client_in, mut client_out), (_upstream_in, mut upstream_out)) =
            start(Arc::new(Scripted));

        client_in.unbounded_send(Frame::Text("abuse".into())).unwrap();
        assert_eq!(
            client_out.next().await,
            Some(Frame::Close(Some(CloseReason::new(POLICY_VIOLATION, "Too many requests"))))
        );
        assert_eq!(client_out.next().await, None);
        assert_eq!(upstream_out.next().await, None);

        let report = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(report.client_to_upstream, PumpEnd::PolicyClose);
        assert_eq!(report.upstream_to_client, PumpEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_run_waits_for_both_directions() {
        let (client, _client_in, _client_out) = pipe();
        let (upstream, upstream_in, _upstream_out) = pipe();
        let mut run = tokio_test::task::spawn(WebSocketPump::new(Arc::new(PassThrough)).run(
            client.rx,
            client.tx,
            upstream.rx,
            upstream.tx,
        ));
        tokio_test::assert_pending!(run.poll());
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio_test::assert_pending!(run.poll());

        drop(upstream_in);
        for _ in 0..100 {
            if let std::task::Poll::Ready(report) = run.poll() {
                assert_eq!(report.upstream_to_client, PumpEnd::Closed);
                assert_eq!(report.client_to_upstream, PumpEnd::Cancelled);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pump did not finish after the upstream closed");
    }

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("http://origin:8545", "/ws/"), "ws://origin:8545/ws/");
        assert_eq!(ws_url("https://origin/", "/ws/?a=1"), "wss://origin/ws/?a=1");
        assert_eq!(ws_url("ws://origin:8546", "/"), "ws://origin:8546/");
    }

    #[test]
    fn test_close_frame_conversions() {
        let frame = Frame::Close(Some(CloseReason::too_many_requests()));
        let upstream = UpstreamMessage::from(frame.clone());
        assert_eq!(Frame::from_upstream(upstream), Some(frame.clone()));

        let client = ClientMessage::from(frame.clone());
        assert_eq!(Frame::from(client), frame);
    }
}
