//! The proxy engine: HTTP dispatch, reverse proxying and the WebSocket pump.

mod context;
mod forward;
mod router;
mod server;
mod upstream;
mod websocket;

pub use context::{build_http_client, host_label, Collaborators, GatewayContext, PendingTransactions};
pub use forward::{forward, post_to_sentry, strip_cors, strip_reserved};
pub use router::{route, router, Route, X_POWERED_BY};
pub use server::GatewayServer;
pub use upstream::{UpstreamLease, UpstreamPool, UpstreamTarget};
pub use websocket::{
    accept, dial, split_client, split_upstream, ws_url, CloseReason, Frame, FrameInspector,
    FrameSink, FrameStream, GatewayInspector, PassThrough, PumpEnd, PumpError, PumpReport,
    Verdict, WebSocketPump, INTERNAL_ERROR, POLICY_VIOLATION,
};
