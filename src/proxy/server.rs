//! HTTP server for the gateway.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::context::GatewayContext;
use super::router::router;
use crate::error::{GatewayError, Result};

/// Serves the gateway router on one address.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    ctx: Arc<GatewayContext>,
}

impl GatewayServer {
    pub fn new(addr: SocketAddr, ctx: Arc<GatewayContext>) -> Self {
        Self { addr, ctx }
    }

    /// Bind and serve until `signal` resolves, then drain in-flight requests
    /// for at most `deadline`.
    pub async fn serve_with_shutdown<F>(self, signal: F, deadline: Duration) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal, deadline).await
    }

    /// Like [`Self::serve_with_shutdown`] on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F, deadline: Duration) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Starting gateway HTTP server");

        let shutdown = CancellationToken::new();
        let app = router(self.ctx).into_make_service_with_connect_info::<SocketAddr>();
        let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let mut server = tokio::spawn(async move { serve.await });

        tokio::select! {
            joined = &mut server => return flatten(joined),
            _ = signal => {}
        }

        info!(deadline_secs = deadline.as_secs_f64(), "Draining in-flight requests");
        shutdown.cancel();
        match tokio::time::timeout(deadline, &mut server).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!("Drain deadline elapsed, dropping remaining connections");
                server.abort();
                Ok(())
            }
        }
    }
}

fn flatten(
    joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "HTTP server failed");
            Err(GatewayError::Io(e))
        }
        Err(e) => Err(GatewayError::Server(e.to_string())),
    }
}
