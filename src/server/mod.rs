//! Request layer: Bolt and HTTP listeners over one shared engine.

pub mod bolt;
pub mod http;
pub mod packstream;
pub mod rpc;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::auth::AuthService;
use crate::auth::audit::AuditLogger;
use crate::graph::Graph;
use crate::Result;

/// Shared state behind every connection and request handler.
pub struct ServerContext {
    pub graph: Graph,
    pub auth: Arc<AuthService>,
    pub audit: AuditLogger,
}

/// Both listeners plus their shutdown switch.
pub struct Server {
    ctx: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(graph: Graph, auth: Arc<AuthService>, audit: AuditLogger) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(ServerContext { graph, auth, audit }),
            shutdown,
        }
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Bind and serve Bolt + HTTP until [`Server::stop`] is called.
    /// Returns the actually-bound addresses (useful with port 0 in tests).
    pub async fn start(&self) -> Result<(std::net::SocketAddr, std::net::SocketAddr)> {
        let config = self.ctx.graph.config().server.clone();

        let bolt_listener =
            TcpListener::bind((config.bind_address.as_str(), config.bolt_port)).await?;
        let bolt_addr = bolt_listener.local_addr()?;
        tokio::spawn(bolt::serve(
            self.ctx.graph.clone(),
            self.ctx.auth.clone(),
            self.ctx.audit.clone(),
            bolt_listener,
            self.shutdown.subscribe(),
        ));

        let http_listener =
            TcpListener::bind((config.bind_address.as_str(), config.http_port)).await?;
        let http_addr = http_listener.local_addr()?;
        let router = http::router(self.ctx.clone());
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(http_listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = serve.await {
                tracing::warn!(error = %e, "http server stopped");
            }
        });

        info!(bolt = %bolt_addr, http = %http_addr, "listeners started");
        Ok((bolt_addr, http_addr))
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
