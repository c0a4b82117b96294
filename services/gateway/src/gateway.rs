//! Top-level server: binds the listener, spawns the accept loop and the
//! reaper/retry background tasks, and drains everything on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::command::spawn_retry_scheduler;
use crate::config::GatewayConfig;
use crate::connection::handle_connection;
use crate::context::GatewayContext;
use crate::notification::NotificationPort;
use crate::reaper::spawn_reaper;

pub struct Gateway {
    ctx: Arc<GatewayContext>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Binds the configured listen address. Fails the process at startup
    /// (not per-connection) if the bind fails.
    pub async fn bind(
        config: GatewayConfig,
        notifier: Arc<dyn NotificationPort>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.tcp_listen_addr).await?;
        info!(addr = %config.tcp_listen_addr, "gateway listening");
        Ok(Self {
            ctx: Arc::new(GatewayContext::new(config, notifier)),
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn context(&self) -> Arc<GatewayContext> {
        self.ctx.clone()
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the accept loop plus background tasks until `shutdown` (or the
    /// token returned by [`Gateway::shutdown_token`]) is cancelled, then
    /// drains: cancels all live connections, waits for them to finish,
    /// and lets the notification port flush whatever it's buffered.
    pub async fn serve(self) {
        let reaper_handle = spawn_reaper(
            self.ctx.sessions.clone(),
            Duration::from_secs(self.ctx.config.heartbeat_timeout_s),
            Duration::from_secs(self.ctx.config.reaper_interval_s),
            self.shutdown.clone(),
        );
        let retry_handle = spawn_retry_scheduler(
            self.ctx.command_manager.clone(),
            Duration::from_millis(500),
            self.shutdown.clone(),
        );

        let mut connection_tasks = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("gateway shutting down, draining connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, remote_addr)) => {
                            let ctx = self.ctx.clone();
                            connection_tasks.spawn(async move {
                                handle_connection(ctx, socket, remote_addr).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        // Each connection watches its own per-connection token (stored in
        // `SessionTable`, distinct from `self.shutdown`); cancel every one
        // of those explicitly so the drain actually closes live sockets.
        let conn_ids: Vec<_> = self.ctx.sessions.all_ids().await;
        for conn_id in conn_ids {
            self.ctx.sessions.cancel(conn_id).await;
        }
        while connection_tasks.join_next().await.is_some() {}

        reaper_handle.abort();
        retry_handle.abort();
        info!("gateway drained");
    }
}
