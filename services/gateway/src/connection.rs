//! Per-connection accept-to-close lifecycle: owns the socket, drives the
//! frame codec, and feeds decoded messages through the dispatcher. Runs as
//! its own task so one connection never blocks another (§5).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dny_protocol::{DecodedMessage, DnyCodec};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::GatewayContext;
use crate::dispatcher::dispatch_dny_frame;
use crate::notification::OfflineReason;
use crate::session::{ConnId, ConnectionSession};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

pub async fn handle_connection(ctx: Arc<GatewayContext>, socket: TcpStream, remote_addr: SocketAddr) {
    let conn_id = next_conn_id();
    let shutdown = CancellationToken::new();

    let session = Arc::new(RwLock::new(ConnectionSession::on_accept(
        conn_id,
        remote_addr,
        Duration::from_secs(ctx.config.default_read_deadline_s),
    )));
    ctx.sessions.insert(conn_id, session.clone(), shutdown.clone()).await;

    let mut writer_rx = ctx.writers.register(conn_id).await;
    let (read_half, mut write_half) = tokio::io::split(socket);
    let mut stream = FramedRead::new(read_half, DnyCodec::new());

    info!(conn_id, %remote_addr, "connection accepted");

    // §7: a codec error never closes the connection by itself — the stream
    // resyncs past the bad frame — unless three of them land within 10s,
    // which suggests the peer isn't speaking DNY at all.
    const CODEC_ERROR_BURST_WINDOW: Duration = Duration::from_secs(10);
    const CODEC_ERROR_BURST_LIMIT: u32 = 3;
    let mut codec_error_count = 0u32;
    let mut codec_error_window_start: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(conn_id, "connection cancelled (reaper or shutdown)");
                break;
            }
            outbound = writer_rx.recv() => {
                let Some(bytes) = outbound else { break };
                if let Err(e) = write_half.write_all(&bytes).await {
                    warn!(conn_id, error = %e, "write failed, closing connection");
                    break;
                }
            }
            decoded = stream.next() => {
                match decoded {
                    Some(Ok(message)) => {
                        handle_message(&ctx, conn_id, &session, message).await;
                    }
                    Some(Err(e)) => {
                        warn!(conn_id, error = %e, "codec error, resyncing");
                        let now = tokio::time::Instant::now();
                        let window_start = *codec_error_window_start.get_or_insert(now);
                        if now.saturating_duration_since(window_start) > CODEC_ERROR_BURST_WINDOW {
                            codec_error_count = 0;
                            codec_error_window_start = Some(now);
                        }
                        codec_error_count += 1;
                        if codec_error_count >= CODEC_ERROR_BURST_LIMIT {
                            warn!(conn_id, "three codec errors within 10s, closing connection");
                            break;
                        }
                    }
                    None => {
                        info!(conn_id, "peer closed connection");
                        break;
                    }
                }
            }
        }
    }

    cleanup_connection(&ctx, conn_id, &session, &shutdown).await;
}

async fn handle_message(
    ctx: &Arc<GatewayContext>,
    conn_id: u64,
    session: &Arc<RwLock<ConnectionSession>>,
    message: DecodedMessage,
) {
    match message {
        DecodedMessage::Dny(frame) => {
            dispatch_dny_frame(ctx, conn_id, session, frame).await;
        }
        DecodedMessage::Iccid(iccid) => {
            let mut s = session.write().await;
            s.set_iccid(iccid);
            s.touch(Duration::from_secs(ctx.config.default_read_deadline_s));
        }
        DecodedMessage::LinkHeartbeat => {
            session
                .write()
                .await
                .touch(Duration::from_secs(ctx.config.default_read_deadline_s));
        }
        DecodedMessage::Unknown(byte) => {
            warn!(conn_id, byte, "unrecognized byte on the wire, discarding");
        }
    }
}

async fn cleanup_connection(
    ctx: &Arc<GatewayContext>,
    conn_id: u64,
    session: &Arc<RwLock<ConnectionSession>>,
    shutdown: &CancellationToken,
) {
    let (device_id, was_timeout) = {
        let mut s = session.write().await;
        let was_cancelled_externally = shutdown.is_cancelled();
        s.on_close();
        (s.device_id.clone(), was_cancelled_externally)
    };

    ctx.registry.unbind(conn_id).await;
    ctx.command_manager.cancel_for_conn(conn_id).await;
    ctx.writers.unregister(conn_id).await;
    ctx.sessions.remove(conn_id).await;

    let reason = if was_timeout {
        OfflineReason::Timeout
    } else {
        OfflineReason::Close
    };

    // If this device was superseded by a reconnect before this connection
    // tore down, the registry already points it at the new connection —
    // this session's own `device_id` is stale and must not fire an offline
    // for a device that's actually still online elsewhere.
    let device_id = match device_id {
        Some(id) if ctx.registry.lookup_by_device_id(&id).await.is_none() => Some(id),
        _ => None,
    };
    crate::handlers::emit_offline_if_bound(ctx, device_id, reason).await;

    info!(conn_id, "connection cleaned up");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_monotonic_and_unique() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert!(b > a);
    }
}
