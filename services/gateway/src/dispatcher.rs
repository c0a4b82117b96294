//! Maps decoded frames to opcode handlers (C4). Dispatch is a plain
//! `match` over the command byte, built once — not a reflection-driven
//! framework.

use std::sync::Arc;
use std::time::Duration;

use dny_protocol::DnyFrame;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::context::GatewayContext;
use crate::handlers::{self, *};
use crate::heartbeat_filter::HeartbeatEventKind;
use crate::session::ConnectionSession;

/// Dispatches one decoded DNY frame for a connection. Common pre/post steps
/// (session touch, metrics) wrap the opcode-specific handler.
pub async fn dispatch_dny_frame(
    ctx: &GatewayContext,
    conn_id: u64,
    session: &Arc<RwLock<ConnectionSession>>,
    frame: DnyFrame,
) {
    let start = std::time::Instant::now();

    let device_id = {
        let mut s = session.write().await;
        s.touch(Duration::from_secs(ctx.config.default_read_deadline_s));
        s.device_id.clone()
    };
    if let Some(device_id) = device_id {
        ctx.registry.mark_online(&device_id).await;
    }

    if !frame.checksum_valid {
        warn!(conn_id, command = frame.command, "checksum invalid, processing for diagnostics only");
    }

    let result = match frame.command {
        OP_REGISTER => handlers::handle_register(ctx, conn_id, session, &frame).await,
        OP_HEARTBEAT_NEW => handlers::handle_heartbeat_new(ctx, session, &frame).await,
        OP_HEARTBEAT_LEGACY => handlers::handle_legacy_heartbeat(&frame, 20).await,
        OP_MAIN_HEARTBEAT => handlers::handle_legacy_heartbeat(&frame, 8).await,
        OP_POWER_HEARTBEAT => {
            handlers::handle_power_heartbeat(ctx, session, &frame, HeartbeatEventKind::PowerHeartbeat).await
        }
        OP_PORT_POWER_HEARTBEAT => {
            handlers::handle_power_heartbeat(ctx, session, &frame, HeartbeatEventKind::PortPowerHeartbeat).await
        }
        OP_CHARGE_CONTROL => handlers::handle_charge_control_response(ctx, &frame).await,
        OP_GET_SERVER_TIME => {
            handlers::handle_get_server_time(ctx, conn_id, &ctx.last_time_sync_at, &frame).await
        }
        OP_SETTLEMENT => handlers::handle_settlement(ctx, conn_id, &frame).await,
        other => {
            debug!(conn_id, command = other, "unrecognized opcode, touch-and-log only");
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(conn_id, command = frame.command, error = %e, "opcode handler error");
    }

    debug!(
        conn_id,
        command = frame.command,
        elapsed_us = start.elapsed().as_micros(),
        "dispatch complete"
    );
}
