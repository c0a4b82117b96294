//! Selected opcode handlers (C9). Each handler decodes its payload, updates
//! session/registry state, optionally confirms a pending command via C6,
//! and optionally emits a notification via C8.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dny_protocol::{encode_frame, DnyFrame, OutboundDnyFrame};
use tokio::sync::RwLock;
use tracing::warn;

use crate::command::ChargeIntent;
use crate::context::GatewayContext;
use crate::error::{HandlerError, HandshakeError};
use crate::handshake::RegistrationDecision;
use crate::heartbeat_filter::HeartbeatEventKind;
use crate::notification::{NotificationEvent, OfflineReason, StopReason};
use crate::session::{classify_port_status, ConnectionSession, Phase, PortClass};

pub const OP_HEARTBEAT_LEGACY: u8 = 0x01;
pub const OP_SETTLEMENT: u8 = 0x03;
pub const OP_POWER_HEARTBEAT: u8 = 0x06;
pub const OP_MAIN_HEARTBEAT: u8 = 0x11;
pub const OP_REGISTER: u8 = 0x20;
pub const OP_HEARTBEAT_NEW: u8 = 0x21;
pub const OP_GET_SERVER_TIME: u8 = 0x22;
pub const OP_PORT_POWER_HEARTBEAT: u8 = 0x26;
pub const OP_CHARGE_CONTROL: u8 = 0x82;

/// Bit 0 of the first registration payload byte: declares this `0x20` as a
/// group/slave registration rather than a primary identity bind.
const GROUP_ID_BIT: u8 = 0b0000_0001;

async fn reply(ctx: &GatewayContext, conn_id: u64, physical_id: u32, message_id: u16, command: u8, payload: Vec<u8>) {
    let bytes = encode_frame(&OutboundDnyFrame::new(physical_id, message_id, command, payload));
    if let Err(e) = ctx.writers.write(conn_id, bytes).await {
        warn!(conn_id, error = %e, "failed to write opcode reply");
    }
}

pub async fn handle_register(
    ctx: &GatewayContext,
    conn_id: u64,
    session: &Arc<RwLock<ConnectionSession>>,
    frame: &DnyFrame,
) -> Result<(), HandlerError> {
    if frame.payload.is_empty() {
        return Err(HandlerError::PayloadTooShort { got: 0, need: 1 });
    }

    let iccid = {
        let s = session.read().await;
        s.iccid.clone().ok_or(HandshakeError::RegisterBeforeIccid)?
    };

    let device_id = frame.device_id();
    let declares_group = frame.payload[0] & GROUP_ID_BIT != 0;
    let already_bound_primary = {
        let s = session.read().await;
        s.phase == Phase::Active && s.device_id.is_some() && s.device_id.as_deref() != Some(device_id.as_str())
    };

    if already_bound_primary && declares_group {
        let master_id = session.read().await.device_id.clone().unwrap();
        ctx.registry
            .register_group_member(conn_id, &master_id, &device_id, frame.physical_id, &iccid)
            .await;
        session.write().await.add_group_member(device_id.clone());
        reply(ctx, conn_id, frame.physical_id, frame.message_id, OP_REGISTER, vec![0x00]).await;
        return Ok(());
    }
    if already_bound_primary {
        warn!(conn_id, device_id, "second 0x20 without group bit: identity reassignment rejected");
        reply(ctx, conn_id, frame.physical_id, frame.message_id, OP_REGISTER, vec![0x00]).await;
        return Ok(());
    }

    let decision = ctx
        .registration_ledger
        .decide(&device_id, conn_id, Instant::now())
        .await;

    match decision {
        RegistrationDecision::Accept => {
            session
                .write()
                .await
                .set_identity(device_id.clone(), frame.physical_id)?;
            ctx.registry
                .register(conn_id, &device_id, frame.physical_id, &iccid, &ctx.notifier)
                .await;
            if ctx.notifier.is_enabled() {
                let s = session.read().await;
                ctx.notifier
                    .notify(NotificationEvent::DeviceOnline {
                        device_id: device_id.clone(),
                        iccid: iccid.clone(),
                        conn_id,
                        remote_addr: s.remote_addr,
                        ts: Utc::now(),
                    })
                    .await;
            }
        }
        RegistrationDecision::Update => {
            session.write().await.touch(Duration::from_secs(ctx.config.default_read_deadline_s));
        }
        RegistrationDecision::Ignore => {}
    }

    session
        .write()
        .await
        .touch(Duration::from_secs(ctx.config.default_read_deadline_s));
    reply(ctx, conn_id, frame.physical_id, frame.message_id, OP_REGISTER, vec![0x00]).await;
    Ok(())
}

pub async fn handle_heartbeat_new(
    ctx: &GatewayContext,
    session: &Arc<RwLock<ConnectionSession>>,
    frame: &DnyFrame,
) -> Result<(), HandlerError> {
    if frame.payload.len() < 4 {
        return Err(HandlerError::PayloadTooShort {
            got: frame.payload.len(),
            need: 4,
        });
    }
    let port_count = frame.payload[2] as usize;
    if frame.payload.len() < 3 + port_count {
        return Err(HandlerError::PayloadTooShort {
            got: frame.payload.len(),
            need: 3 + port_count,
        });
    }

    let device_id = {
        let s = session.read().await;
        s.device_id.clone().unwrap_or_else(|| frame.device_id())
    };

    // Only ports that actually transitioned into `Charging` since the last
    // heartbeat are collected here; the session is the single source of
    // per-port class history, so this never re-fires while a port just
    // stays charging across repeated 0x21s.
    let mut newly_charging = Vec::new();
    {
        let mut s = session.write().await;
        for (idx, &status_byte) in frame.payload[3..3 + port_count].iter().enumerate() {
            let port = (idx + 1) as u8;
            let class = classify_port_status(status_byte);
            if s.record_port_class(port, class) && class == PortClass::Charging {
                newly_charging.push(port);
            }
        }
    }

    if ctx.notifier.is_enabled() {
        for port in newly_charging {
            ctx.notifier
                .notify(NotificationEvent::ChargingStart {
                    device_id: device_id.clone(),
                    port,
                    order_no: String::new(),
                    ts: Utc::now(),
                })
                .await;
        }
    }

    Ok(())
}

pub async fn handle_legacy_heartbeat(frame: &DnyFrame, min_len: usize) -> Result<(), HandlerError> {
    if frame.payload.len() < min_len {
        return Err(HandlerError::PayloadTooShort {
            got: frame.payload.len(),
            need: min_len,
        });
    }
    Ok(())
}

pub async fn handle_power_heartbeat(
    ctx: &GatewayContext,
    session: &Arc<RwLock<ConnectionSession>>,
    frame: &DnyFrame,
    kind: HeartbeatEventKind,
) -> Result<(), HandlerError> {
    if frame.payload.len() < 8 {
        return Err(HandlerError::PayloadTooShort {
            got: frame.payload.len(),
            need: 8,
        });
    }
    let port = frame.payload[0] + 1;
    let status = frame.payload[1];
    let cumulative_energy_raw = u16::from_le_bytes([frame.payload[4], frame.payload[5]]);
    let realtime_power_raw = u16::from_le_bytes([frame.payload[6], frame.payload[7]]);

    let device_id = session
        .read()
        .await
        .device_id
        .clone()
        .unwrap_or_else(|| frame.device_id());

    let class = classify_port_status(status);
    let charging = class == PortClass::Charging;
    let bucket = crate::heartbeat_filter::HeartbeatFilter::power_bucket(realtime_power_raw);

    let accepted = ctx
        .heartbeat_filter
        .should_process(&device_id, kind, Instant::now(), status, bucket, charging)
        .await;

    if accepted && ctx.notifier.is_enabled() {
        ctx.notifier
            .notify(NotificationEvent::ChargingPower {
                device_id: device_id.clone(),
                port,
                realtime_power_w: f64::from(realtime_power_raw) * 0.1,
                cumulative_energy: f64::from(cumulative_energy_raw) * 0.01,
                ts: Utc::now(),
            })
            .await;
    }

    if matches!(class, PortClass::Idle | PortClass::Full) {
        if let Some(order_no) = ctx.registry.clear_order_active(&device_id, port).await {
            if ctx.notifier.is_enabled() {
                ctx.notifier
                    .notify(NotificationEvent::ChargingEnd {
                        device_id,
                        port,
                        order_no,
                        stop_reason: StopReason::Cleanup,
                        total_energy: f64::from(cumulative_energy_raw) * 0.01,
                        duration_s: 0,
                        ts: Utc::now(),
                    })
                    .await;
            }
        }
    }

    Ok(())
}

pub async fn handle_charge_control_response(
    ctx: &GatewayContext,
    frame: &DnyFrame,
) -> Result<(), HandlerError> {
    if frame.payload.len() != 20 {
        return Err(HandlerError::PayloadTooShort {
            got: frame.payload.len(),
            need: 20,
        });
    }
    let response_code = frame.payload[0];
    let order_no = String::from_utf8_lossy(&frame.payload[1..17])
        .trim_end_matches('\0')
        .to_owned();
    let port = frame.payload[17];

    let device_id = frame.device_id();
    let Some(confirmed) = ctx
        .command_manager
        .confirm(frame.physical_id, frame.message_id, OP_CHARGE_CONTROL, frame.payload.clone())
        .await
    else {
        return Err(HandlerError::UnknownPendingCommand {
            physical_id: frame.physical_id,
            message_id: frame.message_id,
            command: OP_CHARGE_CONTROL,
        });
    };

    if response_code == 0x00 {
        match confirmed.intent {
            Some(ChargeIntent::Start) => ctx.registry.mark_order_active(&device_id, port, &order_no).await,
            Some(ChargeIntent::Stop) => {
                ctx.registry.clear_order_active(&device_id, port).await;
            }
            None => {}
        }
    }

    if ctx.notifier.is_enabled() {
        let event = if response_code == 0x00 {
            match confirmed.intent {
                Some(ChargeIntent::Stop) => NotificationEvent::ChargingEnd {
                    device_id,
                    port,
                    order_no,
                    stop_reason: StopReason::DeviceInitiated,
                    total_energy: 0.0,
                    duration_s: 0,
                    ts: Utc::now(),
                },
                // `Start` or unspecified (caller didn't tag an intent):
                // the default the spec describes for a bare success.
                Some(ChargeIntent::Start) | None => NotificationEvent::ChargingStart {
                    device_id,
                    port,
                    order_no,
                    ts: Utc::now(),
                },
            }
        } else {
            NotificationEvent::ChargingFailed {
                device_id,
                port,
                error_code: response_code,
                reason: charge_control_failure_reason(response_code).to_owned(),
                ts: Utc::now(),
            }
        };
        ctx.notifier.notify(event).await;
    }

    Ok(())
}

fn charge_control_failure_reason(code: u8) -> &'static str {
    match code {
        0x01 => "port not inserted",
        0x02 => "port state identical",
        0x03 => "port fault",
        0x04 => "no such port",
        _ => "unknown failure",
    }
}

pub async fn handle_get_server_time(
    ctx: &GatewayContext,
    conn_id: u64,
    last_responses: &RwLock<HashMap<String, Instant>>,
    frame: &DnyFrame,
) -> Result<(), HandlerError> {
    let device_id = frame.device_id();
    let now = Instant::now();
    let min_interval = Duration::from_secs(ctx.config.time_sync_min_interval_s);

    {
        let responses = last_responses.read().await;
        if let Some(last) = responses.get(&device_id) {
            if now.saturating_duration_since(*last) < min_interval {
                return Ok(());
            }
        }
    }
    last_responses.write().await.insert(device_id, now);

    let unix_secs = u32::try_from(Utc::now().timestamp()).unwrap_or(0);
    reply(
        ctx,
        conn_id,
        frame.physical_id,
        frame.message_id,
        OP_GET_SERVER_TIME,
        unix_secs.to_le_bytes().to_vec(),
    )
    .await;
    Ok(())
}

pub async fn handle_settlement(ctx: &GatewayContext, conn_id: u64, frame: &DnyFrame) -> Result<(), HandlerError> {
    const SETTLEMENT_LEN: usize = 1 + 16 + 1 + 4 + 4 + 4 + 4;
    if frame.payload.len() < SETTLEMENT_LEN {
        return Err(HandlerError::PayloadTooShort {
            got: frame.payload.len(),
            need: SETTLEMENT_LEN,
        });
    }
    let port = frame.payload[0];
    let order_no = String::from_utf8_lossy(&frame.payload[1..17])
        .trim_end_matches('\0')
        .to_owned();
    let total_fee = u32::from_le_bytes(frame.payload[17..21].try_into().unwrap());
    let total_energy = u32::from_le_bytes(frame.payload[21..25].try_into().unwrap());
    let start_ts = u32::from_le_bytes(frame.payload[25..29].try_into().unwrap());
    let end_ts = u32::from_le_bytes(frame.payload[29..33].try_into().unwrap());

    let device_id = frame.device_id();
    ctx.registry.clear_order_active(&device_id, port).await;
    if ctx.notifier.is_enabled() {
        ctx.notifier
            .notify(NotificationEvent::Settlement {
                device_id: device_id.clone(),
                port,
                order_no: order_no.clone(),
                total_fee: f64::from(total_fee) * 0.01,
                total_energy: f64::from(total_energy) * 0.01,
                start_ts: chrono::DateTime::from_timestamp(i64::from(start_ts), 0).unwrap_or_else(Utc::now),
                end_ts: chrono::DateTime::from_timestamp(i64::from(end_ts), 0).unwrap_or_else(Utc::now),
            })
            .await;
        ctx.notifier
            .notify(NotificationEvent::ChargingEnd {
                device_id,
                port,
                order_no,
                stop_reason: StopReason::Settlement,
                total_energy: f64::from(total_energy) * 0.01,
                duration_s: u64::from(end_ts.saturating_sub(start_ts)),
                ts: Utc::now(),
            })
            .await;
    }

    reply(ctx, conn_id, frame.physical_id, frame.message_id, OP_SETTLEMENT, vec![0x00]).await;
    Ok(())
}

/// Emits `device_offline` for a session that had an identity bound,
/// called from the connection task's cleanup path.
pub async fn emit_offline_if_bound(
    ctx: &GatewayContext,
    device_id: Option<String>,
    reason: OfflineReason,
) {
    let Some(device_id) = device_id else { return };
    if ctx.notifier.is_enabled() {
        ctx.notifier
            .notify(NotificationEvent::DeviceOffline {
                device_id,
                reason,
                ts: Utc::now(),
            })
            .await;
    }
}
