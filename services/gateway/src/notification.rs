//! Outbound event interface (C8) consumed by an external webhook/dispatch
//! service. The core depends only on the `NotificationPort` trait, never on
//! a concrete HTTP client.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum OfflineReason {
    Close,
    Timeout,
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Normal,
    DeviceInitiated,
    Settlement,
    /// The registry believed a port had an open order, but a power
    /// heartbeat reported it idle/full without any settlement or
    /// charge-control stop ever confirming — §4.9's "stop-session cleanup".
    Cleanup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    DeviceOnline {
        device_id: String,
        iccid: String,
        conn_id: u64,
        remote_addr: SocketAddr,
        ts: DateTime<Utc>,
    },
    DeviceOffline {
        device_id: String,
        reason: OfflineReason,
        ts: DateTime<Utc>,
    },
    ChargingStart {
        device_id: String,
        port: u8,
        order_no: String,
        ts: DateTime<Utc>,
    },
    ChargingEnd {
        device_id: String,
        port: u8,
        order_no: String,
        stop_reason: StopReason,
        total_energy: f64,
        duration_s: u64,
        ts: DateTime<Utc>,
    },
    ChargingFailed {
        device_id: String,
        port: u8,
        error_code: u8,
        reason: String,
        ts: DateTime<Utc>,
    },
    ChargingPower {
        device_id: String,
        port: u8,
        realtime_power_w: f64,
        cumulative_energy: f64,
        ts: DateTime<Utc>,
    },
    Settlement {
        device_id: String,
        port: u8,
        order_no: String,
        total_fee: f64,
        total_energy: f64,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    },
}

/// Outbound interface to the business layer. Hot paths should check
/// [`NotificationPort::is_enabled`] before building a payload.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify(&self, event: NotificationEvent);

    fn is_enabled(&self) -> bool {
        true
    }
}

/// A no-op sink for configurations with no `notification_sink_url`.
pub struct NullNotificationPort;

#[async_trait]
impl NotificationPort for NullNotificationPort {
    async fn notify(&self, _event: NotificationEvent) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// In-memory recorder used by integration tests and embedders that want to
/// assert on emitted events directly, without standing up an HTTP sink.
#[derive(Default)]
pub struct RecordingNotificationPort {
    events: Mutex<VecDeque<NotificationEvent>>,
}

impl RecordingNotificationPort {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn drain(&self) -> Vec<NotificationEvent> {
        self.events.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl NotificationPort for RecordingNotificationPort {
    async fn notify(&self, event: NotificationEvent) {
        self.events.lock().await.push_back(event);
    }
}
