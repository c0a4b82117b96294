//! Process-wide device-id ↔ connection mapping (C3).
//!
//! Protected by per-entry locking discipline: `Arc<RwLock<HashMap<K, V>>>`,
//! the same shape the ambient stack uses for its own broadcast/session
//! registries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::notification::{NotificationEvent, NotificationPort, OfflineReason};
use crate::session::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct DeviceRegistryEntry {
    pub device_id: String,
    pub iccid: String,
    pub physical_id: u32,
    pub current_conn_id: ConnId,
    pub status: DeviceStatus,
    pub group_id: Option<String>,
}

/// Process-wide bidirectional device_id ↔ conn_id map.
pub struct DeviceRegistry {
    by_device_id: RwLock<HashMap<String, DeviceRegistryEntry>>,
    by_conn_id: RwLock<HashMap<ConnId, Vec<String>>>,
    /// `(device_id, port) -> order_no` for ports the core believes are mid
    /// charging session, set on a successful charge-control start and
    /// cleared on stop/settlement/failure. Used only to detect the §4.9
    /// power-heartbeat-vs-registry inconsistency (device reports idle/full
    /// while an order is still open); the order's business meaning is the
    /// caller's, this core only tracks presence.
    active_orders: RwLock<HashMap<(String, u8), String>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_device_id: RwLock::new(HashMap::new()),
            by_conn_id: RwLock::new(HashMap::new()),
            active_orders: RwLock::new(HashMap::new()),
        }
    }

    /// Records that `port` on `device_id` has an open order, so a later
    /// idle/full power heartbeat for that port can be recognised as
    /// inconsistent with the registry's view.
    pub async fn mark_order_active(&self, device_id: &str, port: u8, order_no: &str) {
        self.active_orders
            .write()
            .await
            .insert((device_id.to_owned(), port), order_no.to_owned());
    }

    /// Clears the active-order marker for a port, returning the order it
    /// held if any.
    pub async fn clear_order_active(&self, device_id: &str, port: u8) -> Option<String> {
        self.active_orders
            .write()
            .await
            .remove(&(device_id.to_owned(), port))
    }

    /// Returns the open order for `(device_id, port)`, if any, without
    /// clearing it.
    pub async fn active_order(&self, device_id: &str, port: u8) -> Option<String> {
        self.active_orders
            .read()
            .await
            .get(&(device_id.to_owned(), port))
            .cloned()
    }

    /// Insert or update the entry for `device_id`. If a different
    /// connection currently owns it, that connection is unbound and an
    /// `OFFLINE` (superseded) notification is emitted for it; the prior
    /// connection is not forcibly closed.
    pub async fn register(
        &self,
        conn_id: ConnId,
        device_id: &str,
        physical_id: u32,
        iccid: &str,
        notifier: &Arc<dyn NotificationPort>,
    ) {
        let prior_conn = {
            let map = self.by_device_id.read().await;
            map.get(device_id)
                .filter(|e| e.current_conn_id != conn_id)
                .map(|e| e.current_conn_id)
        };

        if let Some(prior_conn_id) = prior_conn {
            self.unbind_device(prior_conn_id, device_id).await;
            if notifier.is_enabled() {
                notifier
                    .notify(NotificationEvent::DeviceOffline {
                        device_id: device_id.to_owned(),
                        reason: OfflineReason::Superseded,
                        ts: Utc::now(),
                    })
                    .await;
            }
        }

        let entry = DeviceRegistryEntry {
            device_id: device_id.to_owned(),
            iccid: iccid.to_owned(),
            physical_id,
            current_conn_id: conn_id,
            status: DeviceStatus::Online,
            group_id: None,
        };
        self.by_device_id
            .write()
            .await
            .insert(device_id.to_owned(), entry);
        self.by_conn_id
            .write()
            .await
            .entry(conn_id)
            .or_default()
            .push(device_id.to_owned());
    }

    pub async fn register_group_member(
        &self,
        conn_id: ConnId,
        master_device_id: &str,
        slave_device_id: &str,
        physical_id: u32,
        iccid: &str,
    ) {
        let entry = DeviceRegistryEntry {
            device_id: slave_device_id.to_owned(),
            iccid: iccid.to_owned(),
            physical_id,
            current_conn_id: conn_id,
            status: DeviceStatus::Online,
            group_id: Some(master_device_id.to_owned()),
        };
        self.by_device_id
            .write()
            .await
            .insert(slave_device_id.to_owned(), entry);
        self.by_conn_id
            .write()
            .await
            .entry(conn_id)
            .or_default()
            .push(slave_device_id.to_owned());
    }

    /// Returns the owning connection iff the entry is still `Online` — a
    /// disconnected device's entry lingers (marked `Offline`) but no longer
    /// resolves to a live connection.
    pub async fn lookup_by_device_id(&self, device_id: &str) -> Option<ConnId> {
        self.by_device_id
            .read()
            .await
            .get(device_id)
            .filter(|e| e.status == DeviceStatus::Online)
            .map(|e| e.current_conn_id)
    }

    pub async fn lookup_entry(&self, device_id: &str) -> Option<DeviceRegistryEntry> {
        self.by_device_id.read().await.get(device_id).cloned()
    }

    /// Idempotently marks a bound device `Online`. Called on every inbound
    /// message in the `Active` phase (§4.5); a no-op if already `Online`.
    pub async fn mark_online(&self, device_id: &str) {
        if let Some(entry) = self.by_device_id.write().await.get_mut(device_id) {
            entry.status = DeviceStatus::Online;
        }
    }

    pub async fn lookup_by_conn(&self, conn_id: ConnId) -> Vec<String> {
        self.by_conn_id
            .read()
            .await
            .get(&conn_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove every device this connection owns, marking each `Offline`.
    /// Called from `on_close`.
    pub async fn unbind(&self, conn_id: ConnId) -> Vec<String> {
        let device_ids = self
            .by_conn_id
            .write()
            .await
            .remove(&conn_id)
            .unwrap_or_default();
        if !device_ids.is_empty() {
            let mut by_device = self.by_device_id.write().await;
            for device_id in &device_ids {
                if let Some(entry) = by_device.get_mut(device_id) {
                    if entry.current_conn_id == conn_id {
                        entry.status = DeviceStatus::Offline;
                    }
                }
            }
        }
        device_ids
    }

    /// Unbind a single device from a specific connection without touching
    /// the connection's other (group) members.
    async fn unbind_device(&self, conn_id: ConnId, device_id: &str) {
        if let Some(ids) = self.by_conn_id.write().await.get_mut(&conn_id) {
            ids.retain(|id| id != device_id);
        }
        let mut by_device = self.by_device_id.write().await;
        if let Some(entry) = by_device.get_mut(device_id) {
            if entry.current_conn_id == conn_id {
                entry.status = DeviceStatus::Offline;
            }
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
