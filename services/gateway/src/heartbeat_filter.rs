//! Per-device, per-event-kind heartbeat deduplication/throttling (C7).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatEventKind {
    PowerHeartbeat,
    PortPowerHeartbeat,
}

/// Critical hardware-fault threshold; port status codes at or above this
/// bypass the dedup window.
const CRITICAL_PORT_STATUS_THRESHOLD: u8 = 10;

#[derive(Debug, Clone, Copy)]
struct Fingerprint {
    port_status: u8,
    power_bucket: u32,
    charging: bool,
}

struct FilterEntry {
    last_event_at: Instant,
    fingerprint: Fingerprint,
}

pub struct HeartbeatFilter {
    window: Duration,
    entries: RwLock<HashMap<(String, HeartbeatEventKind), FilterEntry>>,
}

impl HeartbeatFilter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Quantizes a raw 0.1 W power reading into a coarse bucket so small
    /// jitter doesn't count as a change.
    #[must_use]
    pub fn power_bucket(realtime_power_tenths_w: u16) -> u32 {
        u32::from(realtime_power_tenths_w) / 100
    }

    /// Returns `true` iff this event should be forwarded to the
    /// notification port.
    pub async fn should_process(
        &self,
        device_id: &str,
        kind: HeartbeatEventKind,
        now: Instant,
        port_status: u8,
        power_bucket: u32,
        charging: bool,
    ) -> bool {
        let key = (device_id.to_owned(), kind);
        let fingerprint = Fingerprint {
            port_status,
            power_bucket,
            charging,
        };

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&key) else {
            entries.insert(
                key,
                FilterEntry {
                    last_event_at: now,
                    fingerprint,
                },
            );
            return true;
        };

        let elapsed = now.saturating_duration_since(entry.last_event_at);
        let charging_flipped = entry.fingerprint.charging != fingerprint.charging;
        let became_critical = fingerprint.port_status >= CRITICAL_PORT_STATUS_THRESHOLD;
        let power_bucket_jumped =
            fingerprint.power_bucket.abs_diff(entry.fingerprint.power_bucket) > 1;

        let should_process =
            elapsed >= self.window || charging_flipped || became_critical || power_bucket_jumped;

        if should_process {
            entry.last_event_at = now;
            entry.fingerprint = fingerprint;
        }

        should_process
    }
}

impl Default for HeartbeatFilter {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
