//! The shared, process-wide state every connection task and handler reads
//! through: the device registry, command-manager pending table,
//! heartbeat-filter map, and notification port, bundled so they're
//! constructed once at server startup and passed in explicitly rather than
//! lazily initialised from inside a handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::command::{CommandManager, ConnectionWriters};
use crate::config::GatewayConfig;
use crate::handshake::RegistrationLedger;
use crate::heartbeat_filter::HeartbeatFilter;
use crate::notification::{NotificationPort, NullNotificationPort};
use crate::reaper::SessionTable;
use crate::registry::DeviceRegistry;

pub struct GatewayContext {
    pub config: GatewayConfig,
    pub registry: DeviceRegistry,
    pub registration_ledger: RegistrationLedger,
    pub heartbeat_filter: HeartbeatFilter,
    pub notifier: Arc<dyn NotificationPort>,
    pub writers: Arc<ConnectionWriters>,
    pub command_manager: Arc<CommandManager>,
    pub sessions: Arc<SessionTable>,
    /// Per-device last `0x22` response instant, rate-limiting time-sync replies.
    pub last_time_sync_at: RwLock<HashMap<String, Instant>>,
}

impl GatewayContext {
    #[must_use]
    pub fn new(config: GatewayConfig, notifier: Arc<dyn NotificationPort>) -> Self {
        let writers = Arc::new(ConnectionWriters::new());
        let heartbeat_filter = HeartbeatFilter::new(std::time::Duration::from_secs(
            config.heartbeat_filter_window_s,
        ));
        Self {
            registry: DeviceRegistry::new(),
            registration_ledger: RegistrationLedger::new(),
            heartbeat_filter,
            notifier,
            command_manager: Arc::new(CommandManager::new(writers.clone())),
            writers,
            sessions: Arc::new(SessionTable::new()),
            last_time_sync_at: RwLock::new(HashMap::new()),
            config,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn for_tests() -> Arc<Self> {
        let config = GatewayConfig::parse(r#"tcp_listen_addr = "127.0.0.1:0""#).unwrap();
        Arc::new(Self::new(config, Arc::new(NullNotificationPort)))
    }

    #[cfg(test)]
    #[must_use]
    pub fn for_tests_with_notifier(notifier: Arc<dyn NotificationPort>) -> Arc<Self> {
        let config = GatewayConfig::parse(r#"tcp_listen_addr = "127.0.0.1:0""#).unwrap();
        Arc::new(Self::new(config, notifier))
    }
}
