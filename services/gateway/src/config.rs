//! Closed-set TOML configuration loader.
//!
//! Follows a two-stage raw/validated split: `RawConfig` derives
//! `#[serde(deny_unknown_fields)]` so any key outside the recognized set
//! fails to parse with the offending key named, then [`GatewayConfig::validate`]
//! fills defaults and enforces value ranges.

pub use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dny-gateway/gateway.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    tcp_listen_addr: String,
    default_read_deadline_s: Option<u64>,
    heartbeat_timeout_s: Option<u64>,
    reaper_interval_s: Option<u64>,
    command_retry_interval_s: Option<u64>,
    command_max_attempts: Option<u32>,
    heartbeat_filter_window_s: Option<u64>,
    time_sync_min_interval_s: Option<u64>,
    notification_sink_url: Option<String>,
}

/// Validated, defaulted configuration. The only type the rest of the
/// gateway ever sees.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub tcp_listen_addr: String,
    pub default_read_deadline_s: u64,
    pub heartbeat_timeout_s: u64,
    pub reaper_interval_s: u64,
    pub command_retry_interval_s: u64,
    pub command_max_attempts: u32,
    pub heartbeat_filter_window_s: u64,
    pub time_sync_min_interval_s: u64,
    pub notification_sink_url: Option<String>,
}

impl GatewayConfig {
    /// Load, parse, and validate a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse and validate a config document already in memory (used by tests).
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|e| {
            // toml's deny_unknown_fields error message already names the key;
            // surface it verbatim rather than re-deriving it.
            if e.to_string().contains("unknown field") {
                ConfigError::UnknownKey(e.to_string())
            } else {
                ConfigError::Parse(e)
            }
        })?;
        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> Result<GatewayConfig, ConfigError> {
        let command_max_attempts = self.command_max_attempts.unwrap_or(3);
        if command_max_attempts < 1 {
            return Err(ConfigError::InvalidValue {
                field: "command_max_attempts",
                reason: "must be >= 1".to_owned(),
            });
        }

        let default_read_deadline_s = self.default_read_deadline_s.unwrap_or(90);
        let heartbeat_timeout_s = self.heartbeat_timeout_s.unwrap_or(180);
        let reaper_interval_s = self.reaper_interval_s.unwrap_or(10);
        if reaper_interval_s == 0 || reaper_interval_s > 10 {
            return Err(ConfigError::InvalidValue {
                field: "reaper_interval_s",
                reason: "must be in 1..=10".to_owned(),
            });
        }
        if heartbeat_timeout_s == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_timeout_s",
                reason: "must be > 0".to_owned(),
            });
        }

        Ok(GatewayConfig {
            tcp_listen_addr: self.tcp_listen_addr,
            default_read_deadline_s,
            heartbeat_timeout_s,
            reaper_interval_s,
            command_retry_interval_s: self.command_retry_interval_s.unwrap_or(5),
            command_max_attempts,
            heartbeat_filter_window_s: self.heartbeat_filter_window_s.unwrap_or(30),
            time_sync_min_interval_s: self.time_sync_min_interval_s.unwrap_or(30),
            notification_sink_url: self.notification_sink_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let cfg = GatewayConfig::parse(r#"tcp_listen_addr = "0.0.0.0:8900""#).unwrap();
        assert_eq!(cfg.tcp_listen_addr, "0.0.0.0:8900");
        assert_eq!(cfg.default_read_deadline_s, 90);
        assert_eq!(cfg.heartbeat_timeout_s, 180);
        assert_eq!(cfg.command_max_attempts, 3);
        assert!(cfg.notification_sink_url.is_none());
    }

    #[test]
    fn loads_fully_specified_config() {
        let cfg = GatewayConfig::parse(
            r#"
            tcp_listen_addr = "127.0.0.1:9000"
            default_read_deadline_s = 60
            heartbeat_timeout_s = 120
            reaper_interval_s = 5
            command_retry_interval_s = 2
            command_max_attempts = 5
            heartbeat_filter_window_s = 15
            time_sync_min_interval_s = 10
            notification_sink_url = "https://example.test/webhook"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.command_max_attempts, 5);
        assert_eq!(
            cfg.notification_sink_url.as_deref(),
            Some("https://example.test/webhook")
        );
    }

    #[test]
    fn rejects_unknown_key() {
        let err = GatewayConfig::parse(
            r#"
            tcp_listen_addr = "0.0.0.0:8900"
            totally_made_up_option = true
            "#,
        )
        .unwrap_err();
        match err {
            ConfigError::UnknownKey(msg) => assert!(msg.contains("totally_made_up_option")),
            other => panic!("expected UnknownKey, got {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_max_attempts() {
        let err = GatewayConfig::parse(
            r#"
            tcp_listen_addr = "0.0.0.0:8900"
            command_max_attempts = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "command_max_attempts",
                ..
            }
        ));
    }
}
