//! Testable property #8: a config document with a key outside the closed
//! set fails to load, naming the offending key.

use std::io::Write;

use gateway::config::{ConfigError, GatewayConfig};

#[test]
fn unknown_key_is_rejected_with_the_key_named() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        tcp_listen_addr = "0.0.0.0:8900"
        enable_quantum_flux_capacitor = true
        "#
    )
    .unwrap();

    let err = GatewayConfig::load(file.path()).unwrap_err();
    match err {
        ConfigError::UnknownKey(msg) => {
            assert!(msg.contains("enable_quantum_flux_capacitor"), "message was: {msg}");
        }
        other => panic!("expected UnknownKey, got {other:?}"),
    }
}

#[test]
fn well_formed_config_loads_successfully() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"tcp_listen_addr = "0.0.0.0:8900""#).unwrap();

    let config = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(config.tcp_listen_addr, "0.0.0.0:8900");
}

#[test]
fn missing_file_is_an_io_error() {
    let err = GatewayConfig::load("/nonexistent/path/gateway.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
