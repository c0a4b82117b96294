//! S1: ICCID, then register, then a 0x21 heartbeat that starts a port.

use std::sync::Arc;
use std::time::Duration;

use dny_protocol::DecodedMessage;
use gateway::config::GatewayConfig;
use gateway::notification::{NotificationEvent, RecordingNotificationPort};
use gateway::Gateway;
use gateway_test_utils::{sample_iccid, MockDevice};

async fn spawn_test_gateway() -> (Gateway, Arc<RecordingNotificationPort>) {
    let config = GatewayConfig::parse(r#"tcp_listen_addr = "127.0.0.1:0""#).unwrap();
    let notifier = RecordingNotificationPort::new();
    let gateway = Gateway::bind(config, notifier.clone()).await.unwrap();
    (gateway, notifier)
}

#[tokio::test]
async fn registration_then_heartbeat_emits_expected_events() {
    let (gateway, notifier) = spawn_test_gateway().await;
    let addr = gateway.local_addr().unwrap();
    let shutdown = gateway.shutdown_token();
    let server = tokio::spawn(gateway.serve());

    let mut device = MockDevice::connect(addr).await.unwrap();
    device.send_iccid(&sample_iccid()).await.unwrap();

    // Register: physical_id=0x04A228CD, message_id=1, cmd=0x20, payload=[0x00].
    device.send_dny(0x04A2_28CD, 1, 0x20, vec![0x00]).await.unwrap();
    let ack = device.recv().await.unwrap().unwrap();
    match ack {
        DecodedMessage::Dny(f) => {
            assert_eq!(f.command, 0x20);
            assert_eq!(f.payload, vec![0x00]);
        }
        other => panic!("expected register ack, got {other:?}"),
    }

    // Heartbeat (0x21): voltage=0x08E6, 2 ports, statuses {1=charging, 3=full}.
    device
        .send_dny(0x04A2_28CD, 2, 0x21, vec![0xE6, 0x08, 0x02, 0x01, 0x03])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = notifier.drain().await;

    assert!(events.iter().any(|e| matches!(e, NotificationEvent::DeviceOnline { device_id, .. } if device_id == "04A228CD")));
    let charging_starts: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, NotificationEvent::ChargingStart { .. }))
        .collect();
    assert_eq!(charging_starts.len(), 1, "expected exactly one charging_start, got {events:?}");
    assert!(matches!(
        charging_starts[0],
        NotificationEvent::ChargingStart { port: 1, .. }
    ));

    shutdown.cancel();
    let _ = server.await;
}
