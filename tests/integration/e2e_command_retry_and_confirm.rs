//! S4: a command retries once, then the device's response confirms it
//! exactly once and no further retries happen.

use std::time::Duration;

use dny_protocol::DecodedMessage;
use gateway::command::{ChargeIntent, CommandManagerOptions};
use gateway::config::GatewayConfig;
use gateway::notification::{NotificationEvent, RecordingNotificationPort};
use gateway::Gateway;
use gateway_test_utils::{sample_iccid, MockDevice};

#[tokio::test(start_paused = true)]
async fn retry_then_confirm_emits_exactly_one_charging_start() {
    let config = GatewayConfig::parse(r#"tcp_listen_addr = "127.0.0.1:0""#).unwrap();
    let notifier = RecordingNotificationPort::new();
    let gateway = Gateway::bind(config, notifier.clone()).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    let ctx = gateway.context();
    let shutdown = gateway.shutdown_token();
    let server = tokio::spawn(gateway.serve());

    let mut device = MockDevice::connect(addr).await.unwrap();
    device.send_iccid(&sample_iccid()).await.unwrap();
    device.send_dny(0x0A0B_0C0D, 1, 0x20, vec![0x00]).await.unwrap();
    device.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let conn_id = ctx
        .registry
        .lookup_by_device_id("0A0B0C0D")
        .await
        .expect("device should be registered");

    let rx = ctx
        .command_manager
        .send(
            conn_id,
            0x0A0B_0C0D,
            7,
            0x82,
            vec![0u8; 19],
            CommandManagerOptions {
                retry_interval: Duration::from_secs(5),
                max_attempts: 3,
                intent: Some(ChargeIntent::Start),
            },
        )
        .await
        .unwrap();

    let first = device.recv().await.unwrap().unwrap();
    assert!(matches!(first, DecodedMessage::Dny(f) if f.command == 0x82));

    tokio::time::advance(Duration::from_secs(5) + Duration::from_millis(600)).await;
    let second = device.recv().await.unwrap().unwrap();
    assert!(matches!(second, DecodedMessage::Dny(f) if f.command == 0x82));

    let mut response_payload = vec![0x00];
    response_payload.extend_from_slice(&[0u8; 16]);
    response_payload.push(1);
    response_payload.extend_from_slice(&[0x00, 0x00]);
    device.send_dny(0x0A0B_0C0D, 7, 0x82, response_payload).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcome = rx.await.unwrap();
    assert!(matches!(outcome, gateway::command::CommandOutcome::Success(_)));

    let events = notifier.drain().await;
    let starts: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, NotificationEvent::ChargingStart { .. }))
        .collect();
    assert_eq!(starts.len(), 1);

    shutdown.cancel();
    let _ = server.await;
}
