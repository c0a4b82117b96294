//! S6: a session goes quiet after becoming active; once the heartbeat
//! timeout elapses, the reaper closes the socket and a `device_offline`
//! (timeout) notification fires, along with failure callbacks for any of
//! that device's pending commands.

use std::time::Duration;

use gateway::command::{CommandManagerOptions, CommandOutcome};
use gateway::config::GatewayConfig;
use gateway::notification::{NotificationEvent, OfflineReason, RecordingNotificationPort};
use gateway::Gateway;
use gateway_test_utils::{sample_iccid, MockDevice};

#[tokio::test(start_paused = true)]
async fn idle_connection_is_reaped_and_pending_commands_fail() {
    let config = GatewayConfig::parse(
        r#"
        tcp_listen_addr = "127.0.0.1:0"
        heartbeat_timeout_s = 180
        reaper_interval_s = 5
        "#,
    )
    .unwrap();
    let notifier = RecordingNotificationPort::new();
    let gateway = Gateway::bind(config, notifier.clone()).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    let ctx = gateway.context();
    let shutdown = gateway.shutdown_token();
    let server = tokio::spawn(gateway.serve());

    let mut device = MockDevice::connect(addr).await.unwrap();
    device.send_iccid(&sample_iccid()).await.unwrap();
    device.send_dny(0x2222_3333, 1, 0x20, vec![0x00]).await.unwrap();
    device.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let conn_id = ctx
        .registry
        .lookup_by_device_id("22223333")
        .await
        .expect("device should be registered");

    let rx = ctx
        .command_manager
        .send(
            conn_id,
            0x2222_3333,
            1,
            0x82,
            vec![0u8; 19],
            CommandManagerOptions {
                retry_interval: Duration::from_secs(999),
                max_attempts: 99,
                intent: None,
            },
        )
        .await
        .unwrap();
    device.recv().await.unwrap();

    tokio::time::advance(Duration::from_secs(181)).await;
    // Let the reaper tick and the connection task observe cancellation.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = rx.await.unwrap();
    assert!(matches!(outcome, CommandOutcome::ConnectionClosed));

    let events = notifier.drain().await;
    assert!(events.iter().any(|e| matches!(
        e,
        NotificationEvent::DeviceOffline {
            device_id,
            reason: OfflineReason::Timeout,
            ..
        } if device_id == "22223333"
    )));

    // The socket itself should now be closed from the server's side.
    let closed = device.recv().await.unwrap();
    assert!(closed.is_none(), "expected connection to be closed, got {closed:?}");

    shutdown.cancel();
    let _ = server.await;
}
