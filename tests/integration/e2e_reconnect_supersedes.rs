//! S3: a device reconnects on a new TCP connection; the old connection's
//! identity is superseded and a `device_offline(superseded)` notification
//! fires for it, followed by `device_online` for the new connection.

use std::time::Duration;

use gateway::config::GatewayConfig;
use gateway::notification::{NotificationEvent, OfflineReason, RecordingNotificationPort};
use gateway::Gateway;
use gateway_test_utils::{sample_iccid, MockDevice};

#[tokio::test]
async fn reconnect_supersedes_prior_connection() {
    let config = GatewayConfig::parse(r#"tcp_listen_addr = "127.0.0.1:0""#).unwrap();
    let notifier = RecordingNotificationPort::new();
    let gateway = Gateway::bind(config, notifier.clone()).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    let ctx = gateway.context();
    let shutdown = gateway.shutdown_token();
    let server = tokio::spawn(gateway.serve());

    let mut device_a = MockDevice::connect(addr).await.unwrap();
    device_a.send_iccid(&sample_iccid()).await.unwrap();
    device_a.send_dny(0x1234_5678, 1, 0x20, vec![0x00]).await.unwrap();
    device_a.recv().await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    notifier.drain().await;

    let mut device_b = MockDevice::connect(addr).await.unwrap();
    device_b.send_iccid(&sample_iccid()).await.unwrap();
    device_b.send_dny(0x1234_5678, 1, 0x20, vec![0x00]).await.unwrap();
    device_b.recv().await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let events = notifier.drain().await;

    assert!(events.iter().any(|e| matches!(
        e,
        NotificationEvent::DeviceOffline {
            device_id,
            reason: OfflineReason::Superseded,
            ..
        } if device_id == "12345678"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, NotificationEvent::DeviceOnline { device_id, .. } if device_id == "12345678")));

    // The registry now points at B's connection, not A's.
    assert!(ctx.registry.lookup_by_device_id("12345678").await.is_some());

    shutdown.cancel();
    let _ = server.await;
}
