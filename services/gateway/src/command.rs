//! Outbound command correlation (C6): tracks server-issued requests,
//! matches device responses, and retries on a single background scheduler
//! task rather than one timer per command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CommandError;
use crate::session::ConnId;
use dny_protocol::{encode_frame, OutboundDnyFrame};

pub type CommandKey = (ConnId, u32, u16, u8);

#[derive(Debug)]
pub enum CommandOutcome {
    Success(Vec<u8>),
    Timeout,
    ConnectionClosed,
}

/// What a charge-control (`0x82`) request was asking the device to do.
/// Supplied by the caller at `send()` time (the charging-policy layer is
/// out of scope for this core, so it is the only side that knows); carried
/// through the pending table and handed back on `confirm()` so the handler
/// can tell a successful start from a successful stop without re-parsing
/// the original outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeIntent {
    Start,
    Stop,
}

/// Result of a successful [`CommandManager::confirm`] match.
pub struct ConfirmedCommand {
    pub response: Vec<u8>,
    pub intent: Option<ChargeIntent>,
}

struct PendingEntry {
    frame_bytes: Vec<u8>,
    attempt_count: u32,
    max_attempts: u32,
    retry_interval: Duration,
    next_retry_at: Instant,
    first_sent_at: Instant,
    last_sent_at: Instant,
    intent: Option<ChargeIntent>,
    outcome_tx: Option<oneshot::Sender<CommandOutcome>>,
}

/// Per-connection outbound byte queues. Each connection task owns a
/// receiver end and writes whatever bytes arrive to its socket half.
#[derive(Default)]
pub struct ConnectionWriters {
    senders: RwLock<HashMap<ConnId, tokio::sync::mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ConnectionWriters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn_id: ConnId) -> tokio::sync::mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.senders.write().await.insert(conn_id, tx);
        rx
    }

    pub async fn unregister(&self, conn_id: ConnId) {
        self.senders.write().await.remove(&conn_id);
    }

    pub async fn write(&self, conn_id: ConnId, bytes: Vec<u8>) -> Result<(), CommandError> {
        let senders = self.senders.read().await;
        let Some(sender) = senders.get(&conn_id) else {
            return Err(CommandError::DeviceNotConnected(conn_id.to_string()));
        };
        sender
            .send(bytes)
            .map_err(|_| CommandError::DeviceNotConnected(conn_id.to_string()))
    }
}

pub struct CommandManagerOptions {
    pub retry_interval: Duration,
    pub max_attempts: u32,
    pub intent: Option<ChargeIntent>,
}

pub struct CommandManager {
    pending: RwLock<HashMap<CommandKey, PendingEntry>>,
    writers: Arc<ConnectionWriters>,
}

impl CommandManager {
    #[must_use]
    pub fn new(writers: Arc<ConnectionWriters>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            writers,
        }
    }

    /// Encodes and sends a command, tracking it for retry/confirmation.
    /// The returned receiver resolves once the command is confirmed, times
    /// out, or its connection closes.
    pub async fn send(
        &self,
        conn_id: ConnId,
        physical_id: u32,
        message_id: u16,
        command: u8,
        payload: Vec<u8>,
        opts: CommandManagerOptions,
    ) -> Result<oneshot::Receiver<CommandOutcome>, CommandError> {
        let key = (conn_id, physical_id, message_id, command);
        let bytes = encode_frame(&OutboundDnyFrame::new(physical_id, message_id, command, payload));
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        {
            let mut pending = self.pending.write().await;
            if pending.contains_key(&key) {
                // Should not happen given the key definition; treat as a
                // programmer error, not a panic.
                warn!(?key, "duplicate pending-command key, dropping new insert");
                return Err(CommandError::DuplicateKey);
            }
            pending.insert(
                key,
                PendingEntry {
                    frame_bytes: bytes.clone(),
                    attempt_count: 1,
                    max_attempts: opts.max_attempts,
                    retry_interval: opts.retry_interval,
                    next_retry_at: now + opts.retry_interval,
                    first_sent_at: now,
                    last_sent_at: now,
                    intent: opts.intent,
                    outcome_tx: Some(tx),
                },
            );
        }

        if let Err(e) = self.writers.write(conn_id, bytes).await {
            self.pending.write().await.remove(&key);
            return Err(e);
        }

        Ok(rx)
    }

    /// Matches an inbound response against the pending table. Confirmation
    /// is at-most-once: a duplicate response is a no-op. Returns the
    /// matched command's context (including its [`ChargeIntent`], if any)
    /// so the caller can interpret the response without re-decoding the
    /// original outbound frame.
    pub async fn confirm(
        &self,
        physical_id: u32,
        message_id: u16,
        command: u8,
        response: Vec<u8>,
    ) -> Option<ConfirmedCommand> {
        let key = {
            let pending = self.pending.read().await;
            pending
                .keys()
                .find(|(_, p, m, c)| *p == physical_id && *m == message_id && *c == command)
                .copied()
        };
        let key = key?;
        let entry = {
            let mut pending = self.pending.write().await;
            pending.remove(&key)
        };
        let entry = entry?;
        if let Some(tx) = entry.outcome_tx {
            let _ = tx.send(CommandOutcome::Success(response.clone()));
        }
        Some(ConfirmedCommand {
            response,
            intent: entry.intent,
        })
    }

    /// Drains all entries tied to a closed connection, failing each one.
    pub async fn cancel_for_conn(&self, conn_id: ConnId) {
        let keys: Vec<CommandKey> = {
            let pending = self.pending.read().await;
            pending.keys().filter(|(c, ..)| *c == conn_id).copied().collect()
        };
        let mut pending = self.pending.write().await;
        for key in keys {
            if let Some(entry) = pending.remove(&key) {
                if let Some(tx) = entry.outcome_tx {
                    let _ = tx.send(CommandOutcome::ConnectionClosed);
                }
            }
        }
    }

    /// One scan of the pending table: resend anything past its
    /// `next_retry_at`, and time out anything that has exhausted its
    /// attempts.
    async fn scan_once(&self, now: Instant) {
        let due: Vec<CommandKey> = {
            let pending = self.pending.read().await;
            pending
                .iter()
                .filter(|(_, e)| now >= e.next_retry_at)
                .map(|(k, _)| *k)
                .collect()
        };

        for key in due {
            let (conn_id, physical_id, ..) = key;
            let mut pending = self.pending.write().await;
            let Some(entry) = pending.get_mut(&key) else {
                continue;
            };
            if entry.attempt_count >= entry.max_attempts {
                let entry = pending.remove(&key).expect("just looked up");
                if let Some(tx) = entry.outcome_tx {
                    let _ = tx.send(CommandOutcome::Timeout);
                }
                info!(physical_id, "command exhausted retries, timing out");
                continue;
            }

            entry.attempt_count += 1;
            entry.last_sent_at = now;
            entry.next_retry_at = now + entry.retry_interval;
            let bytes = entry.frame_bytes.clone();
            drop(pending);
            if let Err(e) = self.writers.write(conn_id, bytes).await {
                warn!(conn_id, error = %e, "command retry write failed");
            }
        }
    }
}

/// Spawns the single background task that drives all retry/timeout
/// scheduling, regardless of fleet size.
pub fn spawn_retry_scheduler(
    manager: Arc<CommandManager>,
    scan_interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(scan_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    manager.scan_once(Instant::now()).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_resolves_the_pending_receiver_exactly_once() {
        let writers = Arc::new(ConnectionWriters::new());
        let _rx_conn = writers.register(1).await;
        let manager = CommandManager::new(writers);

        let rx = manager
            .send(
                1,
                0x0102_0304,
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

        let confirmed = manager.confirm(0x0102_0304, 7, 0x82, vec![0x00]).await;
        assert!(matches!(confirmed, Some(ConfirmedCommand { intent: Some(ChargeIntent::Start), .. })));

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Success(_)));

        // A duplicate confirmation is a no-op: the entry is already gone.
        let duplicate = manager.confirm(0x0102_0304, 7, 0x82, vec![0x00]).await;
        assert!(duplicate.is_none());
    }

    #[tokio::test]
    async fn scan_retries_then_times_out_after_max_attempts() {
        let writers = Arc::new(ConnectionWriters::new());
        let mut rx_conn = writers.register(1).await;
        let manager = Arc::new(CommandManager::new(writers));

        let rx = manager
            .send(
                1,
                1,
                1,
                0x82,
                vec![0u8; 19],
                CommandManagerOptions {
                    retry_interval: Duration::from_millis(10),
                    max_attempts: 2,
                    intent: None,
                },
            )
            .await
            .unwrap();
        // Drain the initial send.
        rx_conn.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.scan_once(Instant::now()).await;
        // Second attempt should have been written.
        rx_conn.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.scan_once(Instant::now()).await;

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Timeout));
    }

    #[tokio::test]
    async fn cancel_for_conn_fails_all_its_pending_commands() {
        let writers = Arc::new(ConnectionWriters::new());
        let _rx = writers.register(1).await;
        let manager = CommandManager::new(writers);

        let rx1 = manager
            .send(
                1,
                1,
                1,
                0x82,
                vec![0u8; 19],
                CommandManagerOptions {
                    retry_interval: Duration::from_secs(5),
                    max_attempts: 3,
                    intent: None,
                },
            )
            .await
            .unwrap();

        manager.cancel_for_conn(1).await;
        let outcome = rx1.await.unwrap();
        assert!(matches!(outcome, CommandOutcome::ConnectionClosed));
    }

    #[tokio::test]
    async fn duplicate_key_insert_is_rejected_not_overwritten() {
        let writers = Arc::new(ConnectionWriters::new());
        let _rx = writers.register(1).await;
        let manager = CommandManager::new(writers);

        let opts = || CommandManagerOptions {
            retry_interval: Duration::from_secs(5),
            max_attempts: 3,
            intent: None,
        };
        let _rx1 = manager.send(1, 1, 1, 0x82, vec![0u8; 19], opts()).await.unwrap();
        let second = manager.send(1, 1, 1, 0x82, vec![0u8; 19], opts()).await;
        assert!(matches!(second, Err(CommandError::DuplicateKey)));
    }
}
