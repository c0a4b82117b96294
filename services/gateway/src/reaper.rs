//! Background liveness reaper (part of C5): closes sockets whose
//! `last_activity_at` exceeds the configured heartbeat timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::{ConnId, ConnectionSession};

/// Tracks every live connection's session plus the token used to force-close
/// its socket. A connection registers itself here on accept and deregisters
/// on close.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<ConnId, (Arc<RwLock<ConnectionSession>>, CancellationToken)>>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        conn_id: ConnId,
        session: Arc<RwLock<ConnectionSession>>,
        token: CancellationToken,
    ) {
        self.sessions.write().await.insert(conn_id, (session, token));
    }

    pub async fn remove(&self, conn_id: ConnId) {
        self.sessions.write().await.remove(&conn_id);
    }

    pub async fn get(&self, conn_id: ConnId) -> Option<Arc<RwLock<ConnectionSession>>> {
        self.sessions
            .read()
            .await
            .get(&conn_id)
            .map(|(session, _)| session.clone())
    }

    pub async fn all_ids(&self) -> Vec<ConnId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Cancels a single connection's token, e.g. during a full shutdown drain.
    pub async fn cancel(&self, conn_id: ConnId) {
        if let Some((_, token)) = self.sessions.read().await.get(&conn_id) {
            token.cancel();
        }
    }

    /// One sweep: find every session whose activity is stale, cancel its
    /// token (which the connection task observes and closes the socket
    /// on), and return the closed connection ids. Running this twice with
    /// the same clock is idempotent: once a session is removed from the
    /// table it cannot be found (and thus closed) again.
    pub async fn reap_expired(&self, heartbeat_timeout: Duration, now: Instant) -> Vec<ConnId> {
        let snapshot: Vec<(ConnId, Arc<RwLock<ConnectionSession>>, CancellationToken)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, (session, token))| (*id, session.clone(), token.clone()))
            .collect();

        let mut closed = Vec::new();
        for (conn_id, session, token) in snapshot {
            let last_activity = session.read().await.last_activity_at;
            if now.saturating_duration_since(last_activity) >= heartbeat_timeout {
                debug!(conn_id, "reaper closing connection for inactivity");
                token.cancel();
                closed.push(conn_id);
            }
        }
        closed
    }
}

/// Spawns the periodic reaper task. Returns a handle that can be awaited or
/// dropped to detach; the task runs until `shutdown` is cancelled.
pub fn spawn_reaper(
    sessions: Arc<SessionTable>,
    heartbeat_timeout: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let closed = sessions.reap_expired(heartbeat_timeout, Instant::now()).await;
                    if !closed.is_empty() {
                        info!(count = closed.len(), "reaper closed idle connections");
                    }
                }
            }
        }
    })
}
