//! Smart-registration decision procedure (C5) and the per-device record
//! that drives it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::session::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationDecision {
    Accept,
    Update,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct RegistrationDecisionRecord {
    pub first_registration_at: Instant,
    pub last_registration_at: Instant,
    pub registration_count: u64,
    pub current_conn_id: ConnId,
    pub consecutive_retries: u32,
    pub last_decision: RegistrationDecision,
}

/// Per-device-id registration history driving the smart-registration policy.
pub struct RegistrationLedger {
    records: RwLock<HashMap<String, RegistrationDecisionRecord>>,
}

impl RegistrationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Classify a registration attempt and update the ledger accordingly.
    pub async fn decide(&self, device_id: &str, conn_id: ConnId, now: Instant) -> RegistrationDecision {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(device_id) else {
            records.insert(
                device_id.to_owned(),
                RegistrationDecisionRecord {
                    first_registration_at: now,
                    last_registration_at: now,
                    registration_count: 1,
                    current_conn_id: conn_id,
                    consecutive_retries: 0,
                    last_decision: RegistrationDecision::Accept,
                },
            );
            return RegistrationDecision::Accept;
        };

        let same_conn = record.current_conn_id == conn_id;
        let delta = now.saturating_duration_since(record.last_registration_at);

        let decision = if !same_conn {
            RegistrationDecision::Accept
        } else if delta > Duration::from_secs(5 * 60) {
            RegistrationDecision::Accept
        } else if delta < Duration::from_secs(5) {
            RegistrationDecision::Ignore
        } else if delta < Duration::from_secs(30) {
            if record.consecutive_retries < 3 {
                RegistrationDecision::Update
            } else {
                RegistrationDecision::Ignore
            }
        } else {
            RegistrationDecision::Update
        };

        match decision {
            RegistrationDecision::Accept => {
                record.consecutive_retries = 0;
            }
            RegistrationDecision::Update | RegistrationDecision::Ignore => {
                record.consecutive_retries += 1;
            }
        }
        record.last_registration_at = now;
        record.registration_count += 1;
        record.current_conn_id = conn_id;
        record.last_decision = decision;

        decision
    }
}

impl Default for RegistrationLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_registration_is_always_accepted() {
        let ledger = RegistrationLedger::new();
        let decision = ledger.decide("A", 1, Instant::now()).await;
        assert_eq!(decision, RegistrationDecision::Accept);
    }

    #[tokio::test]
    async fn fast_retransmit_on_same_conn_is_ignored() {
        let ledger = RegistrationLedger::new();
        let t0 = Instant::now();
        ledger.decide("A", 1, t0).await;
        let decision = ledger.decide("A", 1, t0 + Duration::from_secs(2)).await;
        assert_eq!(decision, RegistrationDecision::Ignore);
    }

    #[tokio::test]
    async fn moderate_delay_same_conn_is_update_until_three_retries() {
        let ledger = RegistrationLedger::new();
        let t0 = Instant::now();
        ledger.decide("A", 1, t0).await;
        // consecutive_retries starts at 0 after accept; three updates bump it
        // to 3, at which point the policy flips to ignore.
        let d1 = ledger.decide("A", 1, t0 + Duration::from_secs(10)).await;
        assert_eq!(d1, RegistrationDecision::Update);
        let d2 = ledger.decide("A", 1, t0 + Duration::from_secs(20)).await;
        assert_eq!(d2, RegistrationDecision::Update);
        let d3 = ledger.decide("A", 1, t0 + Duration::from_secs(29)).await;
        assert_eq!(d3, RegistrationDecision::Update);
        let d4 = ledger.decide("A", 1, t0 + Duration::from_secs(35)).await;
        assert_eq!(d4, RegistrationDecision::Ignore);
    }

    #[tokio::test]
    async fn different_conn_is_always_accepted() {
        let ledger = RegistrationLedger::new();
        let t0 = Instant::now();
        ledger.decide("A", 1, t0).await;
        let decision = ledger.decide("A", 2, t0 + Duration::from_millis(500)).await;
        assert_eq!(decision, RegistrationDecision::Accept);
    }

    #[tokio::test]
    async fn periodic_reregistration_after_five_minutes_is_accepted() {
        let ledger = RegistrationLedger::new();
        let t0 = Instant::now();
        ledger.decide("A", 1, t0).await;
        let decision = ledger.decide("A", 1, t0 + Duration::from_secs(301)).await;
        assert_eq!(decision, RegistrationDecision::Accept);
    }
}
