//! Per-connection mutable state (C2).
//!
//! `ConnectionSession` is the single source of truth for one TCP
//! connection's handshake phase and identity; nothing outside the
//! connection's own read task mutates it except through these guarded
//! transitions.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::HandshakeError;

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connected,
    IccidReceived,
    Registering,
    Active,
    Closing,
}

/// A port's charging state as reported by a 0x21/0x06/0x26 status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortClass {
    Idle,
    Charging,
    Full,
    Fault,
}

pub fn classify_port_status(status: u8) -> PortClass {
    match status {
        0 => PortClass::Idle,
        3 => PortClass::Full,
        s if s >= 10 => PortClass::Fault,
        _ => PortClass::Charging,
    }
}

#[derive(Debug)]
pub struct ConnectionSession {
    pub conn_id: ConnId,
    pub remote_addr: SocketAddr,
    pub phase: Phase,
    pub iccid: Option<String>,
    pub device_id: Option<String>,
    pub physical_id: Option<u32>,
    pub last_activity_at: Instant,
    pub last_heartbeat_at: Option<Instant>,
    pub read_deadline_until: Instant,
    pub registered_at: Option<Instant>,
    pub last_disconnect_at: Option<Instant>,
    /// Device ids of slave/group members bound to this same connection.
    pub group_members: HashSet<String>,
    /// Last charging-class observed per port (1-based), used to detect
    /// transitions on the 0x21 heartbeat instead of re-emitting on every
    /// heartbeat a port happens to still be in the same class.
    port_classes: HashMap<u8, PortClass>,
}

impl ConnectionSession {
    pub fn on_accept(
        conn_id: ConnId,
        remote_addr: SocketAddr,
        default_read_deadline: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            remote_addr,
            phase: Phase::Connected,
            iccid: None,
            device_id: None,
            physical_id: None,
            last_activity_at: now,
            last_heartbeat_at: None,
            read_deadline_until: now + default_read_deadline,
            registered_at: None,
            last_disconnect_at: None,
            group_members: HashSet::new(),
            port_classes: HashMap::new(),
        }
    }

    /// Idempotent activity bump, callable from any handler.
    pub fn touch(&mut self, read_deadline: Duration) {
        let now = Instant::now();
        self.last_activity_at = now;
        self.read_deadline_until = now + read_deadline;
    }

    pub fn set_iccid(&mut self, iccid: String) {
        if self.iccid.is_none() {
            self.iccid = Some(iccid);
            self.phase = Phase::IccidReceived;
        }
        // Per §4.2 invariant, iccid never mutates once set; a repeat
        // sentinel with the same value is a harmless no-op, a different
        // value is ignored rather than accepted (the invariant wins).
    }

    pub fn set_identity(&mut self, device_id: String, physical_id: u32) -> Result<(), HandshakeError> {
        match (&self.device_id, self.physical_id) {
            (None, None) => {
                self.device_id = Some(device_id);
                self.physical_id = Some(physical_id);
                self.phase = Phase::Active;
                self.registered_at = Some(Instant::now());
                Ok(())
            }
            (Some(existing), _) if existing == &device_id => Ok(()),
            (Some(existing), _) => Err(HandshakeError::IdentityReassignment {
                existing: existing.clone(),
                attempted: device_id,
            }),
            (None, Some(_)) => unreachable!("physical_id is only ever set alongside device_id"),
        }
    }

    pub fn add_group_member(&mut self, slave_device_id: String) {
        self.group_members.insert(slave_device_id);
    }

    /// Records `port`'s newly observed class, returning `true` iff it
    /// differs from what was last observed for that port (the first
    /// observation of a port counts as a change from "unknown").
    pub fn record_port_class(&mut self, port: u8, class: PortClass) -> bool {
        self.port_classes.insert(port, class) != Some(class)
    }

    pub fn is_read_deadline_expired(&self, now: Instant) -> bool {
        now >= self.read_deadline_until
    }

    pub fn on_close(&mut self) {
        self.phase = Phase::Closing;
        self.last_disconnect_at = Some(Instant::now());
    }
}
