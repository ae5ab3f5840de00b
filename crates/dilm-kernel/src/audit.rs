//! Domain transition audit log
//!
//! Records every domain lifecycle change, gate registration, switch, restore
//! and host failure. Events are append-only with monotonic IDs and the log is
//! bounded: the oldest events are dropped first.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use dilm_core::{AccessRights, DomainId};
use dilm_ipc::Opcode;

/// Audit event identifier (monotonic)
pub type EventId = u64;

/// A recorded transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Host timestamp (nanos)
    pub timestamp: u64,
    /// Domain active when the event was recorded
    pub active: DomainId,
    pub kind: AuditKind,
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    DomainCreated { domain: DomainId },
    DomainFreed { domain: DomainId },
    PermissionsAssigned { domain: DomainId, rights: AccessRights },
    GateRegistered { slot: u16, domain: DomainId },
    GateUnregistered { slot: u16, domain: DomainId },
    /// Register switched to `to`'s rights
    Switch { from: DomainId, to: DomainId, pkru_before: u32, pkru_after: u32 },
    /// Register restored for `to` after a gated call into `from`
    Restore { from: DomainId, to: DomainId, pkru: u32 },
    RangeProtected { addr: u32, len: u32, domain: DomainId },
    RangeRevoked { addr: u32, len: u32 },
    /// A host round trip failed (`status` set if the host rejected it)
    HostCommandFailed { opcode: Opcode, status: Option<u8> },
}

/// Bounded, append-only audit log.
pub struct AuditLog {
    events: Vec<AuditEvent>,
    next_id: EventId,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Append an event, returning its ID.
    pub fn record(&mut self, timestamp: u64, active: DomainId, kind: AuditKind) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(AuditEvent {
            id,
            timestamp,
            active,
            kind,
        });

        self.trim_if_needed();
        id
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Get the most recent N events, newest first.
    pub fn get_recent(&self, count: usize) -> Vec<&AuditEvent> {
        self.events.iter().rev().take(count).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Export retained events as a JSON array.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.events)
    }

    fn trim_if_needed(&mut self) {
        if self.events.len() > self.capacity {
            let drain_count = self.events.len() - self.capacity;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dilm_core::ROOT_DOMAIN;

    #[test]
    fn test_audit_creation() {
        let log = AuditLog::default();
        assert!(log.is_empty());
        assert_eq!(log.next_id(), 0);
    }

    #[test]
    fn test_audit_ids_monotonic() {
        let mut log = AuditLog::new(8);
        let a = log.record(
            10,
            ROOT_DOMAIN,
            AuditKind::DomainCreated {
                domain: DomainId(1),
            },
        );
        let b = log.record(
            20,
            ROOT_DOMAIN,
            AuditKind::Switch {
                from: ROOT_DOMAIN,
                to: DomainId(1),
                pkru_before: 0x5555_5554,
                pkru_after: 0x5555_5550,
            },
        );
        assert_eq!((a, b), (0, 1));
        assert_eq!(log.get_recent(1)[0].id, 1);
    }

    #[test]
    fn test_audit_trim() {
        let mut log = AuditLog::new(3);
        for i in 0..5 {
            log.record(
                i,
                ROOT_DOMAIN,
                AuditKind::RangeRevoked {
                    addr: i as u32,
                    len: 1,
                },
            );
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.events()[0].id, 2);
        assert_eq!(log.next_id(), 5);
    }

    #[test]
    fn test_audit_json_export() {
        let mut log = AuditLog::new(4);
        log.record(
            7,
            ROOT_DOMAIN,
            AuditKind::HostCommandFailed {
                opcode: Opcode::Protect,
                status: Some(22),
            },
        );
        let json = log.to_json().unwrap();
        assert!(json.contains("HostCommandFailed"));
        assert!(json.contains("\"timestamp\":7"));
    }
}
