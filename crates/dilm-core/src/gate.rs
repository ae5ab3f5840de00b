//! Call gate table
//!
//! A fixed-capacity table of registered boundary crossings. Each entry binds
//! an entry point to the domain whose rights apply while it runs.
//!
//! # Security Properties
//!
//! 1. **No Forged Gate**: `CallId` has no public constructor; the only source
//!    of ids is [`CallGateTable::register`]
//! 2. **No Stale Gate**: clearing a slot bumps its generation, so ids issued
//!    before the clear no longer resolve
//! 3. **No Foreign Gate**: ids carry the identity of the issuing table

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::DilmError;
use crate::registry::DomainRegistry;
use crate::types::{DomainId, EntryPoint};

/// Maximum number of call gate slots.
pub const MAX_GATE_SLOTS: usize = 64;

static NEXT_TABLE_ID: AtomicU32 = AtomicU32::new(1);

/// Opaque handle to a registered call gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId {
    table: u32,
    slot: u16,
    generation: u32,
}

impl CallId {
    /// Slot index (the integer the guest ABI exposes).
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Generation of the slot when the id was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A live gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallGateEntry {
    /// Domain whose permissions apply while the entry point runs
    pub domain: DomainId,
    pub entry: EntryPoint,
}

#[derive(Clone, Copy, Debug)]
struct GateSlot {
    generation: u32,
    entry: Option<CallGateEntry>,
}

/// Table of registered call gates.
pub struct CallGateTable {
    id: u32,
    slots: Vec<GateSlot>,
}

impl CallGateTable {
    /// Create a table with [`MAX_GATE_SLOTS`] slots.
    pub fn new() -> Self {
        Self::with_capacity(MAX_GATE_SLOTS)
    }

    /// Create a table with `capacity` slots (1..=64).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_GATE_SLOTS);
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            slots: alloc::vec![
                GateSlot {
                    generation: 0,
                    entry: None,
                };
                capacity
            ],
        }
    }

    /// Register `entry` to run with `domain`'s rights, in the lowest free slot.
    pub fn register(
        &mut self,
        registry: &DomainRegistry,
        domain: DomainId,
        entry: EntryPoint,
    ) -> Result<CallId, DilmError> {
        if !registry.contains(domain) {
            return Err(DilmError::InvalidDomain);
        }
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.entry.is_none())
            .ok_or(DilmError::TableFull)?;

        slot.entry = Some(CallGateEntry { domain, entry });
        Ok(CallId {
            table: self.id,
            slot: index as u16,
            generation: slot.generation,
        })
    }

    /// Resolve a call id.
    pub fn lookup(&self, id: CallId) -> Result<CallGateEntry, DilmError> {
        self.live_slot(id)
            .and_then(|s| s.entry)
            .ok_or(DilmError::InvalidCallId)
    }

    /// Clear a gate. Ids issued for this slot stop resolving.
    pub fn unregister(&mut self, id: CallId) -> Result<CallGateEntry, DilmError> {
        let table = self.id;
        let slot = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|s| table == id.table && s.generation == id.generation)
            .ok_or(DilmError::InvalidCallId)?;
        let entry = slot.entry.take().ok_or(DilmError::InvalidCallId)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(entry)
    }

    /// Current id for a live slot index.
    ///
    /// This is the integer ABI boundary: the guest names gates by slot.
    pub fn resolve_slot(&self, slot: usize) -> Result<CallId, DilmError> {
        let s = self.slots.get(slot).ok_or(DilmError::InvalidCallId)?;
        if s.entry.is_none() {
            return Err(DilmError::InvalidCallId);
        }
        Ok(CallId {
            table: self.id,
            slot: slot as u16,
            generation: s.generation,
        })
    }

    /// First live gate registered for `entry`.
    pub fn find_by_entry(&self, entry: EntryPoint) -> Option<CallId> {
        self.iter().find(|(_, e)| e.entry == entry).map(|(id, _)| id)
    }

    /// Number of live gates targeting `domain`.
    pub fn live_entries_for(&self, domain: DomainId) -> usize {
        self.iter().filter(|(_, e)| e.domain == domain).count()
    }

    /// Live gates with their ids, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (CallId, CallGateEntry)> + '_ {
        self.slots.iter().enumerate().filter_map(move |(i, s)| {
            s.entry.map(|entry| {
                (
                    CallId {
                        table: self.id,
                        slot: i as u16,
                        generation: s.generation,
                    },
                    entry,
                )
            })
        })
    }

    /// Number of live gates.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn live_slot(&self, id: CallId) -> Option<&GateSlot> {
        if id.table != self.id {
            return None;
        }
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
    }
}

impl Default for CallGateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyId, ROOT_DOMAIN};

    fn registry_with_domain() -> (DomainRegistry, DomainId) {
        let mut reg = DomainRegistry::new();
        let d = reg.insert(KeyId(1)).unwrap();
        (reg, d)
    }

    #[test]
    fn test_register_lowest_free_slot() {
        let (reg, d) = registry_with_domain();
        let mut table = CallGateTable::new();

        let a = table.register(&reg, d, EntryPoint::new(0x100)).unwrap();
        let b = table.register(&reg, ROOT_DOMAIN, EntryPoint::new(0x200)).unwrap();
        assert_eq!(a.slot(), 0);
        assert_eq!(b.slot(), 1);
        assert_eq!(
            table.lookup(a),
            Ok(CallGateEntry {
                domain: d,
                entry: EntryPoint::new(0x100)
            })
        );
    }

    #[test]
    fn test_register_unknown_domain() {
        let reg = DomainRegistry::new();
        let mut table = CallGateTable::new();
        assert_eq!(
            table.register(&reg, DomainId(7), EntryPoint::new(1)),
            Err(DilmError::InvalidDomain)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_full() {
        let (reg, d) = registry_with_domain();
        let mut table = CallGateTable::new();
        for i in 0..MAX_GATE_SLOTS {
            table.register(&reg, d, EntryPoint::new(i)).unwrap();
        }
        assert_eq!(
            table.register(&reg, d, EntryPoint::new(999)),
            Err(DilmError::TableFull)
        );
        assert_eq!(table.len(), MAX_GATE_SLOTS);
    }

    #[test]
    fn test_unregister_invalidates_id() {
        let (reg, d) = registry_with_domain();
        let mut table = CallGateTable::new();
        let id = table.register(&reg, d, EntryPoint::new(0x100)).unwrap();

        table.unregister(id).unwrap();
        assert_eq!(table.lookup(id), Err(DilmError::InvalidCallId));
        assert_eq!(table.unregister(id), Err(DilmError::InvalidCallId));

        // Slot is reused with a new generation
        let reused = table.register(&reg, d, EntryPoint::new(0x300)).unwrap();
        assert_eq!(reused.slot(), id.slot());
        assert_ne!(reused, id);
        assert_eq!(table.lookup(id), Err(DilmError::InvalidCallId));
        assert!(table.lookup(reused).is_ok());
    }

    #[test]
    fn test_foreign_table_id_rejected() {
        let (reg, d) = registry_with_domain();
        let mut first = CallGateTable::new();
        let mut second = CallGateTable::new();
        let id = first.register(&reg, d, EntryPoint::new(1)).unwrap();
        second.register(&reg, d, EntryPoint::new(1)).unwrap();

        assert_eq!(second.lookup(id), Err(DilmError::InvalidCallId));
    }

    #[test]
    fn test_resolve_slot() {
        let (reg, d) = registry_with_domain();
        let mut table = CallGateTable::with_capacity(4);
        let id = table.register(&reg, d, EntryPoint::new(1)).unwrap();

        assert_eq!(table.resolve_slot(0), Ok(id));
        assert_eq!(table.resolve_slot(1), Err(DilmError::InvalidCallId));
        assert_eq!(table.resolve_slot(64), Err(DilmError::InvalidCallId));
    }

    #[test]
    fn test_find_by_entry_and_counts() {
        let (reg, d) = registry_with_domain();
        let mut table = CallGateTable::new();
        table.register(&reg, ROOT_DOMAIN, EntryPoint::new(0x10)).unwrap();
        let id = table.register(&reg, d, EntryPoint::new(0x20)).unwrap();
        table.register(&reg, d, EntryPoint::new(0x30)).unwrap();

        assert_eq!(table.find_by_entry(EntryPoint::new(0x20)), Some(id));
        assert_eq!(table.find_by_entry(EntryPoint::new(0x40)), None);
        assert_eq!(table.live_entries_for(d), 2);
        assert_eq!(table.live_entries_for(ROOT_DOMAIN), 1);
    }
}
