//! Core handle types

use core::fmt;

use serde::{Deserialize, Serialize};

/// Protection domain identifier.
///
/// Domains and keys coincide 1:1, so the id is also the key index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u8);

/// The root domain (key 0). Always exists, always full access.
pub const ROOT_DOMAIN: DomainId = DomainId(0);

impl DomainId {
    /// Hardware key bound to this domain.
    pub fn key(self) -> KeyId {
        KeyId(self.0)
    }

    pub fn is_root(self) -> bool {
        self == ROOT_DOMAIN
    }

    /// Convert a guest-supplied integer, rejecting values that cannot name a key.
    pub fn from_raw(raw: i32) -> Option<Self> {
        u8::try_from(raw).ok().map(DomainId)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Hardware protection key index (0..16).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(pub u8);

impl KeyId {
    /// Bit offset of this key's field in the control register.
    pub fn shift(self) -> u32 {
        u32::from(self.0) * 2
    }

    pub fn domain(self) -> DomainId {
        DomainId(self.0)
    }
}

/// Opaque address of a function reachable through a call gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryPoint(usize);

impl EntryPoint {
    pub fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

/// A linear-memory range tagged with a non-root domain's key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRange {
    /// Start address (page aligned)
    pub addr: u32,
    /// Length in bytes
    pub len: u32,
    /// Domain whose key tags the range
    pub owner: DomainId,
}

impl ProtectedRange {
    /// End address (exclusive), saturating at the top of the address space.
    pub fn end(&self) -> u32 {
        self.addr.saturating_add(self.len)
    }

    pub fn overlaps(&self, other: &ProtectedRange) -> bool {
        self.addr < other.end() && other.addr < self.end()
    }
}
