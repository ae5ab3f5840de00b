//! Domain & key registry
//!
//! One slot per hardware key. Key 0 is the root domain: always in use, always
//! full access, never freed. The registry also tracks which linear-memory
//! ranges are tagged with a non-root key, so a domain cannot be freed while
//! memory still carries its key.

use alloc::collections::BTreeMap;

use crate::error::DilmError;
use crate::pkru::{AccessRights, MAX_KEYS};
use crate::types::{DomainId, KeyId, ProtectedRange, ROOT_DOMAIN};

/// One hardware key slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectionKey {
    pub id: KeyId,
    /// Rights applied when the owning domain becomes active
    pub permissions: AccessRights,
    pub in_use: bool,
}

impl ProtectionKey {
    fn vacant(id: u8) -> Self {
        Self {
            id: KeyId(id),
            permissions: AccessRights::deny_all(),
            in_use: false,
        }
    }
}

/// Registry of domains and their protected ranges.
pub struct DomainRegistry {
    keys: [ProtectionKey; MAX_KEYS],
    key_limit: u8,
    /// Protected ranges keyed by start address
    ranges: BTreeMap<u32, ProtectedRange>,
}

impl DomainRegistry {
    /// Create a registry with only the root domain.
    pub fn new() -> Self {
        Self::with_key_limit(MAX_KEYS as u8)
    }

    /// Create a registry that accepts keys below `limit` (at most 16).
    pub fn with_key_limit(limit: u8) -> Self {
        let mut keys = core::array::from_fn(|i| ProtectionKey::vacant(i as u8));
        keys[0] = ProtectionKey {
            id: KeyId(0),
            permissions: AccessRights::full(),
            in_use: true,
        };
        Self {
            keys,
            key_limit: limit.clamp(1, MAX_KEYS as u8),
            ranges: BTreeMap::new(),
        }
    }

    /// Highest key id (exclusive) this registry accepts.
    pub fn key_limit(&self) -> u8 {
        self.key_limit
    }

    /// Check whether `domain` exists.
    pub fn contains(&self, domain: DomainId) -> bool {
        domain.0 < self.key_limit && self.keys[domain.0 as usize].in_use
    }

    /// Record a key handed out by the host as a new, default-deny domain.
    ///
    /// Fails with `InvalidDomain` for key 0, keys past the limit, and keys
    /// already in use.
    pub fn insert(&mut self, key: KeyId) -> Result<DomainId, DilmError> {
        if key.0 == 0 || key.0 >= self.key_limit {
            return Err(DilmError::InvalidDomain);
        }
        let slot = &mut self.keys[key.0 as usize];
        if slot.in_use {
            return Err(DilmError::InvalidDomain);
        }
        slot.in_use = true;
        slot.permissions = AccessRights::deny_all();
        Ok(key.domain())
    }

    /// Release a domain's key.
    ///
    /// The caller is responsible for checking gates; this checks ranges.
    pub fn remove(&mut self, domain: DomainId) -> Result<ProtectionKey, DilmError> {
        if domain.is_root() || !self.contains(domain) {
            return Err(DilmError::InvalidDomain);
        }
        let ranges = self.ranges_owned_by(domain);
        if ranges > 0 {
            return Err(DilmError::DomainInUse { gates: 0, ranges });
        }
        let slot = &mut self.keys[domain.0 as usize];
        let released = *slot;
        *slot = ProtectionKey::vacant(domain.0);
        Ok(released)
    }

    /// Rights stored for `domain`.
    pub fn permissions(&self, domain: DomainId) -> Result<AccessRights, DilmError> {
        if !self.contains(domain) {
            return Err(DilmError::InvalidDomain);
        }
        Ok(self.keys[domain.0 as usize].permissions)
    }

    /// Store new rights for a non-root domain.
    pub fn set_permissions(
        &mut self,
        domain: DomainId,
        rights: AccessRights,
    ) -> Result<(), DilmError> {
        if domain.is_root() || !self.contains(domain) {
            return Err(DilmError::InvalidDomain);
        }
        self.keys[domain.0 as usize].permissions = rights;
        Ok(())
    }

    /// Key slot for `domain`, if it exists.
    pub fn key(&self, domain: DomainId) -> Option<&ProtectionKey> {
        if self.contains(domain) {
            Some(&self.keys[domain.0 as usize])
        } else {
            None
        }
    }

    /// All domains in use, root first.
    pub fn domains(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.keys[..self.key_limit as usize]
            .iter()
            .filter(|k| k.in_use)
            .map(|k| k.id.domain())
    }

    /// Number of domains in use, root included.
    pub fn len(&self) -> usize {
        self.domains().count()
    }

    /// Always false: the root domain exists for the registry's lifetime.
    pub fn is_empty(&self) -> bool {
        false
    }

    // === Protected ranges ===

    /// Record that `range` is tagged with its owner's key.
    pub fn record_range(&mut self, range: ProtectedRange) -> Result<(), DilmError> {
        if range.owner.is_root() || !self.contains(range.owner) {
            return Err(DilmError::InvalidDomain);
        }
        if range.len == 0 || self.ranges.values().any(|r| r.overlaps(&range)) {
            return Err(DilmError::InvalidArgument);
        }
        self.ranges.insert(range.addr, range);
        Ok(())
    }

    /// Forget the range starting at `addr`.
    pub fn release_range(&mut self, addr: u32) -> Option<ProtectedRange> {
        self.ranges.remove(&addr)
    }

    /// Range starting at `addr`.
    pub fn range(&self, addr: u32) -> Option<&ProtectedRange> {
        self.ranges.get(&addr)
    }

    /// All protected ranges in address order.
    pub fn ranges(&self) -> impl Iterator<Item = &ProtectedRange> + '_ {
        self.ranges.values()
    }

    /// Number of ranges tagged with `domain`'s key.
    pub fn ranges_owned_by(&self, domain: DomainId) -> usize {
        self.ranges.values().filter(|r| r.owner == domain).count()
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
