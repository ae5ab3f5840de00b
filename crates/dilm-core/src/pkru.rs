//! Permission bitset codec for the protection-key control register
//!
//! The register is a 32-bit word with a 2-bit field per key at bit offset
//! `key * 2`: bit 0 disables all access, bit 1 disables writes. Every update
//! is a masked read-modify-write so that only the target key's field changes.
//!
//! # Security Properties
//!
//! 1. **Field isolation**: `with_rights` never changes another key's bits
//! 2. **Uninitialised register is closed**: a zero reading means every key
//!    except 0 is access-disabled

use serde::{Deserialize, Serialize};

use crate::types::KeyId;

/// Disable all data access through the key
pub const PKEY_DISABLE_ACCESS: u32 = 0x1;
/// Disable writes through the key
pub const PKEY_DISABLE_WRITE: u32 = 0x2;
/// Mask of one key's field
pub const PKEY_ACCESS_MASK: u32 = PKEY_DISABLE_ACCESS | PKEY_DISABLE_WRITE;
/// Number of hardware keys
pub const MAX_KEYS: usize = 16;
/// Register value assumed when the host reports zero
pub const DEFAULT_DENY_PKRU: u32 = 0x5555_5554;

/// Access rights of one key, as a disable-bitset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRights {
    /// No reads or writes
    pub disable_access: bool,
    /// No writes
    pub disable_write: bool,
}

impl AccessRights {
    /// Full access (no disable bits)
    pub fn full() -> Self {
        Self::default()
    }

    /// Reads allowed, writes disabled
    pub fn read_only() -> Self {
        Self {
            disable_access: false,
            disable_write: true,
        }
    }

    /// Both disable bits set; the state of a freshly created domain
    pub fn deny_all() -> Self {
        Self {
            disable_access: true,
            disable_write: true,
        }
    }

    /// Convert to the 2-bit field representation
    pub fn to_bits(&self) -> u32 {
        let mut b = 0u32;
        if self.disable_access {
            b |= PKEY_DISABLE_ACCESS;
        }
        if self.disable_write {
            b |= PKEY_DISABLE_WRITE;
        }
        b
    }

    /// Parse a field, rejecting bits outside the two defined flags
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !PKEY_ACCESS_MASK != 0 {
            return None;
        }
        Some(Self {
            disable_access: bits & PKEY_DISABLE_ACCESS != 0,
            disable_write: bits & PKEY_DISABLE_WRITE != 0,
        })
    }

    pub fn allows_read(&self) -> bool {
        !self.disable_access
    }

    pub fn allows_write(&self) -> bool {
        !self.disable_access && !self.disable_write
    }
}

/// Value of the key control register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pkru(u32);

impl Pkru {
    /// Wrap a raw register value as-is.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Interpret a value read from the host.
    ///
    /// Zero means the host has not initialised the register yet and is read
    /// as [`DEFAULT_DENY_PKRU`].
    pub fn from_register(raw: u32) -> Self {
        if raw == 0 {
            Self(DEFAULT_DENY_PKRU)
        } else {
            Self(raw)
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Raw 2-bit field of `key`.
    pub fn field(self, key: KeyId) -> u32 {
        (self.0 >> key.shift()) & PKEY_ACCESS_MASK
    }

    /// Rights currently encoded for `key`.
    pub fn rights(self, key: KeyId) -> AccessRights {
        let bits = self.field(key);
        AccessRights {
            disable_access: bits & PKEY_DISABLE_ACCESS != 0,
            disable_write: bits & PKEY_DISABLE_WRITE != 0,
        }
    }

    /// Replace `key`'s field with `rights`, leaving every other field intact.
    pub fn with_rights(self, key: KeyId, rights: AccessRights) -> Self {
        let shift = key.shift();
        let cleared = self.0 & !(PKEY_ACCESS_MASK << shift);
        Self(cleared | (rights.to_bits() << shift))
    }

    /// True unless both disable bits are set for `key`.
    pub fn is_key_loaded(self, key: KeyId) -> bool {
        self.field(key) != PKEY_ACCESS_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rights_bits() {
        assert_eq!(AccessRights::full().to_bits(), 0);
        assert_eq!(AccessRights::read_only().to_bits(), PKEY_DISABLE_WRITE);
        assert_eq!(AccessRights::deny_all().to_bits(), 0x3);
        assert_eq!(AccessRights::from_bits(0x2), Some(AccessRights::read_only()));
        assert_eq!(AccessRights::from_bits(0x4), None);
        assert_eq!(AccessRights::from_bits(0xFFFF_FFFF), None);
    }

    #[test]
    fn test_rights_predicates() {
        assert!(AccessRights::read_only().allows_read());
        assert!(!AccessRights::read_only().allows_write());
        let ad_only = AccessRights::from_bits(PKEY_DISABLE_ACCESS).unwrap();
        assert!(!ad_only.allows_read());
        assert!(!ad_only.allows_write());
    }

    #[test]
    fn test_zero_register_is_default_deny() {
        let pkru = Pkru::from_register(0);
        assert_eq!(pkru.raw(), DEFAULT_DENY_PKRU);
        assert_eq!(pkru.rights(KeyId(0)), AccessRights::full());
        for k in 1..MAX_KEYS as u8 {
            assert!(pkru.rights(KeyId(k)).disable_access);
        }
        assert_eq!(Pkru::from_register(0x0C).raw(), 0x0C);
    }

    #[test]
    fn test_masked_update_touches_one_field() {
        let pkru = Pkru::from_raw(0xFFFF_FFFF);
        let updated = pkru.with_rights(KeyId(3), AccessRights::full());
        assert_eq!(updated.raw(), 0xFFFF_FF3F);

        let updated = Pkru::from_raw(0).with_rights(KeyId(15), AccessRights::read_only());
        assert_eq!(updated.raw(), 0x8000_0000);
    }

    #[test]
    fn test_key_loaded() {
        let pkru = Pkru::from_raw(0).with_rights(KeyId(2), AccessRights::deny_all());
        assert!(!pkru.is_key_loaded(KeyId(2)));
        assert!(pkru.is_key_loaded(KeyId(1)));

        let pkru = pkru.with_rights(KeyId(2), AccessRights::read_only());
        assert!(pkru.is_key_loaded(KeyId(2)));
    }
}

// ============================================================================
// Kani proofs for the codec
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: a masked update never changes another key's field
    #[kani::proof]
    fn with_rights_preserves_other_fields() {
        let raw: u32 = kani::any();
        let key: u8 = kani::any();
        let other: u8 = kani::any();
        let bits: u32 = kani::any();
        kani::assume(key < MAX_KEYS as u8 && other < MAX_KEYS as u8 && key != other);
        kani::assume(bits <= PKEY_ACCESS_MASK);

        let rights = AccessRights::from_bits(bits).unwrap();
        let before = Pkru::from_raw(raw);
        let after = before.with_rights(KeyId(key), rights);

        kani::assert(
            after.field(KeyId(other)) == before.field(KeyId(other)),
            "Updating one key must not change another key's field",
        );
        kani::assert(
            after.rights(KeyId(key)) == rights,
            "Updated key must carry exactly the requested rights",
        );
    }

    /// Proof: from_bits accepts exactly the two defined flags
    #[kani::proof]
    fn from_bits_is_exact() {
        let bits: u32 = kani::any();
        match AccessRights::from_bits(bits) {
            Some(r) => kani::assert(r.to_bits() == bits, "Round trip must be exact"),
            None => kani::assert(bits > PKEY_ACCESS_MASK, "Only undefined bits are rejected"),
        }
    }
}
