//! Runtime-checkable invariants over domain state
//!
//! Used for:
//! 1. Assertions after each operation in tests
//! 2. Property-based testing with proptest
//! 3. Formal verification with Kani
//!
//! # Invariants
//!
//! 1. **Root Domain Reserved**: key 0 is in use with full access
//! 2. **Gate Target Validity**: every live gate targets an existing domain
//! 3. **Range Owner Validity**: every protected range belongs to an existing
//!    non-root domain
//! 4. **Range Disjointness**: protected ranges never overlap

use alloc::string::String;
use alloc::vec::Vec;

use crate::gate::CallGateTable;
use crate::pkru::AccessRights;
use crate::registry::DomainRegistry;
use crate::types::ROOT_DOMAIN;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(
    registry: &DomainRegistry,
    gates: &CallGateTable,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_root_domain_reserved(registry));
    violations.extend(check_gate_targets(registry, gates));
    violations.extend(check_range_owners(registry));
    violations.extend(check_range_disjointness(registry));

    violations
}

/// Invariant 1: key 0 is in use with full access
fn check_root_domain_reserved(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    match registry.key(ROOT_DOMAIN) {
        None => violations.push(InvariantViolation {
            invariant: "root_domain_reserved",
            description: String::from("Root domain is not in use"),
        }),
        Some(key) if key.permissions != AccessRights::full() => {
            violations.push(InvariantViolation {
                invariant: "root_domain_reserved",
                description: alloc::format!(
                    "Root domain has restricted rights {:#x}",
                    key.permissions.to_bits()
                ),
            })
        }
        Some(_) => {}
    }

    violations
}

/// Invariant 2: every live gate targets an existing domain
fn check_gate_targets(
    registry: &DomainRegistry,
    gates: &CallGateTable,
) -> Vec<InvariantViolation> {
    gates
        .iter()
        .filter(|(_, entry)| !registry.contains(entry.domain))
        .map(|(id, entry)| InvariantViolation {
            invariant: "gate_target_validity",
            description: alloc::format!(
                "Gate slot {} targets non-existent domain {}",
                id.slot(),
                entry.domain
            ),
        })
        .collect()
}

/// Invariant 3: every protected range belongs to an existing non-root domain
fn check_range_owners(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    registry
        .ranges()
        .filter(|r| r.owner.is_root() || !registry.contains(r.owner))
        .map(|r| InvariantViolation {
            invariant: "range_owner_validity",
            description: alloc::format!(
                "Range {:#x}+{:#x} owned by invalid domain {}",
                r.addr,
                r.len,
                r.owner
            ),
        })
        .collect()
}

/// Invariant 4: protected ranges never overlap
fn check_range_disjointness(registry: &DomainRegistry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    // Ranges iterate in address order, so only neighbours can overlap.
    let ranges: Vec<_> = registry.ranges().collect();
    for pair in ranges.windows(2) {
        if pair[0].overlaps(pair[1]) {
            violations.push(InvariantViolation {
                invariant: "range_disjointness",
                description: alloc::format!(
                    "Range {:#x}+{:#x} overlaps {:#x}+{:#x}",
                    pair[0].addr,
                    pair[0].len,
                    pair[1].addr,
                    pair[1].len
                ),
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryPoint, KeyId, ProtectedRange};

    #[test]
    fn test_fresh_state_holds() {
        let registry = DomainRegistry::new();
        let gates = CallGateTable::new();
        assert!(check_all_invariants(&registry, &gates).is_empty());
    }

    #[test]
    fn test_populated_state_holds() {
        let mut registry = DomainRegistry::new();
        let mut gates = CallGateTable::new();
        let d = registry.insert(KeyId(2)).unwrap();
        gates.register(&registry, d, EntryPoint::new(1)).unwrap();
        registry
            .record_range(ProtectedRange {
                addr: 0x20000,
                len: 0x1000,
                owner: d,
            })
            .unwrap();

        assert!(check_all_invariants(&registry, &gates).is_empty());
    }

    #[test]
    fn test_dangling_gate_detected() {
        let mut registry = DomainRegistry::new();
        let mut gates = CallGateTable::new();
        let d = registry.insert(KeyId(2)).unwrap();
        gates.register(&registry, d, EntryPoint::new(1)).unwrap();

        // Bypass the runtime's gate check
        registry.remove(d).unwrap();

        let violations = check_all_invariants(&registry, &gates);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "gate_target_validity");
    }
}

// ============================================================================
// Kani proofs for invariants
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::types::{DomainId, EntryPoint, KeyId};

    /// Proof: inserting a domain and registering a gate maintains invariants
    #[kani::proof]
    #[kani::unwind(17)]
    fn insert_and_register_maintain_invariants() {
        let mut registry = DomainRegistry::new();
        let mut gates = CallGateTable::with_capacity(2);
        let key: u8 = kani::any();

        if let Ok(d) = registry.insert(KeyId(key)) {
            let _ = gates.register(&registry, d, EntryPoint::new(0x40));
        }

        kani::assert(
            check_all_invariants(&registry, &gates).is_empty(),
            "Insert + register should maintain invariants",
        );
    }

    /// Proof: registering against an unknown domain never creates a gate
    #[kani::proof]
    #[kani::unwind(17)]
    fn register_unknown_domain_fails_closed() {
        let registry = DomainRegistry::new();
        let mut gates = CallGateTable::with_capacity(2);
        let raw: u8 = kani::any();
        kani::assume(raw != 0);

        let result = gates.register(&registry, DomainId(raw), EntryPoint::new(1));
        kani::assert(result.is_err(), "Unknown domain must be rejected");
        kani::assert(gates.is_empty(), "No gate may be created");
    }
}
