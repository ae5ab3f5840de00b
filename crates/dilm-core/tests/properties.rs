//! Property tests for the register codec, registry and gate table.

use std::collections::HashSet;

use dilm_core::{
    check_all_invariants, AccessRights, CallGateTable, DilmError, DomainId, DomainRegistry,
    EntryPoint, KeyId, Pkru, MAX_GATE_SLOTS, MAX_KEYS, PKEY_ACCESS_MASK,
};
use proptest::prelude::*;

fn rights() -> impl Strategy<Value = AccessRights> {
    (0u32..=PKEY_ACCESS_MASK).prop_map(|bits| AccessRights::from_bits(bits).unwrap())
}

#[derive(Clone, Debug)]
enum GateOp {
    Register(u8),
    Unregister(usize),
}

fn gate_op() -> impl Strategy<Value = GateOp> {
    prop_oneof![
        (0u8..4).prop_map(GateOp::Register),
        (0usize..80).prop_map(GateOp::Unregister),
    ]
}

proptest! {
    #[test]
    fn masked_update_leaves_other_fields(raw in any::<u32>(), key in 0u8..16, r in rights()) {
        let before = Pkru::from_raw(raw);
        let after = before.with_rights(KeyId(key), r);

        prop_assert_eq!(after.rights(KeyId(key)), r);
        for other in (0..MAX_KEYS as u8).filter(|&k| k != key) {
            prop_assert_eq!(after.field(KeyId(other)), before.field(KeyId(other)));
        }
    }

    #[test]
    fn restoring_saved_field_is_identity(raw in any::<u32>(), key in 0u8..16, r in rights()) {
        let before = Pkru::from_raw(raw);
        let saved = before.rights(KeyId(key));
        let restored = before.with_rights(KeyId(key), r).with_rights(KeyId(key), saved);
        prop_assert_eq!(restored, before);
    }

    #[test]
    fn inserted_domains_are_distinct_and_non_root(keys in prop::collection::vec(0u8..20, 0..40)) {
        let mut registry = DomainRegistry::new();
        let mut seen = HashSet::new();

        for key in keys {
            if let Ok(d) = registry.insert(KeyId(key)) {
                prop_assert!(!d.is_root());
                prop_assert!(seen.insert(d));
            }
        }
        prop_assert!(registry.len() <= MAX_KEYS);
    }

    #[test]
    fn gate_ids_never_repeat_while_live(ops in prop::collection::vec(gate_op(), 0..200)) {
        let mut registry = DomainRegistry::new();
        for k in 1..4 {
            registry.insert(KeyId(k)).unwrap();
        }
        let mut table = CallGateTable::new();
        let mut live = Vec::new();

        for op in ops {
            match op {
                GateOp::Register(d) => {
                    let entry = EntryPoint::new(d as usize);
                    match table.register(&registry, DomainId(d), entry) {
                        Ok(id) => {
                            prop_assert!(!live.contains(&id));
                            live.push(id);
                        }
                        Err(DilmError::TableFull) => {
                            prop_assert_eq!(live.len(), MAX_GATE_SLOTS);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {:?}", e),
                    }
                }
                GateOp::Unregister(i) => {
                    if i < live.len() {
                        let id = live.swap_remove(i);
                        prop_assert!(table.unregister(id).is_ok());
                        prop_assert_eq!(table.lookup(id), Err(DilmError::InvalidCallId));
                    }
                }
            }
            prop_assert_eq!(table.len(), live.len());
            prop_assert!(check_all_invariants(&registry, &table).is_empty());
        }
    }
}
