//! DILM integration tests
//!
//! End-to-end scenarios against the emulated host: gated calls, faults under
//! restricted domains, allocator tagging, teardown and host failures.

use std::collections::HashSet;

use dilm_ipc::HostCommand;
use dilm_kernel::{
    abi, AccessRights, AuditKind, DilmError, Dilm, DomainId, EmulatedHost, EntryPoint, HalError,
    Host, HostFailure, Pkru, DEFAULT_DENY_PKRU, PKEY_DISABLE_ACCESS, PKEY_DISABLE_WRITE,
    ROOT_DOMAIN,
};
use proptest::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn context() -> Dilm<EmulatedHost> {
    init_tracing();
    Dilm::new(EmulatedHost::new())
}

/// Allocate `size` bytes inside `domain` through a throwaway gate.
fn alloc_in(ctx: &mut Dilm<EmulatedHost>, domain: DomainId, size: u32) -> u32 {
    fn alloc(ctx: &mut Dilm<EmulatedHost>, size: u32) -> Result<u32, DilmError> {
        ctx.hook_alloc(size)
    }

    let gate = ctx.register_call(domain, alloc).unwrap();
    let addr = gate.call(ctx, size).unwrap().unwrap();
    ctx.unregister_call(gate.call_id()).unwrap();
    addr
}

fn write_byte(ctx: &mut Dilm<EmulatedHost>, addr: u32) -> Result<(), HalError> {
    ctx.host_mut().store(addr, &[0xAB])
}

fn read_byte(ctx: &mut Dilm<EmulatedHost>, addr: u32) -> Result<u8, HalError> {
    ctx.host().load(addr, 1).map(|b| b[0])
}

fn write_secret(ctx: &mut Dilm<EmulatedHost>, addr: u32) -> Result<(), HalError> {
    ctx.host_mut().store(addr, b"SECRET")
}

fn free_then_alloc(
    ctx: &mut Dilm<EmulatedHost>,
    victim: u32,
) -> (Result<(), DilmError>, Result<u32, DilmError>) {
    (ctx.hook_free(victim), ctx.hook_alloc(4096))
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_write_under_read_only_domain_faults() {
    let mut ctx = context();
    let root_buf = ctx.hook_alloc(64).unwrap();

    let d1 = ctx.create_domain(0).unwrap();
    ctx.assign_permissions(d1, 0).unwrap();
    let d1_buf = alloc_in(&mut ctx, d1, 64);
    ctx.assign_permissions(d1, PKEY_DISABLE_WRITE).unwrap();

    // Root before the call
    assert_eq!(write_byte(&mut ctx, root_buf), Ok(()));

    let writer = ctx.register_call(d1, write_byte).unwrap();
    let reader = ctx.register_call(d1, read_byte).unwrap();
    let pkru_before = ctx.host().pkru();

    assert_eq!(
        writer.call(&mut ctx, d1_buf),
        Ok(Err(HalError::ProtectionFault {
            addr: d1_buf,
            key: d1.0,
            write: true
        }))
    );
    assert_eq!(reader.call(&mut ctx, d1_buf), Ok(Ok(0)));
    assert_eq!(ctx.host().pkru(), pkru_before);
    assert_eq!(ctx.current_domain(), ROOT_DOMAIN);

    // Root after the call
    assert_eq!(write_byte(&mut ctx, root_buf), Ok(()));
    assert!(ctx.check_invariants().is_empty());
}

#[test]
fn test_locked_domain_opens_only_during_call() {
    let mut ctx = context();
    let d1 = ctx.create_domain(0).unwrap();
    ctx.assign_permissions(d1, 0).unwrap();
    let buf = alloc_in(&mut ctx, d1, 16);

    // D1 keeps full rights for calls; lock its key outside of them.
    let writer = ctx.register_call(d1, write_byte).unwrap();
    let locked = Pkru::from_raw(ctx.host().pkru())
        .with_rights(d1.key(), AccessRights::deny_all())
        .raw();
    let mut cmd = HostCommand::WritePkru { value: locked }.encode();
    ctx.host_mut().entropy_request(&mut cmd).unwrap();

    assert!(matches!(
        write_byte(&mut ctx, buf),
        Err(HalError::ProtectionFault { write: true, .. })
    ));
    assert_eq!(writer.call(&mut ctx, buf), Ok(Ok(())));
    assert!(read_byte(&mut ctx, buf).is_err());
    assert_eq!(ctx.host().pkru(), locked);
}

#[test]
fn test_nested_gates_restore_in_order() {
    fn inner(ctx: &mut Dilm<EmulatedHost>, _: ()) -> (DomainId, usize) {
        (ctx.current_domain(), ctx.switch_depth())
    }

    fn outer(ctx: &mut Dilm<EmulatedHost>, slot: i32) -> (DomainId, (DomainId, usize), DomainId) {
        let here = ctx.current_domain();
        let depth = abi::switch(ctx, slot);
        let seen = inner(ctx, ());
        let restored = abi::restore(ctx, i32::from(here.0));
        assert_eq!((depth, restored), (2, 0));
        (here, seen, ctx.current_domain())
    }

    let mut ctx = context();
    let d1 = ctx.create_domain(0).unwrap();
    let d2 = ctx.create_domain(0).unwrap();
    let inner_slot = abi::register_call(&mut ctx, i32::from(d2.0), EntryPoint::new(0x2000));
    let gate = ctx.register_call(d1, outer).unwrap();

    let pkru_before = ctx.host().pkru();
    let (here, (seen, depth), after) = gate.call(&mut ctx, inner_slot).unwrap();
    assert_eq!(here, d1);
    assert_eq!((seen, depth), (d2, 2));
    assert_eq!(after, d1);
    assert_eq!(ctx.host().pkru(), pkru_before);
    assert_eq!(ctx.switch_depth(), 0);
}

#[test]
fn test_free_domain_requires_clean_state() {
    let mut ctx = context();
    let d = ctx.create_domain(0).unwrap();
    let id = ctx.register_entry(d, EntryPoint::new(0x10)).unwrap();
    let buf = alloc_in(&mut ctx, d, 100);

    assert_eq!(
        ctx.free_domain(d),
        Err(DilmError::DomainInUse { gates: 1, ranges: 1 })
    );

    ctx.unregister_call(id).unwrap();
    assert_eq!(
        ctx.free_domain(d),
        Err(DilmError::DomainInUse { gates: 0, ranges: 1 })
    );

    ctx.hook_free(buf).unwrap();
    assert_eq!(ctx.free_domain(d), Ok(()));
    assert_eq!(ctx.free_domain(d), Err(DilmError::InvalidDomain));
    assert_eq!(ctx.free_domain(ROOT_DOMAIN), Err(DilmError::InvalidDomain));
}

#[test]
fn test_freed_block_does_not_leak_to_next_domain() {
    let mut ctx = context();
    let d1 = ctx.create_domain(0).unwrap();
    let d2 = ctx.create_domain(0).unwrap();
    ctx.assign_permissions(d1, 0).unwrap();
    ctx.assign_permissions(d2, 0).unwrap();

    let a = alloc_in(&mut ctx, d1, 4096);
    let writer = ctx.register_call(d1, write_secret).unwrap();
    assert_eq!(writer.call(&mut ctx, a), Ok(Ok(())));
    ctx.hook_free(a).unwrap();
    assert_eq!(ctx.host().key_of(a), Some(0));

    let b = alloc_in(&mut ctx, d2, 4096);
    assert_eq!(b, a);
    assert_eq!(ctx.host().key_of(b), Some(d2.0));
    assert_eq!(ctx.registry().range(b).map(|r| r.owner), Some(d2));
    assert_eq!(ctx.host().load(b, 6), Ok(&[0u8; 6][..]));
}

#[test]
fn test_domain_cannot_free_another_domains_block() {
    let mut ctx = context();
    let d1 = ctx.create_domain(0).unwrap();
    let d2 = ctx.create_domain(0).unwrap();
    ctx.assign_permissions(d1, 0).unwrap();
    ctx.assign_permissions(d2, 0).unwrap();

    let victim = alloc_in(&mut ctx, d1, 4096);
    let writer = ctx.register_call(d1, write_secret).unwrap();
    assert_eq!(writer.call(&mut ctx, victim), Ok(Ok(())));
    ctx.assign_permissions(d1, PKEY_DISABLE_ACCESS | PKEY_DISABLE_WRITE).unwrap();

    let thief = ctx.register_call(d2, free_then_alloc).unwrap();
    let (freed, fresh) = thief.call(&mut ctx, victim).unwrap();
    assert_eq!(freed, Err(DilmError::InvalidPointer(victim)));

    let fresh = fresh.unwrap();
    assert_ne!(fresh, victim);
    assert_eq!(ctx.host().key_of(victim), Some(d1.0));
    assert_eq!(ctx.allocation(victim).map(|b| b.owner), Some(d1));
    assert!(read_byte(&mut ctx, victim).is_err());
    assert_eq!(read_byte(&mut ctx, fresh), Ok(0));
}

#[test]
fn test_teardown_releases_everything() {
    let mut ctx = context();
    let d1 = ctx.create_domain(0).unwrap();
    let d2 = ctx.create_domain(0).unwrap();
    alloc_in(&mut ctx, d1, 10);
    alloc_in(&mut ctx, d2, 10);
    ctx.register_entry(d1, EntryPoint::new(1)).unwrap();
    ctx.register_entry(d2, EntryPoint::new(2)).unwrap();

    ctx.teardown().unwrap();

    assert_eq!(ctx.registry().domains().collect::<Vec<_>>(), vec![ROOT_DOMAIN]);
    assert!(ctx.gates().is_empty());
    assert_eq!(ctx.host().allocated_key_count(), 1);
    assert!(ctx.check_invariants().is_empty());
}

fn whoami(ctx: &mut Dilm<EmulatedHost>, _: ()) -> DomainId {
    ctx.current_domain()
}

#[test]
fn test_audit_trail_records_transitions() {
    let mut ctx = context();
    let d = ctx.create_domain(0).unwrap();
    let gate = ctx.register_call(d, whoami).unwrap();
    gate.call(&mut ctx, ()).unwrap();

    let kinds: Vec<_> = ctx.audit().events().iter().map(|e| e.kind.clone()).collect();
    assert_eq!(kinds[0], AuditKind::DomainCreated { domain: d });
    assert_eq!(
        kinds[1],
        AuditKind::GateRegistered {
            slot: 0,
            domain: d
        }
    );
    assert!(matches!(
        kinds[2],
        AuditKind::Switch { from, to, .. } if from == ROOT_DOMAIN && to == d
    ));
    assert!(matches!(
        kinds[3],
        AuditKind::Restore { from, to, .. } if from == d && to == ROOT_DOMAIN
    ));
    assert_eq!(ctx.audit().events()[2].active, d);
    assert_eq!(ctx.audit().events()[3].active, ROOT_DOMAIN);
    assert!(ctx.audit().to_json().unwrap().contains("GateRegistered"));
}

// ============================================================================
// Host failures
// ============================================================================

#[test]
fn test_unintercepted_entropy_is_host_failure() {
    init_tracing();
    // The real entropy source never echoes an opcode.
    let mut ctx = Dilm::new(dilm_kernel::EntropyHost::new());
    assert!(matches!(
        ctx.create_domain(0),
        Err(DilmError::HostCommandFailed(_))
    ));
    assert_eq!(ctx.registry().len(), 1);
}

#[test]
fn test_transport_failure_mid_switch() {
    let mut ctx = context();
    let d = ctx.create_domain(0).unwrap();
    let id = ctx.register_entry(d, EntryPoint::new(1)).unwrap();

    ctx.host_mut().fail_next_transport();
    assert_eq!(
        ctx.switch(id),
        Err(DilmError::HostCommandFailed(HostFailure::Transport))
    );
    assert_eq!(ctx.current_domain(), ROOT_DOMAIN);
    assert_eq!(ctx.switch_depth(), 0);
    assert!(ctx
        .audit()
        .events()
        .iter()
        .any(|e| matches!(e.kind, AuditKind::HostCommandFailed { status: None, .. })));
}

#[test]
fn test_uninitialised_register_reads_default_deny() {
    let mut ctx = context();
    assert_eq!(ctx.host().pkru(), 0);
    assert_eq!(ctx.read_pkru().unwrap().raw(), DEFAULT_DENY_PKRU);

    ctx.initialize_register().unwrap();
    assert_eq!(ctx.host().pkru(), DEFAULT_DENY_PKRU);

    let d = ctx.create_domain(0).unwrap();
    ctx.assign_permissions(d, PKEY_DISABLE_ACCESS).unwrap();
    assert!(ctx.read_pkru().unwrap().is_key_loaded(d.key()));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn created_domains_are_distinct_and_non_root(
        limit in 2u8..=16,
        backpressure in 0u32..3,
        count in 0usize..20,
    ) {
        let host = EmulatedHost::new()
            .with_key_limit(limit)
            .with_backpressure(backpressure);
        let mut ctx = Dilm::new(host);
        let mut seen = HashSet::new();

        for _ in 0..count {
            match ctx.create_domain(0) {
                Ok(d) => {
                    prop_assert!(!d.is_root());
                    prop_assert!(seen.insert(d));
                }
                Err(e) => prop_assert_eq!(e, DilmError::OutOfKeys),
            }
        }
        prop_assert!(seen.len() < usize::from(limit));
    }

    #[test]
    fn assign_to_missing_domain_never_touches_register(raw in 1u8..=255, rights in 0u32..8) {
        let mut ctx = Dilm::new(EmulatedHost::new());
        let existing = ctx.create_domain(0).unwrap();
        prop_assume!(DomainId(raw) != existing);

        let pkru = ctx.host().pkru();
        let serviced = ctx.host().commands_serviced();
        prop_assert_eq!(
            ctx.assign_permissions(DomainId(raw), rights),
            Err(DilmError::InvalidDomain)
        );
        prop_assert_eq!(ctx.host().pkru(), pkru);
        prop_assert_eq!(ctx.host().commands_serviced(), serviced);
    }

    #[test]
    fn switch_restore_preserves_other_fields(rights in 0u32..4, other_rights in 0u32..4) {
        let mut ctx = Dilm::new(EmulatedHost::new());
        let a = ctx.create_domain(0).unwrap();
        let b = ctx.create_domain(0).unwrap();
        ctx.assign_permissions(a, rights).unwrap();
        ctx.assign_permissions(b, other_rights).unwrap();
        let id = ctx.register_entry(a, EntryPoint::new(1)).unwrap();

        let before = Pkru::from_raw(ctx.host().pkru());
        let ticket = ctx.switch(id).unwrap();
        let during = Pkru::from_raw(ctx.host().pkru());
        prop_assert_eq!(during.rights(a.key()), AccessRights::from_bits(rights).unwrap());
        for k in (0..16u8).filter(|&k| k != a.0) {
            let key = dilm_kernel::KeyId(k);
            prop_assert_eq!(during.field(key), before.field(key));
        }

        ctx.restore(ticket).unwrap();
        prop_assert_eq!(ctx.host().pkru(), before.raw());
    }
}
