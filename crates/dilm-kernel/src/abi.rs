//! Integer guest ABI
//!
//! Thin wrappers for guests that speak plain integers: a non-negative return
//! is success (a domain id, a slot, or 0), a negative return is `-errno`.
//!
//! | Function             | Success value   |
//! |----------------------|-----------------|
//! | `create_domain`      | domain id       |
//! | `free_domain`        | 0               |
//! | `assign_permissions` | 0               |
//! | `register_call`      | gate slot       |
//! | `unregister_call`    | 0               |
//! | `switch`             | nesting depth   |
//! | `restore`            | 0               |
//! | `current_domain`     | domain id       |

use dilm_core::{errno, DilmError, DomainId, EntryPoint};
use dilm_hal::Host;

use crate::context::Dilm;

fn status(result: Result<(), DilmError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => -e.errno(),
    }
}

fn domain_arg(raw: i32) -> Result<DomainId, DilmError> {
    DomainId::from_raw(raw).ok_or(DilmError::InvalidDomain)
}

fn slot_arg(raw: i32) -> Result<usize, DilmError> {
    usize::try_from(raw).map_err(|_| DilmError::InvalidCallId)
}

pub fn create_domain<H: Host>(ctx: &mut Dilm<H>, flags: u32) -> i32 {
    match ctx.create_domain(flags) {
        Ok(d) => i32::from(d.0),
        Err(e) => -e.errno(),
    }
}

pub fn free_domain<H: Host>(ctx: &mut Dilm<H>, domain: i32) -> i32 {
    status(domain_arg(domain).and_then(|d| ctx.free_domain(d)))
}

/// `key` must be the domain's own key; `flags` is reserved and must be 0.
pub fn assign_permissions<H: Host>(
    ctx: &mut Dilm<H>,
    domain: i32,
    key: i32,
    flags: u32,
    access_rights: u32,
) -> i32 {
    if flags != 0 {
        return -errno::EINVAL;
    }
    status(domain_arg(domain).and_then(|d| {
        if i32::from(d.key().0) != key {
            return Err(DilmError::InvalidArgument);
        }
        ctx.assign_permissions(d, access_rights)
    }))
}

pub fn register_call<H: Host>(ctx: &mut Dilm<H>, domain: i32, entry: EntryPoint) -> i32 {
    match domain_arg(domain).and_then(|d| ctx.register_entry(d, entry)) {
        Ok(id) => i32::from(id.slot()),
        Err(e) => -e.errno(),
    }
}

pub fn unregister_call<H: Host>(ctx: &mut Dilm<H>, call_id: i32) -> i32 {
    status(
        slot_arg(call_id)
            .and_then(|slot| ctx.gates.resolve_slot(slot))
            .and_then(|id| ctx.unregister_call(id)),
    )
}

/// Enter the domain of gate `call_id`. Pair with [`restore`].
pub fn switch<H: Host>(ctx: &mut Dilm<H>, call_id: i32) -> i32 {
    let result = slot_arg(call_id)
        .and_then(|slot| ctx.gates.resolve_slot(slot))
        .and_then(|id| ctx.switch(id));
    match result {
        // The frame stays on the context; `restore` pops it by caller.
        Ok(ticket) => ticket.depth() as i32,
        Err(e) => -e.errno(),
    }
}

/// Leave the innermost switch, which must have been entered from `caller`.
pub fn restore<H: Host>(ctx: &mut Dilm<H>, caller: i32) -> i32 {
    status(domain_arg(caller).and_then(|d| ctx.restore_to(d)))
}

pub fn current_domain<H: Host>(ctx: &Dilm<H>) -> i32 {
    i32::from(ctx.current_domain().0)
}
