//! Domain-Isolated Linear Memory Runtime
//!
//! This crate implements the runtime side of DILM on top of `dilm-core`:
//! - Domain lifecycle (create, free, assign permissions)
//! - Call gate registration and typed gates
//! - The protection switch protocol (switch / restore)
//! - Allocator hook that tags per-domain memory
//! - Integer guest ABI with errno return codes
//! - Audit trail of every domain transition
//!
//! All state lives in one owned context, [`Dilm`], parameterised by the host
//! transport. Nothing here is global.
//!
//! # Example
//!
//! ```rust
//! use dilm_kernel::{Dilm, EmulatedHost, PKEY_DISABLE_WRITE};
//!
//! fn bump(ctx: &mut Dilm<EmulatedHost>, addr: u32) -> bool {
//!     ctx.host_mut().store(addr, &[1]).is_ok()
//! }
//!
//! let mut ctx = Dilm::new(EmulatedHost::new());
//! let d1 = ctx.create_domain(0).unwrap();
//! ctx.assign_permissions(d1, PKEY_DISABLE_WRITE).unwrap();
//!
//! let gate = ctx.register_call(d1, bump).unwrap();
//! let stored = gate.call(&mut ctx, 0x100).unwrap();
//! assert!(stored); // root memory is unaffected by D1's rights
//! ```

#![no_std]
extern crate alloc;

pub mod abi;
mod alloc_hook;
mod audit;
mod config;
mod context;
mod domain;
mod gate;
mod host;
mod switch;

pub use alloc_hook::Block;
pub use audit::{AuditEvent, AuditKind, AuditLog, EventId};
pub use config::{ConfigError, DilmConfig};
pub use context::Dilm;
pub use gate::{Gate, GateFn};
pub use switch::SwitchTicket;

// Re-export core types
pub use dilm_core::{
    check_all_invariants, errno, AccessRights, CallGateEntry, CallId, DilmError, DomainId,
    DomainRegistry, EntryPoint, HostFailure, InvariantViolation, KeyId, Pkru, ProtectedRange,
    DEFAULT_DENY_PKRU, MAX_GATE_SLOTS, MAX_KEYS, PKEY_DISABLE_ACCESS, PKEY_DISABLE_WRITE,
    ROOT_DOMAIN,
};

// Re-export host types
pub use dilm_hal::{EmulatedHost, EntropyHost, HalError, Host};
