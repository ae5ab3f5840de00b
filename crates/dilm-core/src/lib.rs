//! DILM Core - Pure Domain State for Domain-Isolated Linear Memory
//!
//! This crate holds the **HAL-free** state behind protection domains: which
//! keys are in use, what each domain may do, which entry points may be called
//! across a domain boundary, and which memory ranges are tagged with which key.
//! Nothing here talks to the host; `dilm-kernel` drives the host and keeps this
//! state in step with it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        dilm-core                            │
//! │                    (Pure domain state)                      │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │DomainRegistry │    │ CallGateTable │                    │
//! │   │  - keys[16]   │◀───│  - 64 slots   │                    │
//! │   │  - ranges     │    │  - CallId     │                    │
//! │   └───────────────┘    └───────────────┘                    │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │  Pkru codec   │    │  Invariants   │                    │
//! │   │ masked update │    │  Assertions   │                    │
//! │   └───────────────┘    └───────────────┘                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       dilm-kernel                           │
//! │                    (Runtime wrapper)                        │
//! │                                                             │
//! │   - Host command round trips                                │
//! │   - Protection switch protocol                              │
//! │   - Allocator hook, audit log                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Properties (Verification Targets)
//!
//! 1. **No Rights Escalation**: a register update only touches the target
//!    key's two bits
//! 2. **No Forged Gate**: a `CallId` can only come from `CallGateTable::register`
//! 3. **Fail Closed**: unknown domains, stale or foreign call ids always error
//!
//! # Module Organization
//!
//! - `types` - Handles (DomainId, KeyId, EntryPoint, ProtectedRange)
//! - `pkru` - Permission bitset codec for the key control register
//! - `registry` - Domain & key registry, protected range table
//! - `gate` - Call gate table and `CallId` tokens
//! - `error` - `DilmError` and errno mapping
//! - `invariants` - Runtime-checkable invariants

#![no_std]
extern crate alloc;

pub mod error;
pub mod gate;
pub mod invariants;
pub mod pkru;
pub mod registry;
pub mod types;

pub use error::{errno, DilmError, HostFailure};
pub use gate::{CallGateEntry, CallGateTable, CallId, MAX_GATE_SLOTS};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use pkru::{
    AccessRights, Pkru, DEFAULT_DENY_PKRU, MAX_KEYS, PKEY_ACCESS_MASK, PKEY_DISABLE_ACCESS,
    PKEY_DISABLE_WRITE,
};
pub use registry::{DomainRegistry, ProtectionKey};
pub use types::{DomainId, EntryPoint, KeyId, ProtectedRange, ROOT_DOMAIN};
