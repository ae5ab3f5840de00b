//! Host Abstraction Layer for Domain-Isolated Linear Memory
//!
//! The guest reaches the privileged host through exactly one primitive: an
//! entropy request. A host that understands the command protocol intercepts
//! 12-byte requests carrying a known opcode and overwrites them with a reply;
//! every other request is answered with ordinary random bytes.
//!
//! # Implementations
//!
//! - [`EntropyHost`]: production transport. Calls `getrandom`, which on WASI is
//!   the `random_get` import the host intercepts.
//! - [`EmulatedHost`]: in-process host that services the protocol against an
//!   emulated key register, key allocator and tagged linear memory. Used by
//!   tests and by platforms without hardware protection keys.

#![no_std]

extern crate alloc;

mod emulated;

use core::fmt;

pub use emulated::{EmulatedHost, EMULATED_PAGE_SIZE, MAP_BASE};

/// Host transport used by the DILM runtime.
///
/// All methods take `&mut self`: a context drives its host from a single
/// logical thread.
pub trait Host {
    /// Submit `buf` through the entropy side channel.
    ///
    /// On return the buffer holds whatever the host wrote into it: a protocol
    /// reply if the request was intercepted, random bytes otherwise.
    ///
    /// # Returns
    /// * `Ok(())` - The request completed
    /// * `Err(HalError::EntropyUnavailable)` - The primitive itself failed
    fn entropy_request(&mut self, buf: &mut [u8]) -> Result<(), HalError>;

    /// Monotonic time in nanoseconds, used to timestamp audit events.
    fn now_nanos(&self) -> u64 {
        0
    }

    /// Zero `[addr, addr + len)` of linear memory with host privilege.
    ///
    /// Hosts that cannot reach guest memory return `Unsupported`; freed
    /// blocks are then never handed out again.
    fn scrub(&mut self, addr: u32, len: u32) -> Result<(), HalError> {
        let _ = (addr, len);
        Err(HalError::Unsupported)
    }
}

/// Production host transport backed by the platform entropy source.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntropyHost;

impl EntropyHost {
    pub fn new() -> Self {
        Self
    }
}

impl Host for EntropyHost {
    fn entropy_request(&mut self, buf: &mut [u8]) -> Result<(), HalError> {
        getrandom::getrandom(buf).map_err(|_| HalError::EntropyUnavailable)
    }
}

/// Host errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// The entropy primitive failed (transport failure)
    EntropyUnavailable,
    /// A guest memory access violated the active key permissions
    ProtectionFault { addr: u32, key: u8, write: bool },
    /// A guest memory access fell outside linear memory
    OutOfBounds { addr: u32, len: u32 },
    /// The host does not provide this operation
    Unsupported,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::EntropyUnavailable => write!(f, "entropy request failed"),
            HalError::ProtectionFault { addr, key, write } => write!(
                f,
                "protection fault: {} at {:#x} (key {})",
                if *write { "write" } else { "read" },
                addr,
                key
            ),
            HalError::OutOfBounds { addr, len } => {
                write!(f, "access {:#x}+{} outside linear memory", addr, len)
            }
            HalError::Unsupported => write!(f, "operation not supported by host"),
        }
    }
}
