//! DILM error types and errno mapping

use core::fmt;

/// POSIX errno values used at the integer ABI boundary.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const EHOSTDOWN: i32 = 112;
}

/// Why a host command round trip failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostFailure {
    /// The entropy primitive itself failed
    Transport,
    /// The reply could not be decoded (wrong opcode echo, untouched buffer)
    Malformed,
    /// The host refused the command with a status code
    Rejected(u8),
    /// The reply decoded but contradicts the request or local state
    Inconsistent,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFailure::Transport => write!(f, "transport failure"),
            HostFailure::Malformed => write!(f, "malformed reply"),
            HostFailure::Rejected(status) => write!(f, "rejected with status {}", status),
            HostFailure::Inconsistent => write!(f, "inconsistent reply"),
        }
    }
}

/// Errors from domain, gate and switch operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DilmError {
    /// Domain does not exist, or the operation is not allowed on the root domain
    InvalidDomain,
    /// Call id is out of range, cleared, stale or from another table
    InvalidCallId,
    /// Access rights carry bits other than disable-access / disable-write
    InvalidAccessRights(u32),
    /// Flags carry bits the protocol cannot represent
    InvalidFlags(u32),
    /// Argument out of range (zero-size allocation, key mismatch)
    InvalidArgument,
    /// Address was not handed out by the allocator hook
    InvalidPointer(u32),
    /// Every call gate slot is taken
    TableFull,
    /// The host could not supply a protection key
    OutOfKeys,
    /// A host command round trip failed
    HostCommandFailed(HostFailure),
    /// Domain still has live gates or protected ranges
    DomainInUse { gates: usize, ranges: usize },
    /// Gate is part of an active switch
    GateBusy,
    /// Restore does not match the innermost active switch
    UnbalancedRestore,
    /// Too many nested switches
    SwitchDepthExceeded,
}

impl DilmError {
    /// Positive errno for this error; the ABI returns its negation.
    pub fn errno(&self) -> i32 {
        match self {
            DilmError::InvalidDomain
            | DilmError::InvalidCallId
            | DilmError::InvalidAccessRights(_)
            | DilmError::InvalidFlags(_)
            | DilmError::InvalidArgument => errno::EINVAL,
            DilmError::InvalidPointer(_) => errno::EFAULT,
            DilmError::TableFull => errno::EACCES,
            DilmError::OutOfKeys => errno::ENOSPC,
            DilmError::HostCommandFailed(_) => errno::EHOSTDOWN,
            DilmError::DomainInUse { .. } | DilmError::GateBusy => errno::EBUSY,
            DilmError::UnbalancedRestore | DilmError::SwitchDepthExceeded => errno::EPERM,
        }
    }
}

impl fmt::Display for DilmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DilmError::InvalidDomain => write!(f, "invalid domain"),
            DilmError::InvalidCallId => write!(f, "invalid call id"),
            DilmError::InvalidAccessRights(bits) => {
                write!(f, "invalid access rights {:#x}", bits)
            }
            DilmError::InvalidFlags(flags) => write!(f, "invalid flags {:#x}", flags),
            DilmError::InvalidArgument => write!(f, "invalid argument"),
            DilmError::InvalidPointer(addr) => write!(f, "unknown allocation {:#x}", addr),
            DilmError::TableFull => write!(f, "call gate table full"),
            DilmError::OutOfKeys => write!(f, "no protection key available"),
            DilmError::HostCommandFailed(why) => write!(f, "host command failed: {}", why),
            DilmError::DomainInUse { gates, ranges } => write!(
                f,
                "domain in use ({} gates, {} protected ranges)",
                gates, ranges
            ),
            DilmError::GateBusy => write!(f, "call gate is active"),
            DilmError::UnbalancedRestore => write!(f, "restore does not match active switch"),
            DilmError::SwitchDepthExceeded => write!(f, "switch nesting too deep"),
        }
    }
}
