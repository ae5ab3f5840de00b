//! Host Command Protocol for Domain-Isolated Linear Memory
//!
//! The guest cannot execute protection-key instructions itself. It encodes a
//! fixed 12-byte command, hands the buffer to the host through an entropy
//! request, and reads the host's reply from the same buffer.
//!
//! This crate is the **single source of truth** for the wire layout:
//! - **Opcodes** (`opcode` module)
//! - **Typed commands and replies** (`HostCommand`, `HostResponse`)
//!
//! # Buffer Layout
//!
//! All multi-byte fields are big-endian.
//!
//! | Offset | Field                                   | Used by                  |
//! |--------|-----------------------------------------|--------------------------|
//! | 0-1    | Opcode                                  | all                      |
//! | 2-5    | Address                                 | protect, mmap            |
//! | 6-9    | Length                                  | protect, mmap            |
//! | 10     | Protection flags / creation kind        | protect, mmap, create    |
//! | 11     | Key id / flags                          | protect, create, free, mmap |
//! | 3-6    | Register value (byte 2 reserved)        | read/write register      |
//!
//! # Opcode Allocation
//!
//! | Opcode  | Operation                |
//! |---------|--------------------------|
//! | `01 2B` | Map memory               |
//! | `01 49` | Protect range with key   |
//! | `01 4A` | Create domain (key)      |
//! | `01 4B` | Free domain (key)        |
//! | `0F EE` | Read key register        |
//! | `0F EF` | Write key register       |
//! | `FF FF` | Host rejection (reply)   |
//!
//! # Usage
//!
//! ```rust
//! use dilm_ipc::{HostCommand, Opcode};
//!
//! let cmd = HostCommand::Protect { addr: 0x1000, len: 0x2000, prot: 3, key: 3 };
//! let buf = cmd.encode();
//! assert_eq!(&buf[0..2], &Opcode::Protect.bytes());
//! assert_eq!(HostCommand::decode(&buf), Ok(cmd));
//! ```

#![no_std]

mod command;

pub use command::{CodecError, HostCommand, HostResponse, Opcode};

/// Size of every host command buffer in bytes.
pub const COMMAND_LEN: usize = 12;

/// A host command buffer.
pub type CommandBuffer = [u8; COMMAND_LEN];

/// Number of protection keys the hardware provides.
pub const MAX_KEYS: u8 = 16;

// =============================================================================
// Opcodes
// =============================================================================

/// Opcode byte pairs (bytes 0-1 of the buffer).
pub mod opcode {
    /// Map a fresh region of linear memory
    pub const OP_MMAP: [u8; 2] = [0x01, 0x2B];
    /// Tag an address range with a protection key
    pub const OP_PROTECT: [u8; 2] = [0x01, 0x49];
    /// Allocate a fresh protection key for a new domain
    pub const OP_CREATE_DOMAIN: [u8; 2] = [0x01, 0x4A];
    /// Release a protection key
    pub const OP_FREE_DOMAIN: [u8; 2] = [0x01, 0x4B];
    /// Read the protection-key control register
    pub const OP_READ_PKRU: [u8; 2] = [0x0F, 0xEE];
    /// Write the protection-key control register
    pub const OP_WRITE_PKRU: [u8; 2] = [0x0F, 0xEF];
    /// Reply marker: the host refused the command, status at byte 2
    pub const OP_REJECTED: [u8; 2] = [0xFF, 0xFF];
}

// =============================================================================
// Field offsets and constants
// =============================================================================

/// Byte offsets inside the command buffer.
pub mod layout {
    /// Start of the big-endian address field
    pub const ADDR: usize = 2;
    /// Start of the big-endian length field
    pub const LEN: usize = 6;
    /// Protection flags or domain-creation kind
    pub const PROT: usize = 10;
    /// Key id or flags
    pub const KEY: usize = 11;
    /// Reserved byte preceding the register value
    pub const PKRU_RESERVED: usize = 2;
    /// Start of the big-endian register value
    pub const PKRU: usize = 3;
    /// Key id in a create-domain reply
    pub const CREATED_KEY: usize = 2;
    /// Status byte in a rejection reply
    pub const STATUS: usize = 2;
}

/// Protection flag values carried in byte 10 of protect and mmap commands.
pub mod prot {
    /// No access
    pub const PROT_NONE: u8 = 0x0;
    /// Readable
    pub const PROT_READ: u8 = 0x1;
    /// Writable
    pub const PROT_WRITE: u8 = 0x2;
    /// Readable and writable
    pub const PROT_READ_WRITE: u8 = PROT_READ | PROT_WRITE;
}

/// Domain-creation kind in byte 10: allocate a fresh hardware key.
pub const CREATE_KIND_FRESH_KEY: u8 = 0x00;

/// Status codes a host places in byte 2 of a rejection reply.
pub mod status {
    /// Out of memory for a mapping
    pub const STATUS_NO_MEMORY: u8 = 12;
    /// Malformed command, unknown key or misaligned range
    pub const STATUS_INVALID: u8 = 22;
}
