//! Typed host commands and replies.
//!
//! `encode` and `decode` are exact inverses over the 12-byte layout. Reserved
//! bytes must be zero; anything else is rejected rather than guessed at.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::layout::{ADDR, CREATED_KEY, KEY, LEN, PKRU, PKRU_RESERVED, PROT, STATUS};
use crate::opcode::*;
use crate::{CommandBuffer, COMMAND_LEN, CREATE_KIND_FRESH_KEY};

/// Host operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Mmap,
    Protect,
    CreateDomain,
    FreeDomain,
    ReadPkru,
    WritePkru,
}

impl Opcode {
    /// Wire representation (bytes 0-1).
    pub fn bytes(self) -> [u8; 2] {
        match self {
            Opcode::Mmap => OP_MMAP,
            Opcode::Protect => OP_PROTECT,
            Opcode::CreateDomain => OP_CREATE_DOMAIN,
            Opcode::FreeDomain => OP_FREE_DOMAIN,
            Opcode::ReadPkru => OP_READ_PKRU,
            Opcode::WritePkru => OP_WRITE_PKRU,
        }
    }

    /// Parse an opcode from its wire representation.
    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        match bytes {
            OP_MMAP => Some(Opcode::Mmap),
            OP_PROTECT => Some(Opcode::Protect),
            OP_CREATE_DOMAIN => Some(Opcode::CreateDomain),
            OP_FREE_DOMAIN => Some(Opcode::FreeDomain),
            OP_READ_PKRU => Some(Opcode::ReadPkru),
            OP_WRITE_PKRU => Some(Opcode::WritePkru),
            _ => None,
        }
    }

    /// Returns true if the buffer starts with this opcode.
    pub fn matches(self, buf: &[u8]) -> bool {
        buf.len() >= 2 && buf[0..2] == self.bytes()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [hi, lo] = self.bytes();
        write!(f, "{:?}({:02X} {:02X})", self, hi, lo)
    }
}

/// Wire codec errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes 0-1 are not a known opcode
    UnknownOpcode([u8; 2]),
    /// The reply did not echo the opcode of the request
    UnexpectedOpcode { expected: Opcode, found: [u8; 2] },
    /// A reserved byte was not zero
    ReservedByteSet { offset: usize },
    /// Byte 10 of a create-domain command is not a known creation kind
    UnknownCreateKind(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownOpcode([hi, lo]) => {
                write!(f, "unknown opcode {:02X} {:02X}", hi, lo)
            }
            CodecError::UnexpectedOpcode { expected, found } => write!(
                f,
                "reply opcode {:02X} {:02X} does not match request {}",
                found[0], found[1], expected
            ),
            CodecError::ReservedByteSet { offset } => {
                write!(f, "reserved byte {} is not zero", offset)
            }
            CodecError::UnknownCreateKind(kind) => {
                write!(f, "unknown domain creation kind {:#04x}", kind)
            }
        }
    }
}

/// A command sent from the guest to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostCommand {
    /// Map `len` bytes of fresh linear memory (`addr` is a hint, 0 = anywhere)
    Mmap { addr: u32, len: u32, prot: u8, flags: u8 },
    /// Tag `[addr, addr + len)` with protection key `key`
    Protect { addr: u32, len: u32, prot: u8, key: u8 },
    /// Allocate a fresh key for a new domain
    CreateDomain { flags: u8 },
    /// Release key `key`
    FreeDomain { key: u8 },
    /// Read the key control register
    ReadPkru,
    /// Overwrite the key control register
    WritePkru { value: u32 },
}

impl HostCommand {
    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            HostCommand::Mmap { .. } => Opcode::Mmap,
            HostCommand::Protect { .. } => Opcode::Protect,
            HostCommand::CreateDomain { .. } => Opcode::CreateDomain,
            HostCommand::FreeDomain { .. } => Opcode::FreeDomain,
            HostCommand::ReadPkru => Opcode::ReadPkru,
            HostCommand::WritePkru { .. } => Opcode::WritePkru,
        }
    }

    /// Encode into a fresh command buffer.
    pub fn encode(&self) -> CommandBuffer {
        let mut buf = [0u8; COMMAND_LEN];
        buf[0..2].copy_from_slice(&self.opcode().bytes());

        match *self {
            HostCommand::Mmap {
                addr,
                len,
                prot,
                flags,
            } => put_region(&mut buf, addr, len, prot, flags),
            HostCommand::Protect {
                addr,
                len,
                prot,
                key,
            } => put_region(&mut buf, addr, len, prot, key),
            HostCommand::CreateDomain { flags } => {
                buf[PROT] = CREATE_KIND_FRESH_KEY;
                buf[KEY] = flags;
            }
            HostCommand::FreeDomain { key } => buf[KEY] = key,
            HostCommand::ReadPkru => {}
            HostCommand::WritePkru { value } => put_u32(&mut buf, PKRU, value),
        }

        buf
    }

    /// Decode a command buffer (host side).
    pub fn decode(buf: &CommandBuffer) -> Result<Self, CodecError> {
        let op = read_opcode(buf)?;

        match op {
            Opcode::Mmap => Ok(HostCommand::Mmap {
                addr: get_u32(buf, ADDR),
                len: get_u32(buf, LEN),
                prot: buf[PROT],
                flags: buf[KEY],
            }),
            Opcode::Protect => Ok(HostCommand::Protect {
                addr: get_u32(buf, ADDR),
                len: get_u32(buf, LEN),
                prot: buf[PROT],
                key: buf[KEY],
            }),
            Opcode::CreateDomain => {
                require_zero(buf, ADDR..PROT)?;
                if buf[PROT] != CREATE_KIND_FRESH_KEY {
                    return Err(CodecError::UnknownCreateKind(buf[PROT]));
                }
                Ok(HostCommand::CreateDomain { flags: buf[KEY] })
            }
            Opcode::FreeDomain => {
                require_zero(buf, ADDR..KEY)?;
                Ok(HostCommand::FreeDomain { key: buf[KEY] })
            }
            Opcode::ReadPkru => {
                require_zero(buf, ADDR..COMMAND_LEN)?;
                Ok(HostCommand::ReadPkru)
            }
            Opcode::WritePkru => {
                require_zero(buf, PKRU_RESERVED..PKRU)?;
                require_zero(buf, PKRU + 4..COMMAND_LEN)?;
                Ok(HostCommand::WritePkru {
                    value: get_u32(buf, PKRU),
                })
            }
        }
    }
}

/// A reply written by the host over the command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostResponse {
    /// Memory was mapped at `addr`
    Mapped { addr: u32, len: u32 },
    /// Echo of a protect command
    Protected { addr: u32, len: u32, prot: u8, key: u8 },
    /// A key was allocated (a value >= 16 signals exhaustion)
    DomainCreated { key: u8 },
    /// Echo of a free-domain command
    DomainFreed { key: u8 },
    /// Current register value
    Pkru { value: u32 },
    /// Echo of a register write
    PkruWritten { value: u32 },
    /// The host refused the command
    Rejected { status: u8 },
}

impl HostResponse {
    /// Encode a reply for a command with opcode `op` (host side).
    ///
    /// A `Rejected` reply replaces the opcode with the rejection marker.
    pub fn encode(&self, op: Opcode) -> CommandBuffer {
        let mut buf = [0u8; COMMAND_LEN];
        buf[0..2].copy_from_slice(&op.bytes());

        match *self {
            HostResponse::Mapped { addr, len } => {
                put_u32(&mut buf, ADDR, addr);
                put_u32(&mut buf, LEN, len);
            }
            HostResponse::Protected {
                addr,
                len,
                prot,
                key,
            } => put_region(&mut buf, addr, len, prot, key),
            HostResponse::DomainCreated { key } => buf[CREATED_KEY] = key,
            HostResponse::DomainFreed { key } => buf[KEY] = key,
            HostResponse::Pkru { value } | HostResponse::PkruWritten { value } => {
                put_u32(&mut buf, PKRU, value)
            }
            HostResponse::Rejected { status } => {
                buf[0..2].copy_from_slice(&OP_REJECTED);
                buf[STATUS] = status;
            }
        }

        buf
    }

    /// Decode the host's reply to a command with opcode `expected`.
    pub fn decode(expected: Opcode, buf: &CommandBuffer) -> Result<Self, CodecError> {
        let found = [buf[0], buf[1]];
        if found == OP_REJECTED {
            return Ok(HostResponse::Rejected {
                status: buf[STATUS],
            });
        }
        if found != expected.bytes() {
            return Err(CodecError::UnexpectedOpcode { expected, found });
        }

        Ok(match expected {
            Opcode::Mmap => HostResponse::Mapped {
                addr: get_u32(buf, ADDR),
                len: get_u32(buf, LEN),
            },
            Opcode::Protect => HostResponse::Protected {
                addr: get_u32(buf, ADDR),
                len: get_u32(buf, LEN),
                prot: buf[PROT],
                key: buf[KEY],
            },
            Opcode::CreateDomain => HostResponse::DomainCreated {
                key: buf[CREATED_KEY],
            },
            Opcode::FreeDomain => HostResponse::DomainFreed { key: buf[KEY] },
            Opcode::ReadPkru => HostResponse::Pkru {
                value: get_u32(buf, PKRU),
            },
            Opcode::WritePkru => HostResponse::PkruWritten {
                value: get_u32(buf, PKRU),
            },
        })
    }
}

fn read_opcode(buf: &CommandBuffer) -> Result<Opcode, CodecError> {
    let bytes = [buf[0], buf[1]];
    Opcode::from_bytes(bytes).ok_or(CodecError::UnknownOpcode(bytes))
}

fn require_zero(buf: &CommandBuffer, range: core::ops::Range<usize>) -> Result<(), CodecError> {
    for offset in range {
        if buf[offset] != 0 {
            return Err(CodecError::ReservedByteSet { offset });
        }
    }
    Ok(())
}

fn put_region(buf: &mut CommandBuffer, addr: u32, len: u32, prot: u8, key: u8) {
    put_u32(buf, ADDR, addr);
    put_u32(buf, LEN, len);
    buf[PROT] = prot;
    buf[KEY] = key;
}

fn put_u32(buf: &mut CommandBuffer, offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn get_u32(buf: &CommandBuffer, offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
