//! Emulated protection-key host.
//!
//! Services the command protocol the way a privileged host would: a 32-bit key
//! register, a 16-key allocator with key 0 reserved, a bump mapper for linear
//! memory and a key tag per page. Guest accesses go through [`EmulatedHost::load`]
//! and [`EmulatedHost::store`], which fault exactly where hardware would.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use dilm_ipc::status::{STATUS_INVALID, STATUS_NO_MEMORY};
use dilm_ipc::{CommandBuffer, HostCommand, HostResponse, Opcode, COMMAND_LEN, MAX_KEYS};

use crate::{HalError, Host};

/// Granularity of key tags (one OS page).
pub const EMULATED_PAGE_SIZE: u32 = 4096;

/// First address handed out by the mapper. Memory below it belongs to key 0.
pub const MAP_BASE: u32 = 0x10000;

/// Key id returned by a create-domain reply when no key is free.
const NO_KEY: u8 = 0xFF;

const DISABLE_ACCESS: u32 = 0x1;
const DISABLE_WRITE: u32 = 0x2;

/// Default upper bound on linear memory (16 MiB).
const DEFAULT_MEMORY_LIMIT: u32 = 16 * 1024 * 1024;

/// In-process host servicing the DILM command protocol.
pub struct EmulatedHost {
    pkru: u32,
    /// Bit `k` set = key `k` allocated
    allocated_keys: u16,
    key_limit: u8,
    memory: Vec<u8>,
    page_keys: Vec<u8>,
    next_map: u32,
    memory_limit: u32,
    time: u64,
    random_seed: u64,
    backpressure: u32,
    /// Requests to let through before the next injected transport failure
    fail_after: Option<u32>,
    reject_next: Option<u8>,
    commands_serviced: usize,
    debug_log: Vec<String>,
}

impl EmulatedHost {
    pub fn new() -> Self {
        Self {
            pkru: 0,
            allocated_keys: 0b1,
            key_limit: MAX_KEYS,
            memory: vec![0; MAP_BASE as usize],
            page_keys: vec![0; (MAP_BASE / EMULATED_PAGE_SIZE) as usize],
            next_map: MAP_BASE,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            time: 0,
            random_seed: 12345,
            backpressure: 0,
            fail_after: None,
            reject_next: None,
            commands_serviced: 0,
            debug_log: Vec::new(),
        }
    }

    /// Limit the number of keys (including key 0) the host will hand out.
    pub fn with_key_limit(mut self, limit: u8) -> Self {
        self.key_limit = limit.clamp(1, MAX_KEYS);
        self
    }

    /// Limit the total size of linear memory.
    pub fn with_memory_limit(mut self, bytes: u32) -> Self {
        self.memory_limit = bytes.max(MAP_BASE);
        self
    }

    /// Answer the next `count` create-domain requests with "no key".
    pub fn with_backpressure(mut self, count: u32) -> Self {
        self.backpressure = count;
        self
    }

    /// Make the next entropy request fail at the transport level.
    pub fn fail_next_transport(&mut self) {
        self.fail_after = Some(0);
    }

    /// Let `count` entropy requests through, then fail the one after.
    pub fn fail_transport_after(&mut self, count: u32) {
        self.fail_after = Some(count);
    }

    /// Reject the next intercepted command with `status`.
    pub fn reject_next(&mut self, status: u8) {
        self.reject_next = Some(status);
    }

    /// Advance the emulated clock.
    pub fn advance_time(&mut self, nanos: u64) {
        self.time += nanos;
    }

    /// Current value of the key register.
    pub fn pkru(&self) -> u32 {
        self.pkru
    }

    /// Whether key `key` is currently allocated.
    pub fn is_key_allocated(&self, key: u8) -> bool {
        key < MAX_KEYS && self.allocated_keys & (1 << key) != 0
    }

    /// Number of allocated keys, key 0 included.
    pub fn allocated_key_count(&self) -> u32 {
        self.allocated_keys.count_ones()
    }

    /// Key tag of the page containing `addr`.
    pub fn key_of(&self, addr: u32) -> Option<u8> {
        self.page_keys
            .get((addr / EMULATED_PAGE_SIZE) as usize)
            .copied()
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> u32 {
        self.memory.len() as u32
    }

    /// Number of protocol commands serviced so far.
    pub fn commands_serviced(&self) -> usize {
        self.commands_serviced
    }

    /// Diagnostic messages recorded by the host.
    pub fn debug_log(&self) -> &[String] {
        &self.debug_log
    }

    /// Reset every page tag to key 0, as happens when the host grows and
    /// relocates linear memory.
    pub fn drop_page_tags(&mut self) {
        self.page_keys.iter_mut().for_each(|k| *k = 0);
        self.log(format!("page tags dropped ({} pages)", self.page_keys.len()));
    }

    // === Guest memory access ===

    /// Read `len` bytes at `addr` under the current register.
    pub fn load(&self, addr: u32, len: u32) -> Result<&[u8], HalError> {
        self.check_access(addr, len, false)?;
        let start = addr as usize;
        Ok(&self.memory[start..start + len as usize])
    }

    /// Write `data` at `addr` under the current register.
    pub fn store(&mut self, addr: u32, data: &[u8]) -> Result<(), HalError> {
        let len = u32::try_from(data.len()).map_err(|_| HalError::OutOfBounds {
            addr,
            len: u32::MAX,
        })?;
        self.check_access(addr, len, true)?;
        let start = addr as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn check_access(&self, addr: u32, len: u32, write: bool) -> Result<(), HalError> {
        let end = addr
            .checked_add(len)
            .filter(|&end| end as usize <= self.memory.len())
            .ok_or(HalError::OutOfBounds { addr, len })?;
        if len == 0 {
            return Ok(());
        }

        let first = addr / EMULATED_PAGE_SIZE;
        let last = (end - 1) / EMULATED_PAGE_SIZE;
        for page in first..=last {
            let key = self.page_keys[page as usize];
            let bits = (self.pkru >> (u32::from(key) * 2)) & 0b11;
            let denied = bits & DISABLE_ACCESS != 0 || (write && bits & DISABLE_WRITE != 0);
            if denied {
                let fault_addr = addr.max(page * EMULATED_PAGE_SIZE);
                return Err(HalError::ProtectionFault {
                    addr: fault_addr,
                    key,
                    write,
                });
            }
        }
        Ok(())
    }

    // === Command servicing ===

    fn service(&mut self, op: Opcode, buf: &mut CommandBuffer) {
        self.commands_serviced += 1;

        let reply = match HostCommand::decode(buf) {
            Err(e) => {
                self.log(format!("malformed {} command: {}", op, e));
                HostResponse::Rejected {
                    status: STATUS_INVALID,
                }
            }
            Ok(_) if self.reject_next.is_some() => HostResponse::Rejected {
                status: self.reject_next.take().unwrap_or(STATUS_INVALID),
            },
            Ok(cmd) => self.execute(cmd).unwrap_or_else(|status| {
                self.log(format!("rejected {:?} with status {}", cmd, status));
                HostResponse::Rejected { status }
            }),
        };

        *buf = reply.encode(op);
    }

    fn execute(&mut self, cmd: HostCommand) -> Result<HostResponse, u8> {
        match cmd {
            HostCommand::Mmap { len, .. } => self.map(len),
            HostCommand::Protect {
                addr,
                len,
                prot,
                key,
            } => {
                self.tag_range(addr, len, key)?;
                Ok(HostResponse::Protected {
                    addr,
                    len,
                    prot,
                    key,
                })
            }
            HostCommand::CreateDomain { .. } => Ok(HostResponse::DomainCreated {
                key: self.allocate_key(),
            }),
            HostCommand::FreeDomain { key } => {
                if key == 0 || !self.is_key_allocated(key) {
                    return Err(STATUS_INVALID);
                }
                self.allocated_keys &= !(1 << key);
                self.log(format!("freed key {}", key));
                Ok(HostResponse::DomainFreed { key })
            }
            HostCommand::ReadPkru => Ok(HostResponse::Pkru { value: self.pkru }),
            HostCommand::WritePkru { value } => {
                self.pkru = value;
                Ok(HostResponse::PkruWritten { value })
            }
        }
    }

    fn map(&mut self, len: u32) -> Result<HostResponse, u8> {
        if len == 0 {
            return Err(STATUS_INVALID);
        }
        let pages = len.div_ceil(EMULATED_PAGE_SIZE);
        let addr = self.next_map;
        let end = pages
            .checked_mul(EMULATED_PAGE_SIZE)
            .and_then(|bytes| addr.checked_add(bytes))
            .filter(|&end| end <= self.memory_limit)
            .ok_or(STATUS_NO_MEMORY)?;

        self.memory.resize(end as usize, 0);
        self.page_keys.resize((end / EMULATED_PAGE_SIZE) as usize, 0);
        self.next_map = end;
        self.log(format!("mapped {:#x}..{:#x}", addr, end));

        Ok(HostResponse::Mapped { addr, len })
    }

    fn tag_range(&mut self, addr: u32, len: u32, key: u8) -> Result<(), u8> {
        if !self.is_key_allocated(key) || addr % EMULATED_PAGE_SIZE != 0 || len == 0 {
            return Err(STATUS_INVALID);
        }
        let end = addr
            .checked_add(len)
            .filter(|&end| end as usize <= self.memory.len())
            .ok_or(STATUS_INVALID)?;

        let first = addr / EMULATED_PAGE_SIZE;
        let last = end.div_ceil(EMULATED_PAGE_SIZE);
        for page in first..last {
            self.page_keys[page as usize] = key;
        }
        Ok(())
    }

    fn allocate_key(&mut self) -> u8 {
        if self.backpressure > 0 {
            self.backpressure -= 1;
            self.log(String::from("create-domain deferred (backpressure)"));
            return NO_KEY;
        }
        match (1..self.key_limit).find(|&k| !self.is_key_allocated(k)) {
            Some(key) => {
                self.allocated_keys |= 1 << key;
                self.log(format!("allocated key {}", key));
                key
            }
            None => {
                self.log(String::from("no free protection key"));
                NO_KEY
            }
        }
    }

    fn fill_random(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            // xorshift64
            let mut x = self.random_seed;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.random_seed = x;
            *byte = x as u8;
        }
    }

    fn log(&mut self, msg: String) {
        self.debug_log.push(format!("[emulated-host] {}", msg));
    }
}

impl Default for EmulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for EmulatedHost {
    fn entropy_request(&mut self, buf: &mut [u8]) -> Result<(), HalError> {
        self.time += 1_000;

        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                self.log(String::from("entropy request failed (injected)"));
                return Err(HalError::EntropyUnavailable);
            }
            Some(n) => self.fail_after = Some(n - 1),
            None => {}
        }

        if buf.len() == COMMAND_LEN {
            if let Some(op) = Opcode::from_bytes([buf[0], buf[1]]) {
                let mut cmd = [0u8; COMMAND_LEN];
                cmd.copy_from_slice(buf);
                self.service(op, &mut cmd);
                buf.copy_from_slice(&cmd);
                return Ok(());
            }
        }

        self.fill_random(buf);
        Ok(())
    }

    fn now_nanos(&self) -> u64 {
        self.time
    }

    fn scrub(&mut self, addr: u32, len: u32) -> Result<(), HalError> {
        let end = addr
            .checked_add(len)
            .filter(|&end| end as usize <= self.memory.len())
            .ok_or(HalError::OutOfBounds { addr, len })?;
        self.memory[addr as usize..end as usize].fill(0);
        Ok(())
    }
}
