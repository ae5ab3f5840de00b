//! Allocator hook
//!
//! Routes heap growth through the host and tags every block with the key of
//! the domain that allocated it. Root-domain blocks stay on key 0. Only the
//! owner (or root) may free a block. Freed blocks are reverted to key 0 and
//! zeroed before they are recycled, so memory never changes owner while
//! still carrying the previous owner's key or contents.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use dilm_core::{DilmError, DomainId, KeyId, ProtectedRange};
use dilm_hal::Host;
use tracing::{trace, warn};

use crate::audit::AuditKind;
use crate::context::Dilm;

/// A live allocation made through the hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub addr: u32,
    /// Length in bytes (page aligned)
    pub len: u32,
    /// Domain active when the block was allocated
    pub owner: DomainId,
}

/// Allocator hook bookkeeping.
#[derive(Default)]
pub(crate) struct HeapState {
    live: BTreeMap<u32, Block>,
    /// Freed `(addr, len)` pairs, all tagged key 0
    recycled: Vec<(u32, u32)>,
    /// Bytes obtained from the host
    mapped_bytes: u64,
    /// Freed blocks the host could not zero; never reused
    retired: Vec<(u32, u32)>,
}

impl HeapState {
    pub(crate) fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.live.values()
    }

    /// Smallest recycled block of at least `len` bytes.
    fn take_recycled(&mut self, len: u32) -> Option<(u32, u32)> {
        let (index, _) = self
            .recycled
            .iter()
            .enumerate()
            .filter(|(_, (_, l))| *l >= len)
            .min_by_key(|(_, (_, l))| *l)?;
        Some(self.recycled.swap_remove(index))
    }
}

impl<H: Host> Dilm<H> {
    /// Allocate `size` bytes for the current domain.
    ///
    /// The request is rounded up to the configured page size. A recycled
    /// block is reused if one is large enough; otherwise the host maps fresh
    /// memory. Blocks allocated outside the root domain are tagged with the
    /// current domain's key.
    pub fn hook_alloc(&mut self, size: u32) -> Result<u32, DilmError> {
        if size == 0 {
            return Err(DilmError::InvalidArgument);
        }
        let page = self.config.page_size;
        let len = size
            .checked_next_multiple_of(page)
            .ok_or(DilmError::InvalidArgument)?;

        let (addr, len) = match self.heap.take_recycled(len) {
            Some(block) => block,
            None => {
                let addr = self.map(len)?;
                self.heap.mapped_bytes += u64::from(len);
                (addr, len)
            }
        };

        let owner = self.current;
        if !owner.is_root() {
            if let Err(e) = self.protect(addr, len, owner.key()) {
                self.heap.recycled.push((addr, len));
                return Err(e);
            }
            self.registry.record_range(ProtectedRange { addr, len, owner })?;
            self.audit_event(AuditKind::RangeProtected {
                addr,
                len,
                domain: owner,
            });
        }

        self.heap.live.insert(addr, Block { addr, len, owner });
        trace!(addr, len, owner = owner.0, "hook alloc");
        Ok(addr)
    }

    /// Free a block returned by [`Dilm::hook_alloc`].
    ///
    /// Only the owning domain or root may free a block; anyone else gets
    /// `InvalidPointer`. Blocks owned by a non-root domain are reverted to
    /// key 0 first. If that fails the block stays live and keeps its tag.
    /// The block is then zeroed; if the host cannot zero it, it is retired
    /// instead of recycled.
    pub fn hook_free(&mut self, addr: u32) -> Result<(), DilmError> {
        let block = *self
            .heap
            .live
            .get(&addr)
            .ok_or(DilmError::InvalidPointer(addr))?;

        if !self.current.is_root() && self.current != block.owner {
            warn!(
                addr,
                owner = block.owner.0,
                caller = self.current.0,
                "free of a block owned by another domain"
            );
            return Err(DilmError::InvalidPointer(addr));
        }

        if !block.owner.is_root() {
            self.protect(addr, block.len, KeyId(0))?;
            self.registry.release_range(addr);
            self.audit_event(AuditKind::RangeRevoked {
                addr,
                len: block.len,
            });
        }

        self.heap.live.remove(&addr);
        match self.host.scrub(addr, block.len) {
            Ok(()) => self.heap.recycled.push((addr, block.len)),
            Err(e) => {
                warn!(addr, len = block.len, error = %e, "freed block not zeroed, retiring");
                self.heap.retired.push((addr, block.len));
            }
        }
        trace!(addr, len = block.len, owner = block.owner.0, "hook free");
        Ok(())
    }

    /// Live block starting at `addr`.
    pub fn allocation(&self, addr: u32) -> Option<&Block> {
        self.heap.live.get(&addr)
    }

    /// Number of live blocks.
    pub fn live_allocations(&self) -> usize {
        self.heap.live.len()
    }

    /// Total bytes mapped from the host, live, recycled or retired.
    pub fn footprint(&self) -> u64 {
        self.heap.mapped_bytes
    }

    /// Bytes in live blocks owned by `domain`.
    pub fn footprint_of(&self, domain: DomainId) -> u64 {
        self.heap
            .blocks()
            .filter(|b| b.owner == domain)
            .map(|b| u64::from(b.len))
            .sum()
    }

    /// Bytes freed but withheld from reuse because the host could not zero them.
    pub fn retired_bytes(&self) -> u64 {
        self.heap
            .retired
            .iter()
            .map(|&(_, len)| u64::from(len))
            .sum()
    }

    /// Re-send a protect command for every recorded range.
    ///
    /// Needed after the host grows or relocates linear memory, which drops
    /// page tags. Returns the number of ranges re-protected.
    pub fn reprotect_all(&mut self) -> Result<usize, DilmError> {
        let ranges: Vec<ProtectedRange> = self.registry.ranges().copied().collect();
        for range in &ranges {
            self.protect(range.addr, range.len, range.owner.key())?;
        }
        trace!(count = ranges.len(), "ranges re-protected");
        Ok(ranges.len())
    }
}
