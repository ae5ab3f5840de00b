//! Protection switch protocol
//!
//! `switch` enters a gate's domain; `restore` leaves it. Both are masked
//! read-modify-writes of the key register, so a switch into domain A followed
//! by its restore leaves every other key's field exactly as it was.
//!
//! ```text
//!   caller (D0)                          callee (D1)
//!   ───────────                          ───────────
//!   switch(id) ── read PKRU ── set D1 field ──▶ body runs with D1 rights
//!                 push frame                          │
//!   restore(t) ◀─ read PKRU ── put back saved fields ─┘
//!                 pop frame
//! ```
//!
//! Switches nest. Only the innermost switch can be restored.

use dilm_core::{AccessRights, CallId, DilmError, DomainId};
use dilm_hal::Host;
use tracing::{trace, warn};

use crate::audit::AuditKind;
use crate::context::Dilm;

/// An active gated call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SwitchFrame {
    /// Unique per switch on this context
    pub(crate) seq: u64,
    pub(crate) call_id: CallId,
    pub(crate) caller: DomainId,
    pub(crate) callee: DomainId,
    /// Caller's field as read at switch time
    pub(crate) caller_rights: AccessRights,
    /// Callee's field as read at switch time
    pub(crate) callee_rights: AccessRights,
}

/// Proof of an active switch; hand it back to [`Dilm::restore`].
#[must_use = "an active switch must be restored"]
#[derive(Debug, PartialEq, Eq)]
pub struct SwitchTicket {
    seq: u64,
    depth: usize,
    caller: DomainId,
    callee: DomainId,
}

impl SwitchTicket {
    /// Domain that was active before the switch.
    pub fn caller(&self) -> DomainId {
        self.caller
    }

    /// Domain entered by the switch.
    pub fn callee(&self) -> DomainId {
        self.callee
    }

    /// Nesting depth of this switch (1 = outermost).
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl<H: Host> Dilm<H> {
    /// Enter the domain bound to `call_id`.
    ///
    /// Only the callee key's two bits change in the register; they are set to
    /// the callee's stored permissions.
    pub fn switch(&mut self, call_id: CallId) -> Result<SwitchTicket, DilmError> {
        let gate = self.gates.lookup(call_id)?;
        if self.frames.len() >= self.config.max_switch_depth {
            warn!(depth = self.frames.len(), "switch nesting limit reached");
            return Err(DilmError::SwitchDepthExceeded);
        }

        let callee = gate.domain;
        let rights = self.registry.permissions(callee)?;
        let caller = self.current;

        let before = self.read_pkru()?;
        let after = before.with_rights(callee.key(), rights);
        self.write_pkru(after)?;

        let seq = self.next_switch_seq;
        self.next_switch_seq += 1;
        self.frames.push(SwitchFrame {
            seq,
            call_id,
            caller,
            callee,
            caller_rights: before.rights(caller.key()),
            callee_rights: before.rights(callee.key()),
        });
        self.current = callee;

        trace!(
            from = caller.0,
            to = callee.0,
            pkru_before = before.raw(),
            pkru_after = after.raw(),
            "switch"
        );
        self.audit_event(AuditKind::Switch {
            from: caller,
            to: callee,
            pkru_before: before.raw(),
            pkru_after: after.raw(),
        });

        Ok(SwitchTicket {
            seq,
            depth: self.frames.len(),
            caller,
            callee,
        })
    }

    /// Leave the innermost switch.
    ///
    /// Fails with `UnbalancedRestore` if `ticket` is not the innermost switch,
    /// including a ticket whose switch was already left via `restore_to`.
    /// If the host round trip fails the switch stays active and can be
    /// retried with [`Dilm::restore_to`].
    pub fn restore(&mut self, ticket: SwitchTicket) -> Result<(), DilmError> {
        match self.frames.last() {
            Some(top) if top.seq == ticket.seq => {}
            _ => {
                warn!(
                    depth = ticket.depth,
                    active = self.frames.len(),
                    "restore does not match innermost switch"
                );
                return Err(DilmError::UnbalancedRestore);
            }
        }
        self.pop_frame()
    }

    /// Leave the innermost switch, checking it was entered from `caller`.
    ///
    /// This is the integer-ABI form of [`Dilm::restore`].
    pub fn restore_to(&mut self, caller: DomainId) -> Result<(), DilmError> {
        match self.frames.last() {
            Some(top) if top.caller == caller => self.pop_frame(),
            _ => {
                warn!(caller = caller.0, "restore to a domain that did not switch");
                Err(DilmError::UnbalancedRestore)
            }
        }
    }

    /// Whether a gate is part of an active switch.
    pub(crate) fn gate_active(&self, call_id: CallId) -> bool {
        self.frames.iter().any(|f| f.call_id == call_id)
    }

    fn pop_frame(&mut self) -> Result<(), DilmError> {
        let frame = *self.frames.last().ok_or(DilmError::UnbalancedRestore)?;

        let current = self.read_pkru()?;
        let restored = current
            .with_rights(frame.callee.key(), frame.callee_rights)
            .with_rights(frame.caller.key(), frame.caller_rights);
        self.write_pkru(restored)?;

        self.frames.pop();
        self.current = frame.caller;

        trace!(
            from = frame.callee.0,
            to = frame.caller.0,
            pkru = restored.raw(),
            "restore"
        );
        self.audit_event(AuditKind::Restore {
            from: frame.callee,
            to: frame.caller,
            pkru: restored.raw(),
        });
        Ok(())
    }
}
