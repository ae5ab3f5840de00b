//! Call gate registration and typed gates

use core::fmt;

use dilm_core::{CallId, DilmError, DomainId, EntryPoint};
use dilm_hal::Host;
use tracing::{debug, warn};

use crate::audit::AuditKind;
use crate::context::Dilm;

/// Function reachable through a gate. It receives the context so it can use
/// guest memory and nest further gated calls.
pub type GateFn<H, A, R> = fn(&mut Dilm<H>, A) -> R;

/// A registered, typed call gate.
///
/// `call` runs the function with the gate domain's rights and restores the
/// caller's state afterwards.
pub struct Gate<H: Host, A, R> {
    call_id: CallId,
    entry: GateFn<H, A, R>,
}

impl<H: Host, A, R> Gate<H, A, R> {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Address the gate was registered under.
    pub fn entry_point(&self) -> EntryPoint {
        EntryPoint::new(self.entry as usize)
    }

    /// Switch into the gate's domain, run the function, restore.
    ///
    /// Fails with `InvalidCallId` if the gate was unregistered or its slot now
    /// holds another function. If the function itself reports an error, it is
    /// returned inside `Ok` after the restore has run.
    pub fn call(&self, ctx: &mut Dilm<H>, arg: A) -> Result<R, DilmError> {
        let registered = ctx.gates.lookup(self.call_id)?;
        if registered.entry != self.entry_point() {
            return Err(DilmError::InvalidCallId);
        }

        let ticket = ctx.switch(self.call_id)?;
        let ret = (self.entry)(ctx, arg);
        ctx.restore(ticket)?;
        Ok(ret)
    }
}

impl<H: Host, A, R> Clone for Gate<H, A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Host, A, R> Copy for Gate<H, A, R> {}

impl<H: Host, A, R> fmt::Debug for Gate<H, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("call_id", &self.call_id)
            .field("entry", &self.entry_point())
            .finish()
    }
}

impl<H: Host> Dilm<H> {
    /// Register `f` to run with `domain`'s rights.
    pub fn register_call<A, R>(
        &mut self,
        domain: DomainId,
        f: GateFn<H, A, R>,
    ) -> Result<Gate<H, A, R>, DilmError> {
        let call_id = self.register_entry(domain, EntryPoint::new(f as usize))?;
        Ok(Gate { call_id, entry: f })
    }

    /// Register a raw entry point (integer ABI form).
    pub fn register_entry(
        &mut self,
        domain: DomainId,
        entry: EntryPoint,
    ) -> Result<CallId, DilmError> {
        let call_id = self
            .gates
            .register(&self.registry, domain, entry)
            .inspect_err(|e| warn!(domain = domain.0, error = %e, "gate registration failed"))?;

        debug!(slot = call_id.slot(), domain = domain.0, "gate registered");
        self.audit_event(AuditKind::GateRegistered {
            slot: call_id.slot(),
            domain,
        });
        Ok(call_id)
    }

    /// Clear a gate. Fails with `GateBusy` while the gate is mid-call.
    pub fn unregister_call(&mut self, call_id: CallId) -> Result<(), DilmError> {
        if self.gate_active(call_id) {
            return Err(DilmError::GateBusy);
        }
        let entry = self.gates.unregister(call_id)?;

        debug!(slot = call_id.slot(), domain = entry.domain.0, "gate unregistered");
        self.audit_event(AuditKind::GateUnregistered {
            slot: call_id.slot(),
            domain: entry.domain,
        });
        Ok(())
    }

    /// First live gate registered for `entry`.
    pub fn find_gate(&self, entry: EntryPoint) -> Option<CallId> {
        self.gates.find_by_entry(entry)
    }
}
