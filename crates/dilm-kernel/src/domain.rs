//! Domain lifecycle: create, free, assign permissions

use dilm_core::{AccessRights, DilmError, DomainId, HostFailure, KeyId, MAX_KEYS};
use dilm_hal::Host;
use dilm_ipc::{HostCommand, HostResponse, Opcode};
use tracing::{debug, warn};

use crate::audit::AuditKind;
use crate::context::Dilm;

impl<H: Host> Dilm<H> {
    /// Create a new domain bound to a fresh protection key.
    ///
    /// The domain starts default-deny: both disable bits are set in its
    /// register field and stored as its permissions.
    ///
    /// Key 0 or a key outside the register is host backpressure and is
    /// retried. A real key past the configured limit is handed back to the
    /// host before retrying. If setting up the new key's field fails, the key
    /// is handed back as well.
    ///
    /// # Returns
    /// * `Ok(DomainId)` - New non-root domain
    /// * `Err(DilmError::InvalidFlags)` - `flags` does not fit the wire byte
    /// * `Err(DilmError::OutOfKeys)` - Host had no key after every retry
    /// * `Err(DilmError::HostCommandFailed)` - Round trip failed
    pub fn create_domain(&mut self, flags: u32) -> Result<DomainId, DilmError> {
        let wire_flags = u8::try_from(flags).map_err(|_| DilmError::InvalidFlags(flags))?;
        let limit = self.registry.key_limit();

        for attempt in 0..self.config.create_domain_attempts {
            let key = match self.host_call(HostCommand::CreateDomain { flags: wire_flags })? {
                HostResponse::DomainCreated { key } => key,
                _ => return Err(self.inconsistent(Opcode::CreateDomain)),
            };

            // Key 0 and keys outside the register mean "none free right now"
            if key == 0 || usize::from(key) >= MAX_KEYS {
                warn!(key, attempt, "host has no free protection key");
                continue;
            }
            if key >= limit {
                warn!(key, limit, attempt, "host key past configured limit, returning it");
                self.release_host_key(key)?;
                continue;
            }
            if self.registry.contains(DomainId(key)) {
                warn!(key, "host returned a key that is already in use");
                return Err(self.host_failure(Opcode::CreateDomain, HostFailure::Inconsistent));
            }

            let domain = self.registry.insert(KeyId(key))?;
            if let Err(e) = self.update_key_field(domain.key(), AccessRights::deny_all()) {
                self.roll_back_domain(domain);
                return Err(e);
            }

            debug!(domain = key, "domain created");
            self.audit_event(AuditKind::DomainCreated { domain });
            return Ok(domain);
        }

        warn!(
            attempts = self.config.create_domain_attempts,
            "domain creation gave up"
        );
        Err(DilmError::OutOfKeys)
    }

    /// Free a domain and release its key.
    ///
    /// Fails with `InvalidDomain` for the root domain and unknown domains, and
    /// with `DomainInUse` while gates, protected ranges or active switches
    /// still reference it. The key's field is reset to default-deny before the
    /// host releases the key, so a failed release leaves the domain in place
    /// and locked, and the call can be retried.
    pub fn free_domain(&mut self, domain: DomainId) -> Result<(), DilmError> {
        if domain.is_root() || !self.registry.contains(domain) {
            return Err(DilmError::InvalidDomain);
        }

        let gates = self.gates.live_entries_for(domain);
        let ranges = self.registry.ranges_owned_by(domain);
        let active = self.current == domain
            || self
                .frames
                .iter()
                .any(|f| f.caller == domain || f.callee == domain);
        if gates > 0 || ranges > 0 || active {
            warn!(domain = domain.0, gates, ranges, active, "domain still in use");
            return Err(DilmError::DomainInUse { gates, ranges });
        }

        self.update_key_field(domain.key(), AccessRights::deny_all())?;
        self.release_host_key(domain.0)?;
        self.registry.remove(domain)?;

        debug!(domain = domain.0, "domain freed");
        self.audit_event(AuditKind::DomainFreed { domain });
        Ok(())
    }

    /// Assign raw access-rights bits (`PKEY_DISABLE_ACCESS`, `PKEY_DISABLE_WRITE`)
    /// to a domain and apply them to the register immediately.
    ///
    /// Unknown domains are rejected before any host traffic, so the register is
    /// never touched on failure.
    pub fn assign_permissions(
        &mut self,
        domain: DomainId,
        access_rights: u32,
    ) -> Result<(), DilmError> {
        self.require_assignable(domain)?;
        let rights = AccessRights::from_bits(access_rights)
            .ok_or(DilmError::InvalidAccessRights(access_rights))?;
        self.assign_rights(domain, rights)
    }

    /// Typed form of [`Dilm::assign_permissions`].
    pub fn assign_rights(
        &mut self,
        domain: DomainId,
        rights: AccessRights,
    ) -> Result<(), DilmError> {
        self.require_assignable(domain)?;

        self.update_key_field(domain.key(), rights)?;
        self.registry.set_permissions(domain, rights)?;

        debug!(domain = domain.0, rights = rights.to_bits(), "permissions assigned");
        self.audit_event(AuditKind::PermissionsAssigned { domain, rights });
        Ok(())
    }

    /// Rights stored for `domain`.
    pub fn permissions(&self, domain: DomainId) -> Result<AccessRights, DilmError> {
        self.registry.permissions(domain)
    }

    fn release_host_key(&mut self, key: u8) -> Result<(), DilmError> {
        match self.host_call(HostCommand::FreeDomain { key })? {
            HostResponse::DomainFreed { key: freed } if freed == key => Ok(()),
            _ => Err(self.inconsistent(Opcode::FreeDomain)),
        }
    }

    /// Undo a half-created domain.
    fn roll_back_domain(&mut self, domain: DomainId) {
        if let Err(e) = self.registry.remove(domain) {
            warn!(domain = domain.0, error = %e, "rollback could not drop domain");
        }
        if let Err(e) = self.release_host_key(domain.0) {
            warn!(domain = domain.0, error = %e, "rollback could not release host key");
        }
    }

    fn require_assignable(&self, domain: DomainId) -> Result<(), DilmError> {
        if domain.is_root() || !self.registry.contains(domain) {
            warn!(domain = domain.0, "permission assignment to invalid domain");
            return Err(DilmError::InvalidDomain);
        }
        Ok(())
    }
}
