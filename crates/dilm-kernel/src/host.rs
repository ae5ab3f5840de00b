//! Host command round trips
//!
//! Every privileged operation is one encode → entropy request → decode cycle.
//! Replies are validated against the request before anything uses them.

use dilm_core::{AccessRights, DilmError, HostFailure, KeyId, Pkru};
use dilm_hal::Host;
use dilm_ipc::prot::PROT_READ_WRITE;
use dilm_ipc::{HostCommand, HostResponse, Opcode};
use tracing::{trace, warn};

use crate::audit::AuditKind;
use crate::context::Dilm;

impl<H: Host> Dilm<H> {
    /// Send one command and return the validated reply.
    pub(crate) fn host_call(&mut self, cmd: HostCommand) -> Result<HostResponse, DilmError> {
        let op = cmd.opcode();
        let mut buf = cmd.encode();
        trace!(opcode = %op, "host command");

        if let Err(e) = self.host.entropy_request(&mut buf) {
            warn!(opcode = %op, error = %e, "host transport failed");
            return Err(self.host_failure(op, HostFailure::Transport));
        }

        match HostResponse::decode(op, &buf) {
            Ok(HostResponse::Rejected { status }) => {
                warn!(opcode = %op, status, "host rejected command");
                Err(self.host_failure(op, HostFailure::Rejected(status)))
            }
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(opcode = %op, error = %e, "malformed host reply");
                Err(self.host_failure(op, HostFailure::Malformed))
            }
        }
    }

    pub(crate) fn host_failure(&mut self, opcode: Opcode, failure: HostFailure) -> DilmError {
        let status = match failure {
            HostFailure::Rejected(status) => Some(status),
            _ => None,
        };
        self.audit_event(AuditKind::HostCommandFailed { opcode, status });
        DilmError::HostCommandFailed(failure)
    }

    pub(crate) fn inconsistent(&mut self, opcode: Opcode) -> DilmError {
        warn!(opcode = %opcode, "host reply contradicts request");
        self.host_failure(opcode, HostFailure::Inconsistent)
    }

    /// Read the key control register.
    ///
    /// A zero reading (host not initialised) is returned as the default-deny
    /// value.
    pub fn read_pkru(&mut self) -> Result<Pkru, DilmError> {
        match self.host_call(HostCommand::ReadPkru)? {
            HostResponse::Pkru { value } => Ok(Pkru::from_register(value)),
            _ => Err(self.inconsistent(Opcode::ReadPkru)),
        }
    }

    /// Put the register into its default-deny state if the host left it zero.
    pub fn initialize_register(&mut self) -> Result<Pkru, DilmError> {
        let pkru = self.read_pkru()?;
        self.write_pkru(pkru)?;
        Ok(pkru)
    }

    pub(crate) fn write_pkru(&mut self, pkru: Pkru) -> Result<(), DilmError> {
        match self.host_call(HostCommand::WritePkru { value: pkru.raw() })? {
            HostResponse::PkruWritten { value } if value == pkru.raw() => Ok(()),
            _ => Err(self.inconsistent(Opcode::WritePkru)),
        }
    }

    /// Masked read-modify-write of one key's field. Returns the value read.
    pub(crate) fn update_key_field(
        &mut self,
        key: KeyId,
        rights: AccessRights,
    ) -> Result<Pkru, DilmError> {
        let before = self.read_pkru()?;
        self.write_pkru(before.with_rights(key, rights))?;
        Ok(before)
    }

    /// Tag `[addr, addr + len)` with `key`.
    pub(crate) fn protect(&mut self, addr: u32, len: u32, key: KeyId) -> Result<(), DilmError> {
        let cmd = HostCommand::Protect {
            addr,
            len,
            prot: PROT_READ_WRITE,
            key: key.0,
        };
        match self.host_call(cmd)? {
            HostResponse::Protected {
                addr: a,
                len: l,
                key: k,
                ..
            } if a == addr && l == len && k == key.0 => Ok(()),
            _ => Err(self.inconsistent(Opcode::Protect)),
        }
    }

    /// Map `len` fresh bytes, returning the address.
    pub(crate) fn map(&mut self, len: u32) -> Result<u32, DilmError> {
        let cmd = HostCommand::Mmap {
            addr: 0,
            len,
            prot: PROT_READ_WRITE,
            flags: 0,
        };
        match self.host_call(cmd)? {
            HostResponse::Mapped { addr, len: l }
                if l == len && addr % self.config.page_size == 0 =>
            {
                Ok(addr)
            }
            _ => Err(self.inconsistent(Opcode::Mmap)),
        }
    }
}
