//! The DILM context object

use alloc::vec::Vec;

use dilm_core::{
    check_all_invariants, CallGateTable, CallId, DilmError, DomainId, DomainRegistry,
    InvariantViolation, ROOT_DOMAIN,
};
use dilm_hal::Host;
use tracing::debug;

use crate::alloc_hook::HeapState;
use crate::audit::{AuditKind, AuditLog};
use crate::config::{ConfigError, DilmConfig};
use crate::switch::SwitchFrame;

/// Domain-isolation context.
///
/// Owns the domain registry, the call gate table, the current domain, the
/// stack of active switches, the allocator hook's bookkeeping and the audit
/// log. Driven from a single logical thread through `&mut self`.
pub struct Dilm<H: Host> {
    pub(crate) host: H,
    pub(crate) config: DilmConfig,
    pub(crate) registry: DomainRegistry,
    pub(crate) gates: CallGateTable,
    pub(crate) current: DomainId,
    pub(crate) frames: Vec<SwitchFrame>,
    pub(crate) next_switch_seq: u64,
    pub(crate) heap: HeapState,
    pub(crate) audit: AuditLog,
}

impl<H: Host> Dilm<H> {
    /// Create a context with the default configuration.
    pub fn new(host: H) -> Self {
        Self::build(host, DilmConfig::default())
    }

    /// Create a context with a validated configuration.
    pub fn with_config(host: H, config: DilmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(host, config))
    }

    fn build(host: H, config: DilmConfig) -> Self {
        debug!(
            max_keys = config.max_keys,
            gate_slots = config.gate_slots,
            page_size = config.page_size,
            "dilm context created"
        );
        Self {
            host,
            registry: DomainRegistry::with_key_limit(config.max_keys),
            gates: CallGateTable::with_capacity(config.gate_slots),
            current: ROOT_DOMAIN,
            frames: Vec::new(),
            next_switch_seq: 0,
            heap: HeapState::default(),
            audit: AuditLog::new(config.audit_capacity),
            config,
        }
    }

    // === Accessors ===

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Mutable host access, e.g. for guest memory loads and stores.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    pub fn config(&self) -> &DilmConfig {
        &self.config
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn gates(&self) -> &CallGateTable {
        &self.gates
    }

    /// Domain whose permissions are active.
    pub fn current_domain(&self) -> DomainId {
        self.current
    }

    /// Number of gated calls currently in progress.
    pub fn switch_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Check core invariants plus the context's own bookkeeping.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = check_all_invariants(&self.registry, &self.gates);

        if !self.registry.contains(self.current) {
            violations.push(InvariantViolation {
                invariant: "current_domain_validity",
                description: alloc::format!("Current domain {} does not exist", self.current),
            });
        }
        if self.frames.is_empty() && !self.current.is_root() {
            violations.push(InvariantViolation {
                invariant: "current_domain_validity",
                description: alloc::format!(
                    "Domain {} active with no switch in progress",
                    self.current
                ),
            });
        }
        for block in self.heap.blocks() {
            if !block.owner.is_root() && self.registry.range(block.addr).is_none() {
                violations.push(InvariantViolation {
                    invariant: "allocation_tagging",
                    description: alloc::format!(
                        "Block {:#x} owned by {} has no protected range",
                        block.addr,
                        block.owner
                    ),
                });
            }
        }

        violations
    }

    /// Release everything this context created: gates, tagged blocks and
    /// domains. Fails with `GateBusy` while a gated call is in progress.
    pub fn teardown(&mut self) -> Result<(), DilmError> {
        if !self.frames.is_empty() {
            return Err(DilmError::GateBusy);
        }

        let gates: Vec<CallId> = self.gates.iter().map(|(id, _)| id).collect();
        for id in gates {
            self.unregister_call(id)?;
        }

        let blocks: Vec<u32> = self
            .heap
            .blocks()
            .filter(|b| !b.owner.is_root())
            .map(|b| b.addr)
            .collect();
        for addr in blocks {
            self.hook_free(addr)?;
        }

        let domains: Vec<DomainId> = self.registry.domains().filter(|d| !d.is_root()).collect();
        for domain in domains {
            self.free_domain(domain)?;
        }

        debug!("dilm context torn down");
        Ok(())
    }

    pub(crate) fn audit_event(&mut self, kind: AuditKind) {
        let now = self.host.now_nanos();
        self.audit.record(now, self.current, kind);
    }
}
