//! Runtime configuration

use core::fmt;

use serde::{Deserialize, Serialize};

use dilm_core::{MAX_GATE_SLOTS, MAX_KEYS};

/// Tunables for a [`crate::Dilm`] context.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use dilm_kernel::DilmConfig;
///
/// let cfg = DilmConfig::from_json(br#"{ "gate_slots": 8 }"#).unwrap();
/// assert_eq!(cfg.gate_slots, 8);
/// assert_eq!(cfg.max_keys, 16);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DilmConfig {
    /// Keys usable by this context, key 0 included (at most 16)
    pub max_keys: u8,
    /// Call gate slots (at most 64)
    pub gate_slots: usize,
    /// Granularity of allocator-hook mappings; a power of two
    pub page_size: u32,
    /// Create-domain round trips before giving up with `OutOfKeys`
    pub create_domain_attempts: u32,
    /// Maximum nesting of gated calls
    pub max_switch_depth: usize,
    /// Audit events kept in memory
    pub audit_capacity: usize,
}

impl Default for DilmConfig {
    fn default() -> Self {
        Self {
            max_keys: MAX_KEYS as u8,
            gate_slots: MAX_GATE_SLOTS,
            page_size: 4096,
            create_domain_attempts: 4,
            max_switch_depth: 32,
            audit_capacity: 1024,
        }
    }
}

impl DilmConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_slice(bytes).map_err(|e| ConfigError::Parse {
            line: e.line(),
            column: e.column(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every field is within range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_keys < 2 || usize::from(self.max_keys) > MAX_KEYS {
            return Err(ConfigError::KeyLimit(self.max_keys));
        }
        if self.gate_slots == 0 || self.gate_slots > MAX_GATE_SLOTS {
            return Err(ConfigError::GateSlots(self.gate_slots));
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.create_domain_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.max_switch_depth == 0 {
            return Err(ConfigError::ZeroSwitchDepth);
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// JSON could not be parsed
    Parse { line: usize, column: usize },
    /// `max_keys` outside 2..=16
    KeyLimit(u8),
    /// `gate_slots` outside 1..=64
    GateSlots(usize),
    /// `page_size` not a power of two
    PageSize(u32),
    ZeroAttempts,
    ZeroSwitchDepth,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse { line, column } => {
                write!(f, "invalid config at line {} column {}", line, column)
            }
            ConfigError::KeyLimit(n) => write!(f, "max_keys {} outside 2..=16", n),
            ConfigError::GateSlots(n) => write!(f, "gate_slots {} outside 1..=64", n),
            ConfigError::PageSize(n) => write!(f, "page_size {} is not a power of two", n),
            ConfigError::ZeroAttempts => write!(f, "create_domain_attempts must be non-zero"),
            ConfigError::ZeroSwitchDepth => write!(f, "max_switch_depth must be non-zero"),
        }
    }
}
