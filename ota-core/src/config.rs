//! Transfer and execution budgets shared by both roles.

use serde::Deserialize;

use crate::protocol::{chunk_size_for_mtu, ANNOUNCE_LEN, DATA_HEADER_LEN};

/// Default transport payload limit: a 23-byte link MTU leaves 20 bytes per notification.
pub const DEFAULT_MTU: usize = 20;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()?;
        self.execution.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Maximum bytes per transport message. Build-time constant on a device, never negotiated.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Consecutive delivery failures of one frame before the sender gives up. None: retry forever.
    #[serde(default)]
    pub retry_limit: Option<u32>,
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            retry_limit: None,
        }
    }
}

impl TransferConfig {
    /// Payload bytes per Data frame.
    pub fn chunk_size(&self) -> usize {
        chunk_size_for_mtu(self.mtu)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu <= DATA_HEADER_LEN || self.mtu < ANNOUNCE_LEN {
            return Err(ConfigError::MtuTooSmall(self.mtu));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Maximum native stack the interpreter may use for wasm frames.
    #[serde(default = "default_max_stack_bytes")]
    pub max_stack_bytes: usize,
    /// Linear-memory budget of the runtime.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    /// Fuel granted to every `calcWasm` call; a call that runs out traps.
    #[serde(default = "default_fuel_per_call")]
    pub fuel_per_call: u64,
}

fn default_max_stack_bytes() -> usize {
    64 * 1024
}
fn default_max_memory_bytes() -> usize {
    128 * 1024
}
fn default_fuel_per_call() -> u64 {
    1_000_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_stack_bytes: default_max_stack_bytes(),
            max_memory_bytes: default_max_memory_bytes(),
            fuel_per_call: default_fuel_per_call(),
        }
    }
}

impl ExecutionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_stack_bytes == 0 {
            return Err(ConfigError::ZeroBudget("max_stack_bytes"));
        }
        if self.fuel_per_call == 0 {
            return Err(ConfigError::ZeroBudget("fuel_per_call"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("mtu {0} leaves no room for a data payload")]
    MtuTooSmall(usize),
    #[error("{0} must be non-zero")]
    ZeroBudget(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.transfer.mtu, 20);
        assert_eq!(c.transfer.chunk_size(), 17);
        assert_eq!(c.transfer.retry_limit, None);
        assert_eq!(c.execution.fuel_per_call, 1_000_000);
        c.validate().unwrap();
    }

    #[test]
    fn tiny_mtu_rejected() {
        let mut c = Config::default();
        c.transfer.mtu = 3;
        assert_eq!(c.validate(), Err(ConfigError::MtuTooSmall(3)));
    }

    #[test]
    fn zero_fuel_rejected() {
        let mut c = Config::default();
        c.execution.fuel_per_call = 0;
        assert_eq!(c.validate(), Err(ConfigError::ZeroBudget("fuel_per_call")));
    }
}
