//! Monitor configuration.

use std::path::PathBuf;

use thiserror::Error;

use crate::memory::MIN_MEMORY_SIZE;
use crate::rr::{RrConfig, RrMode};

/// Guest memory when `--mem` is not given.
pub const DEFAULT_MEM_MIB: usize = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("guest memory of {size:#x} bytes is below the minimum of {min:#x}")]
    MemoryTooSmall { size: usize, min: usize },

    #[error("no kernel image given")]
    NoKernel,

    #[error("record/replay {mode} needs a log directory")]
    NoRrDir { mode: RrMode },
}

/// Network interface backing the net module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetConfig {
    /// Tap interface name, or `@N` for an already-open descriptor.
    pub iface: String,
    /// Guest MAC; a random one is generated when absent.
    pub mac: Option<[u8; 6]>,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Guest memory in bytes.
    pub mem_size: usize,
    pub kernel: PathBuf,
    /// Command line handed to the guest.
    pub cmdline: String,
    /// Raw disk image for the block module.
    pub disk: Option<PathBuf>,
    pub net: Option<NetConfig>,
    pub rr: RrConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mem_size: DEFAULT_MEM_MIB << 20,
            kernel: PathBuf::new(),
            cmdline: String::new(),
            disk: None,
            net: None,
            rr: RrConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mem_size < MIN_MEMORY_SIZE {
            return Err(ConfigError::MemoryTooSmall {
                size: self.mem_size,
                min: MIN_MEMORY_SIZE,
            });
        }
        if self.kernel.as_os_str().is_empty() {
            return Err(ConfigError::NoKernel);
        }
        if self.rr.mode != RrMode::None && self.rr.dir.as_os_str().is_empty() {
            return Err(ConfigError::NoRrDir { mode: self.rr.mode });
        }
        Ok(())
    }

    /// Instruction traps are only worth their exits when something is
    /// recorded or replayed.
    pub fn wants_traps(&self) -> bool {
        self.rr.mode != RrMode::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_kernel() -> MonitorConfig {
        MonitorConfig {
            kernel: PathBuf::from("guest.ukvm"),
            ..Default::default()
        }
    }

    #[test]
    fn default_is_512_mib_without_rr() {
        let config = with_kernel();
        assert_eq!(config.mem_size, 512 << 20);
        assert_eq!(config.rr.mode, RrMode::None);
        assert!(!config.wants_traps());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_tiny_memory() {
        let config = MonitorConfig {
            mem_size: 1 << 20,
            ..with_kernel()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MemoryTooSmall { .. })));
    }

    #[test]
    fn rr_needs_directory() {
        let mut config = with_kernel();
        config.rr.mode = RrMode::Record;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NoRrDir { mode: RrMode::Record })
        );
        config.rr.dir = PathBuf::from("/tmp/rr");
        assert_eq!(config.validate(), Ok(()));
        assert!(config.wants_traps());
    }
}
