//! Configuration file parsing
//!
//! Parses the TOML machine description: bus settings, attached disks and
//! register ports.

use crate::bus::MAX_TARGETS;
use crate::port::LATCH_REGISTERS;
use crate::storage::{validate_block_size, DEFAULT_BLOCK_SIZE, MAX_MEMORY_SIZE};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Machine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Machine settings
    #[serde(default)]
    pub machine: MachineConfig,

    /// Disks attached to the bus
    #[serde(default)]
    pub disk: Vec<DiskConfig>,

    /// Register ports
    #[serde(default)]
    pub port: Vec<PortConfig>,
}

/// Machine settings
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Id of the storage bus
    #[serde(default)]
    pub bus_id: u8,

    /// Bus id the host adapter arbitrates with
    #[serde(default = "default_initiator")]
    pub initiator: u8,

    /// Where `attach --save` writes the snapshot
    #[serde(default)]
    pub snapshot: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bus_id: 0,
            initiator: default_initiator(),
            snapshot: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initiator() -> u8 {
    7
}

/// Disk configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    /// Target id on the bus (0-15)
    pub target: u8,

    /// Backing store type
    #[serde(default = "default_backend")]
    pub backend: BackendType,

    /// Image path (file backend)
    #[serde(default)]
    pub path: Option<String>,

    /// Size in bytes: auto-create size for files, buffer size for memory
    #[serde(default)]
    pub size: Option<u64>,

    /// Logical block size
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Model string; defaults to the image file name
    #[serde(default)]
    pub model: Option<String>,

    /// Discard writes
    #[serde(default)]
    pub read_only: bool,
}

fn default_backend() -> BackendType {
    BackendType::File
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

/// Backing store type
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    File,
    Memory,
}

/// Register port configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// Name for logs
    #[serde(default)]
    pub name: Option<String>,

    /// First address of the range
    pub base: u32,

    /// Number of registers
    pub count: u32,

    /// Register width in bytes (1, 2 or 4)
    #[serde(default = "default_width")]
    pub width: u8,
}

fn default_width() -> u8 {
    1
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.initiator as usize >= MAX_TARGETS {
            return Err(ConfigError::Invalid(format!(
                "initiator id {} out of range",
                self.machine.initiator
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for disk in &self.disk {
            if disk.target as usize >= MAX_TARGETS {
                return Err(ConfigError::Invalid(format!(
                    "target id {} out of range",
                    disk.target
                )));
            }
            if disk.target == self.machine.initiator {
                return Err(ConfigError::Invalid(format!(
                    "target id {} is the initiator id",
                    disk.target
                )));
            }
            if !seen.insert(disk.target) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target id {}",
                    disk.target
                )));
            }
            if validate_block_size(disk.block_size).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "invalid block size {} for target {}",
                    disk.block_size, disk.target
                )));
            }

            match disk.backend {
                BackendType::File => {
                    if disk.path.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "file backend requires a path for target {}",
                            disk.target
                        )));
                    }
                }
                BackendType::Memory => match disk.size {
                    None => {
                        return Err(ConfigError::Invalid(format!(
                            "memory backend requires a size for target {}",
                            disk.target
                        )));
                    }
                    Some(size) if size > MAX_MEMORY_SIZE => {
                        return Err(ConfigError::Invalid(format!(
                            "memory size {} for target {} exceeds {} bytes",
                            size, disk.target, MAX_MEMORY_SIZE
                        )));
                    }
                    Some(_) => {}
                },
            }
        }

        for port in &self.port {
            if !matches!(port.width, 1 | 2 | 4) {
                return Err(ConfigError::Invalid(format!(
                    "port at {:#x}: width {} is not 1, 2 or 4",
                    port.base, port.width
                )));
            }
            if port.count == 0 || port.count as usize > LATCH_REGISTERS {
                return Err(ConfigError::Invalid(format!(
                    "port at {:#x}: {} registers (1-{} allowed)",
                    port.base, port.count, LATCH_REGISTERS
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[[disk]]
target = 0
path = "/data/disk.img"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.machine.log_level, "info");
        assert_eq!(config.machine.initiator, 7);
        assert_eq!(config.disk.len(), 1);
        assert_eq!(config.disk[0].backend, BackendType::File);
        assert_eq!(config.disk[0].block_size, 512);
        assert!(!config.disk[0].read_only);
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[machine]
log_level = "debug"
bus_id = 1
initiator = 6
snapshot = "/tmp/machine.snap"

[[disk]]
target = 0
path = "/data/hd.img"
size = 104857600
model = "QUANTUM FIREBALL"

[[disk]]
target = 3
backend = "memory"
size = 681574400
block_size = 2048
read_only = true

[[port]]
name = "latch"
base = 0x300
count = 8
width = 2
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.machine.log_level, "debug");
        assert_eq!(config.machine.bus_id, 1);
        assert_eq!(config.disk[0].model.as_deref(), Some("QUANTUM FIREBALL"));
        assert_eq!(config.disk[1].backend, BackendType::Memory);
        assert_eq!(config.disk[1].block_size, 2048);
        assert!(config.disk[1].read_only);
        assert_eq!(config.port[0].base, 0x300);
        assert_eq!(config.port[0].width, 2);
    }

    #[test]
    fn test_duplicate_target_error() {
        let config_str = r#"
[[disk]]
target = 1
path = "/data/disk1.img"

[[disk]]
target = 1
path = "/data/disk2.img"
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_target_out_of_range_error() {
        let result = Config::parse("[[disk]]\ntarget = 16\npath = \"x.img\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_backend_settings_error() {
        assert!(matches!(
            Config::parse("[[disk]]\ntarget = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[[disk]]\ntarget = 0\nbackend = \"memory\"\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_oversized_memory_disk_error() {
        let result = Config::parse(
            "[[disk]]\ntarget = 0\nbackend = \"memory\"\nsize = 9223372036854775807\n",
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let at_limit = format!(
            "[[disk]]\ntarget = 0\nbackend = \"memory\"\nsize = {}\n",
            MAX_MEMORY_SIZE
        );
        assert!(Config::parse(&at_limit).is_ok());
    }

    #[test]
    fn test_bad_block_size_error() {
        let result = Config::parse("[[disk]]\ntarget = 0\npath = \"x.img\"\nblock_size = 1000\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_port_width_error() {
        let result = Config::parse("[[port]]\nbase = 0x10\ncount = 2\nwidth = 3\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
