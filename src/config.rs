//! Audit options
//!
//! Read once at initialisation and immutable for the rest of the process
//! lifetime. Options come either from an `flowaudit.toml` file or from the
//! replay binary's flags.
//!
//! # Example flowaudit.toml
//!
//! ```toml
//! monitor = true
//! record_xhash = true
//! meta_on_clock = false
//! dataset_home = "/var/lib/flowaudit/firefox"
//! watched_syscalls = [9, 10, 59]
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors while loading options
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid option: {0}")]
    Invalid(String),
}

/// x86_64 syscalls that can materialise or reshape code ("stack spy" set)
pub const DEFAULT_WATCHED_SYSCALLS: &[i64] = &[
    9,   // mmap
    10,  // mprotect
    25,  // mremap
    56,  // clone
    57,  // fork
    58,  // vfork
    59,  // execve
    322, // execveat
    329, // pkey_mprotect
];

/// Process-wide audit toggles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditOptions {
    /// Monitor control flow (enables suspicious-syscall annotation)
    pub monitor: bool,

    /// Record a hash for every edge that crosses a module boundary
    pub record_xhash: bool,

    /// Track socket handles and handle-based waits
    pub network_monitor: bool,

    /// Emit a statistics record on every heartbeat tick
    pub meta_on_clock: bool,

    /// Home directory of the monitored program's dataset
    pub dataset_home: Option<PathBuf>,

    /// Syscall numbers routed through the audit path
    pub watched_syscalls: Vec<i64>,

    /// Capacity of the bounded record queue
    pub record_queue_capacity: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            monitor: false,
            record_xhash: false,
            network_monitor: false,
            meta_on_clock: false,
            dataset_home: None,
            watched_syscalls: DEFAULT_WATCHED_SYSCALLS.to_vec(),
            record_queue_capacity: 8192,
        }
    }
}

impl AuditOptions {
    /// Load options from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&content)
    }

    /// Load options from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate option values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.record_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "record_queue_capacity must be > 0".to_string(),
            ));
        }

        if let Some(home) = &self.dataset_home {
            if home.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "dataset_home must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}
