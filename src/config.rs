//! Runtime configuration for the worker process.
//!
//! Configuration is loaded from an optional JSON file named on the command
//! line; every field has a default, so a missing or unparsable file never
//! prevents startup. The resolved [`WorkerConfig`] is built once in `main`
//! and passed down immutably.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Config file consulted when no path is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "WorkerConfig.json";

/// Command-line arguments: `matrix-worker <Address:Port> [ConfigFile]`.
#[derive(Parser, Debug, Clone)]
#[command(name = "matrix-worker", about = "Distributed matrix computation worker")]
pub struct Cli {
    /// Address to bind, e.g. "0.0.0.0:50051".
    pub address: String,

    /// Path to the worker configuration file (JSON).
    pub config: Option<PathBuf>,
}

impl Cli {
    /// The usage line printed when the argument contract is violated.
    pub fn usage(binary: &str) -> String {
        format!("Usage: {binary} <Address:Port> [ConfigFile]")
    }
}

/// How the service schedules concurrent calls. Fixed for the lifetime of
/// the process; there is no runtime switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    /// One blocking execution context per call, accept to response.
    Synchronous,
    /// A small set of polling contexts multiplexing many in-flight calls.
    Asynchronous,
}

impl std::fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingMode::Synchronous => write!(f, "synchronous"),
            SchedulingMode::Asynchronous => write!(f, "asynchronous"),
        }
    }
}

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Request serving settings.
    pub server: ServerConfig,

    /// Accelerator memory settings.
    pub device: DeviceConfig,

    /// Filesystem paths used by the worker.
    pub paths: PathsConfig,
}

/// Request serving settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Scheduling variant used to serve calls.
    pub scheduling: SchedulingMode,

    /// Maximum concurrently served connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingMode::Synchronous,
            max_connections: 32,
        }
    }
}

/// Accelerator memory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device memory budget in bytes for the host-emulated backend.
    /// Ignored when a real accelerator is detected.
    pub memory_budget: usize,

    /// Device index to use when multiple accelerators are present.
    pub device_id: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_budget: 256 * 1024 * 1024, // 256 MB
            device_id: 0,
        }
    }
}

/// Filesystem paths used by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory searched for precompiled kernel libraries. A relative
    /// path is resolved against the executable's directory at startup.
    pub lib_dir: PathBuf,

    /// Optional log file; stderr when absent.
    pub log_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            lib_dir: PathBuf::from("lib"),
            log_file: None,
        }
    }
}

/// Outcome of a config load, reported by the caller once logging is up
/// (the logging destination itself comes from the loaded config).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Values read from the file.
    File,
    /// File absent; defaults substituted.
    DefaultsFileMissing,
    /// File present but unreadable or unparsable; defaults substituted.
    DefaultsLoadFailed(String),
}

impl WorkerConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file is not an error: defaults apply. A file that exists
    /// but fails to read or parse is likewise recovered with defaults, so
    /// a bad config never aborts startup. The returned [`ConfigSource`]
    /// says which case occurred.
    pub fn load(path: &Path) -> (Self, ConfigSource) {
        if !path.exists() {
            return (Self::default(), ConfigSource::DefaultsFileMissing);
        }

        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<WorkerConfig>(&data) {
                Ok(config) => (config, ConfigSource::File),
                Err(e) => (
                    Self::default(),
                    ConfigSource::DefaultsLoadFailed(e.to_string()),
                ),
            },
            Err(e) => (
                Self::default(),
                ConfigSource::DefaultsLoadFailed(e.to_string()),
            ),
        }
    }

    /// Resolve a relative `lib_dir` against the executable's directory.
    ///
    /// Called once at startup, before the config is shared.
    pub fn resolve_lib_dir(&mut self) {
        if self.paths.lib_dir.is_relative() {
            if let Ok(exe) = std::env::current_exe() {
                if let Some(dir) = exe.parent() {
                    self.paths.lib_dir = dir.join(&self.paths.lib_dir);
                }
            }
        }
    }
}
