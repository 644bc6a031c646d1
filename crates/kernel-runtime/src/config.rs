//! Kernel launch configuration.
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/kernel-runtime/config.toml`
//! - macOS: `~/Library/Application Support/kernel-runtime/config.toml`
//! - Windows: `%APPDATA%\kernel-runtime\config.toml`
//!
//! Environment variables override file values:
//!
//! | Variable                            | Field               |
//! |-------------------------------------|---------------------|
//! | `KERNEL_RUNTIME_PROGRAM`            | `program`           |
//! | `KERNEL_RUNTIME_ARGS`               | `args` (whitespace) |
//! | `KERNEL_RUNTIME_HANDSHAKE_TIMEOUT`  | `handshake_timeout` |
//! | `KERNEL_RUNTIME_SHUTDOWN_TIMEOUT`   | `shutdown_timeout`  |

use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PROGRAM: &str = "KERNEL_RUNTIME_PROGRAM";
pub const ENV_ARGS: &str = "KERNEL_RUNTIME_ARGS";
pub const ENV_HANDSHAKE_TIMEOUT: &str = "KERNEL_RUNTIME_HANDSHAKE_TIMEOUT";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "KERNEL_RUNTIME_SHUTDOWN_TIMEOUT";

/// Default kernel executable, looked up in PATH.
pub const DEFAULT_PROGRAM: &str = "kernel-host";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How to launch and talk to the kernel process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Kernel executable: a path, or a bare name resolved through PATH.
    pub program: String,
    /// Arguments passed to the kernel.
    pub args: Vec<String>,
    /// Extra environment variables for the kernel process.
    pub env: BTreeMap<String, String>,
    /// Working directory for the kernel process (inherited if unset).
    pub working_dir: Option<PathBuf>,
    /// How long to wait for the kernel's greeting.
    #[serde(deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    /// How long to wait for a graceful exit before killing the kernel.
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl KernelConfig {
    /// Build a config that runs `program` with default settings.
    pub fn for_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Builder-style argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Builder-style shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from the default config file location.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load the config file if there is one, fall back to defaults, then
    /// apply environment overrides.
    ///
    /// A broken config file or override is logged and skipped.
    pub fn load_or_default() -> Self {
        let mut config = match Self::load() {
            Ok(config) => config,
            Err(Error::Config(msg)) => {
                log::debug!("{}, using defaults", msg);
                Self::default()
            }
            Err(e) => {
                log::warn!("Ignoring kernel config file: {}", e);
                Self::default()
            }
        };
        if let Err(e) = config.apply_env_overrides() {
            log::warn!("Ignoring kernel environment overrides: {}", e);
        }
        config
    }

    /// Get the default configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "kernel-runtime") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Fields are left untouched when a value fails to parse.
    pub fn apply_overrides<L>(&mut self, lookup: L) -> Result<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(program) = lookup(ENV_PROGRAM).filter(|p| !p.trim().is_empty()) {
            self.program = program.trim().to_string();
        }
        if let Some(args) = lookup(ENV_ARGS) {
            self.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = lookup(ENV_HANDSHAKE_TIMEOUT) {
            self.handshake_timeout = parse_duration(ENV_HANDSHAKE_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_TIMEOUT) {
            self.shutdown_timeout = parse_duration(ENV_SHUTDOWN_TIMEOUT, &value)?;
        }
        Ok(())
    }
}

fn parse_duration(what: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::Config(format!("Invalid duration '{}' for {}: {}", value, what, e)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(value.trim()).map_err(serde::de::Error::custom)
}
