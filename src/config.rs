//! Registry and host-bridge configuration.
//!
//! Read from TOML; every field has a default so an empty or missing file is
//! a valid configuration.
//!
//! ```toml
//! max_plugins = 64
//! default_outputs = ["log", "metric"]
//!
//! [default_budgets]
//! eventsPerSecond = 50
//!
//! [bridge]
//! fuel_limit = 500000
//! ```

use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::plugins::traits::{Budgets, Channel};

/// Default fuel granted to every guest call (loop guard, not a CPU budget).
pub const DEFAULT_FUEL_LIMIT: u64 = 1_000_000;

/// Default memory cap for guest modules, in 64 KiB pages (16 MiB).
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 256;

fn default_max_plugins() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_fallback_event_bytes() -> usize {
    256
}

fn default_min_bytes_per_second() -> u64 {
    1024
}

fn default_outputs() -> Vec<Channel> {
    Channel::ALL.to_vec()
}

fn default_fuel_limit() -> u64 {
    DEFAULT_FUEL_LIMIT
}

fn default_max_memory_pages() -> u32 {
    DEFAULT_MAX_MEMORY_PAGES
}

/// Plugin registry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginsConfig {
    /// Maximum number of registered plugins
    #[serde(default = "default_max_plugins")]
    pub max_plugins: usize,

    /// Reject registrations missing `status`, `data` or `error` accessors.
    /// When false, missing accessors are filled with empty defaults.
    #[serde(default = "default_true")]
    pub strict_introspection: bool,

    /// Byte cost charged for an event that cannot be serialized
    #[serde(default = "default_fallback_event_bytes")]
    pub fallback_event_bytes: usize,

    /// Floor for every plugin's byte rate
    #[serde(default = "default_min_bytes_per_second")]
    pub min_bytes_per_second: u64,

    /// Budgets applied where a plugin declares none
    #[serde(default)]
    pub default_budgets: Budgets,

    /// Channels granted where a plugin declares none
    #[serde(default = "default_outputs")]
    pub default_outputs: Vec<Channel>,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            max_plugins: default_max_plugins(),
            strict_introspection: true,
            fallback_event_bytes: default_fallback_event_bytes(),
            min_bytes_per_second: default_min_bytes_per_second(),
            default_budgets: Budgets::default(),
            default_outputs: default_outputs(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// WASM host bridge limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    /// Fuel granted to each guest call
    #[serde(default = "default_fuel_limit")]
    pub fuel_limit: u64,

    /// Linear memory cap, in 64 KiB pages
    #[serde(default = "default_max_memory_pages")]
    pub max_memory_pages: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fuel_limit: DEFAULT_FUEL_LIMIT,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }
}

impl PluginsConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Failed to parse plugin config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded plugin config");
        Ok(config)
    }

    /// `<config dir>/warden/config.toml`, when the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "warden")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_plugins == 0 {
            bail!("max_plugins must be at least 1");
        }
        if self.default_outputs.is_empty() {
            bail!("default_outputs must name at least one channel");
        }
        if self.bridge.fuel_limit == 0 {
            bail!("bridge.fuel_limit must be positive");
        }
        if self.bridge.max_memory_pages == 0 {
            bail!("bridge.max_memory_pages must be positive");
        }
        Ok(())
    }
}

/// JSON schema of [`PluginsConfig`].
pub fn schema_json() -> Result<String> {
    let schema = schemars::schema_for!(PluginsConfig);
    serde_json::to_string_pretty(&schema).context("Failed to render config schema")
}
