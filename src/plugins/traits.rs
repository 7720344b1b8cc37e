//! Shared plugin types.
//!
//! These types describe a plugin's declared contract (capabilities, budgets,
//! permitted output channels) and the introspection slots the registry reads.
//! They are serializable where they cross the manifest or devtools boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Output channel a plugin may emit to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Structured log lines
    Log,
    /// Numeric samples
    Metric,
    /// Visual overlay annotations
    Overlay,
}

impl Channel {
    /// Every channel, in wire-id order.
    pub const ALL: [Channel; 3] = [Channel::Log, Channel::Metric, Channel::Overlay];

    /// Stable name used in manifests and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Metric => "metric",
            Self::Overlay => "overlay",
        }
    }

    /// Numeric id used by the binary-module ABI.
    pub fn id(self) -> u32 {
        match self {
            Self::Log => 1,
            Self::Metric => 2,
            Self::Overlay => 3,
        }
    }

    /// Map a guest channel id to a channel. Unknown ids fall through to
    /// `Overlay`.
    pub fn from_id(id: u32) -> Self {
        match id {
            1 => Self::Log,
            2 => Self::Metric,
            _ => Self::Overlay,
        }
    }

    /// Parse a channel name.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "log" => Some(Self::Log),
            "metric" => Some(Self::Metric),
            "overlay" => Some(Self::Overlay),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implementation substrate of a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PluginRuntime {
    /// In-process callback module
    #[default]
    #[serde(alias = "js")]
    Native,
    /// Untrusted WebAssembly module driven through the host bridge
    #[serde(alias = "wasm")]
    Binary,
}

impl PluginRuntime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Binary => "binary",
        }
    }
}

impl fmt::Display for PluginRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Budgets ─────────────────────────────────────────────────────────────────

/// Default CPU hint per tick, in milliseconds.
pub const DEFAULT_CPU_MS_PER_TICK: u32 = 4;
/// Default memory hint, in megabytes.
pub const DEFAULT_MEMORY_MB: u32 = 32;
/// Default emit rate.
pub const DEFAULT_EVENTS_PER_SECOND: u32 = 200;
/// Default output throughput.
pub const DEFAULT_OUTPUT_BYTES_PER_SECOND: u64 = 64_000;

/// Quota configuration applied to one plugin.
///
/// CPU and memory are advisory hints surfaced through introspection; the
/// event and byte rates drive the plugin's token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Budgets {
    pub cpu_ms_per_tick: u32,
    #[serde(rename = "memoryMB", alias = "memoryMb")]
    pub memory_mb: u32,
    pub events_per_second: u32,
    pub output_bytes_per_second: u64,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            cpu_ms_per_tick: DEFAULT_CPU_MS_PER_TICK,
            memory_mb: DEFAULT_MEMORY_MB,
            events_per_second: DEFAULT_EVENTS_PER_SECOND,
            output_bytes_per_second: DEFAULT_OUTPUT_BYTES_PER_SECOND,
        }
    }
}

impl Budgets {
    /// Apply per-field overrides on top of `self`.
    pub fn merged(self, overrides: &BudgetOverrides) -> Self {
        Self {
            cpu_ms_per_tick: overrides.cpu_ms_per_tick.unwrap_or(self.cpu_ms_per_tick),
            memory_mb: overrides.memory_mb.unwrap_or(self.memory_mb),
            events_per_second: overrides.events_per_second.unwrap_or(self.events_per_second),
            output_bytes_per_second: overrides
                .output_bytes_per_second
                .unwrap_or(self.output_bytes_per_second),
        }
    }
}

/// Partial budget declaration; absent fields take the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_ms_per_tick: Option<u32>,
    #[serde(
        rename = "memoryMB",
        alias = "memoryMb",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_per_second: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bytes_per_second: Option<u64>,
}

impl From<Budgets> for BudgetOverrides {
    fn from(budgets: Budgets) -> Self {
        Self {
            cpu_ms_per_tick: Some(budgets.cpu_ms_per_tick),
            memory_mb: Some(budgets.memory_mb),
            events_per_second: Some(budgets.events_per_second),
            output_bytes_per_second: Some(budgets.output_bytes_per_second),
        }
    }
}

impl BudgetOverrides {
    pub fn events_per_second(mut self, value: u32) -> Self {
        self.events_per_second = Some(value);
        self
    }

    pub fn output_bytes_per_second(mut self, value: u64) -> Self {
        self.output_bytes_per_second = Some(value);
        self
    }
}

// ── Capability contract ─────────────────────────────────────────────────────

/// Declared read and write capabilities.
///
/// `mutate` exists so that a plugin asking for write access can be named and
/// refused; the registry never stores a record with a non-empty `mutate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityContract {
    pub observe: Vec<String>,
    pub mutate: Vec<String>,
}

impl CapabilityContract {
    pub fn observe_only(observe: Vec<String>) -> Self {
        Self {
            observe,
            mutate: Vec::new(),
        }
    }
}

/// Deduplicate and drop blank capability strings, keeping first-seen order.
pub fn unique_strings(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if value.trim().is_empty() || out.contains(value) {
            continue;
        }
        out.push(value.clone());
    }
    out
}

// ── Introspection slots ─────────────────────────────────────────────────────

pub type StatusFn = Arc<dyn Fn() -> Value + Send + Sync>;
pub type DataFn = Arc<dyn Fn() -> Value + Send + Sync>;
/// Returns the plugin's error history; empty means healthy.
pub type ErrorFn = Arc<dyn Fn() -> anyhow::Result<Vec<String>> + Send + Sync>;
pub type PerfFn = Arc<dyn Fn() -> Value + Send + Sync>;
/// Appends a message to the plugin's own error history.
pub type ReportFn = Arc<dyn Fn(&str) + Send + Sync>;
/// Teardown hook run when a plugin transitions to disabled.
pub type TeardownFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Read-only introspection surface of a plugin.
///
/// Every method returns an owned snapshot; implementations must not hand out
/// references into live state.
pub trait Introspect: Send + Sync {
    fn status(&self) -> Value;
    fn data(&self) -> Value;
    fn error(&self) -> anyhow::Result<Vec<String>>;
    fn perf(&self) -> Value {
        Value::Null
    }
    /// Record a host-flagged failure. Plugins without a history ignore it.
    fn report(&self, _message: &str) {}
}

/// Accessor slots as supplied at registration.
///
/// Slots are optional so that the registry can check the contract
/// structurally and name what is missing.
#[derive(Clone, Default)]
pub struct Accessors {
    pub status: Option<StatusFn>,
    pub data: Option<DataFn>,
    pub error: Option<ErrorFn>,
    pub perf: Option<PerfFn>,
    pub report: Option<ReportFn>,
}

impl Accessors {
    /// Build every slot from an [`Introspect`] implementation.
    pub fn from_introspect<T: Introspect + 'static>(source: Arc<T>) -> Self {
        let status = Arc::clone(&source);
        let data = Arc::clone(&source);
        let error = Arc::clone(&source);
        let perf = Arc::clone(&source);
        let report = source;
        Self {
            status: Some(Arc::new(move || status.status())),
            data: Some(Arc::new(move || data.data())),
            error: Some(Arc::new(move || error.error())),
            perf: Some(Arc::new(move || perf.perf())),
            report: Some(Arc::new(move |message: &str| report.report(message))),
        }
    }

    /// Names of required slots that are absent.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.status.is_none() {
            missing.push("status");
        }
        if self.data.is_none() {
            missing.push("data");
        }
        if self.error.is_none() {
            missing.push("error");
        }
        missing
    }
}

impl fmt::Debug for Accessors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessors")
            .field("status", &self.status.is_some())
            .field("data", &self.data.is_some())
            .field("error", &self.error.is_some())
            .field("perf", &self.perf.is_some())
            .field("report", &self.report.is_some())
            .finish()
    }
}
