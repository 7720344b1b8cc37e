//! Plugin registry: the authoritative store of plugin records.
//!
//! The registry validates capability contracts, enforces capacity and
//! case-insensitive uniqueness, owns each plugin's token bucket, and
//! aggregates introspection for devtools. Plugins never receive a reference
//! to it; registering code gets a [`PluginHandle`] bound to one record.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::PluginsConfig;

use super::bucket::TokenBucket;
use super::error::{PluginError, Result};
use super::sinks::{OutputSinks, SinkOverrides};
use super::traits::{
    unique_strings, Accessors, BudgetOverrides, Budgets, CapabilityContract, Channel, DataFn,
    ErrorFn, PerfFn, PluginRuntime, ReportFn, StatusFn, TeardownFn,
};

/// Run plugin-supplied code, turning a panic into an error message.
pub(crate) fn guarded<T>(f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "plugin code panicked".to_string()
    }
}

/// Normalized lookup key: labels are unique regardless of casing.
pub fn key_of(label: &str) -> String {
    label.to_lowercase()
}

/// Registration request.
#[derive(Clone, Default)]
pub struct PluginMeta {
    /// Display label (required, non-blank)
    pub label: String,
    /// Stable id; defaults to `plugin:<label>`
    pub id: Option<String>,
    /// Version string; defaults to `0.0.0`
    pub version: Option<String>,
    /// Whether the plugin is listed publicly; defaults to `true`
    pub public: Option<bool>,
    pub runtime: PluginRuntime,
    pub contract: CapabilityContract,
    pub budgets: Option<BudgetOverrides>,
    /// Permitted channels; empty means the configured default set
    pub outputs: Vec<Channel>,
    pub accessors: Accessors,
    pub disable: Option<TeardownFn>,
    /// Register as an activation stub awaiting `upgrade`
    pub activating: bool,
}

impl PluginMeta {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_accessors(mut self, accessors: Accessors) -> Self {
        self.accessors = accessors;
        self
    }

    pub fn with_budgets(mut self, budgets: BudgetOverrides) -> Self {
        self.budgets = Some(budgets);
        self
    }

    pub fn with_contract(mut self, contract: CapabilityContract) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Channel>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_teardown(
        mut self,
        teardown: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.disable = Some(Arc::new(teardown));
        self
    }
}

/// Activation phase of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Async stub registered, factory not yet settled
    Activating,
    /// Final accessors installed
    Ready,
}

/// Observable lifecycle state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginLifecycle {
    Activating,
    Active,
    ActiveWithErrors,
    Disabled,
}

/// Immutable plugin record. Changes produce a new record.
#[derive(Clone)]
pub struct PluginRecord {
    id: String,
    label: String,
    key: String,
    version: String,
    public: bool,
    runtime: PluginRuntime,
    observe: Vec<String>,
    mutate: Vec<String>,
    budgets: Budgets,
    outputs: Vec<Channel>,
    registered_at: DateTime<Utc>,
    enabled: bool,
    phase: Phase,
    status: StatusFn,
    data: DataFn,
    error: ErrorFn,
    perf: PerfFn,
    report: Option<ReportFn>,
    teardown: Option<TeardownFn>,
}

impl PluginRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn runtime(&self) -> PluginRuntime {
        self.runtime
    }

    pub fn observe(&self) -> &[String] {
        &self.observe
    }

    /// Always empty for a stored record.
    pub fn mutate(&self) -> &[String] {
        &self.mutate
    }

    pub fn budgets(&self) -> Budgets {
        self.budgets
    }

    pub fn outputs(&self) -> &[Channel] {
        &self.outputs
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> Value {
        guarded(|| (self.status)()).unwrap_or(Value::Null)
    }

    pub fn data(&self) -> Value {
        guarded(|| (self.data)()).unwrap_or(Value::Null)
    }

    /// The plugin's error history. A failing or panicking accessor is
    /// reported as an error.
    pub fn error(&self) -> std::result::Result<Vec<String>, String> {
        match guarded(|| (self.error)()) {
            Ok(Ok(history)) => Ok(history),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic),
        }
    }

    pub fn perf(&self) -> Value {
        guarded(|| (self.perf)()).unwrap_or(Value::Null)
    }

    pub fn has_error(&self) -> bool {
        self.error().map(|history| !history.is_empty()).unwrap_or(true)
    }

    pub fn lifecycle(&self) -> PluginLifecycle {
        if !self.enabled {
            PluginLifecycle::Disabled
        } else if self.has_error() {
            PluginLifecycle::ActiveWithErrors
        } else if self.phase == Phase::Activating {
            PluginLifecycle::Activating
        } else {
            PluginLifecycle::Active
        }
    }
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("version", &self.version)
            .field("runtime", &self.runtime)
            .field("enabled", &self.enabled)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Public per-plugin summary returned by [`PluginRegistry::data`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: String,
    pub label: String,
    pub version: String,
    pub runtime: PluginRuntime,
    pub public: bool,
    pub observe: Vec<String>,
    pub budgets: Budgets,
    pub outputs: Vec<Channel>,
    pub enabled: bool,
    pub perf: Value,
    pub has_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryData {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub count: usize,
    pub plugins: Vec<PluginSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub label: String,
    pub error: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub error_count: usize,
    pub errors: Vec<ErrorEntry>,
}

const REGISTRY_KIND: &str = "plugin-registry";

struct Entry {
    record: Arc<PluginRecord>,
    bucket: Arc<Mutex<TokenBucket>>,
    seq: u64,
}

struct Plugins {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

struct RegistryInner {
    config: PluginsConfig,
    plugins: RwLock<Plugins>,
    sinks: RwLock<OutputSinks>,
}

impl RegistryInner {
    fn record(&self, key: &str) -> Option<Arc<PluginRecord>> {
        self.plugins
            .read()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.record))
    }

    /// The entry registered as `seq` under `key`, if it is still there.
    fn owned(&self, key: &str, seq: u64) -> Option<(Arc<PluginRecord>, Arc<Mutex<TokenBucket>>)> {
        self.plugins
            .read()
            .entries
            .get(key)
            .filter(|entry| entry.seq == seq)
            .map(|entry| (Arc::clone(&entry.record), Arc::clone(&entry.bucket)))
    }

    fn estimate_bytes(&self, event: &Value) -> usize {
        match event {
            Value::String(s) => s.len(),
            other => serde_json::to_string(other)
                .map(|s| s.len())
                .unwrap_or(self.config.fallback_event_bytes),
        }
    }

    fn deliver(&self, channel: Channel, event: &Value) -> bool {
        let sink = self.sinks.read().get(channel);
        match guarded(|| sink(event)) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(channel = %channel, error = %e, "Output sink failed, event dropped");
                false
            }
            Err(panic) => {
                tracing::warn!(channel = %channel, error = %panic, "Output sink panicked, event dropped");
                false
            }
        }
    }
}

/// Registry of plugin records.
///
/// Cloning yields another handle to the same store. Every mutation takes the
/// store's write lock, so record replacement is atomic per key.
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RegistryInner>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new(config: PluginsConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                plugins: RwLock::new(Plugins {
                    entries: HashMap::new(),
                    next_seq: 0,
                }),
                sinks: RwLock::new(OutputSinks::default()),
            }),
        }
    }

    pub fn config(&self) -> &PluginsConfig {
        &self.inner.config
    }

    /// Register a plugin and return the owner's mutation handle.
    pub fn register(&self, meta: PluginMeta) -> Result<PluginHandle> {
        let label = meta.label.trim();
        if label.is_empty() {
            return Err(PluginError::Validation(
                "label must be a non-empty string".into(),
            ));
        }
        let label = meta.label.clone();
        let key = key_of(&label);
        let config = &self.inner.config;

        let mut plugins = self.inner.plugins.write();

        if plugins.entries.contains_key(&key) {
            return Err(PluginError::DuplicatePlugin(label));
        }
        if plugins.entries.len() >= config.max_plugins {
            return Err(PluginError::CapacityExceeded(config.max_plugins));
        }
        if !meta.contract.mutate.is_empty() {
            return Err(PluginError::contract(
                &label,
                format!(
                    "mutations are not permitted for plugins (requested: {})",
                    meta.contract.mutate.join(", ")
                ),
            ));
        }

        let Accessors {
            status,
            data,
            error,
            perf,
            report,
        } = meta.accessors;
        let (status, data, error) = match (status, data, error) {
            (Some(status), Some(data), Some(error)) => (status, data, error),
            (status, data, error) if config.strict_introspection => {
                let missing = Accessors {
                    status,
                    data,
                    error,
                    ..Accessors::default()
                }
                .missing();
                return Err(PluginError::MissingIntrospection { label, missing });
            }
            (status, data, error) => (
                status.unwrap_or_else(|| Arc::new(|| Value::Null)),
                data.unwrap_or_else(|| Arc::new(|| Value::Null)),
                error.unwrap_or_else(|| Arc::new(|| Ok(Vec::new()))),
            ),
        };
        let perf = perf.unwrap_or_else(|| Arc::new(|| Value::Null));

        let budgets = match &meta.budgets {
            Some(overrides) => config.default_budgets.merged(overrides),
            None => config.default_budgets,
        };
        let mut outputs: Vec<Channel> = Vec::new();
        for channel in &meta.outputs {
            if !outputs.contains(channel) {
                outputs.push(*channel);
            }
        }
        if outputs.is_empty() {
            outputs = config.default_outputs.clone();
        }

        let id = match meta.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("plugin:{label}"),
        };
        let version = match meta.version.as_deref().map(str::trim) {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => "0.0.0".to_string(),
        };

        let record = Arc::new(PluginRecord {
            id,
            label: label.clone(),
            key: key.clone(),
            version,
            public: meta.public.unwrap_or(true),
            runtime: meta.runtime,
            observe: unique_strings(&meta.contract.observe),
            mutate: Vec::new(),
            budgets,
            outputs,
            registered_at: Utc::now(),
            enabled: true,
            phase: if meta.activating {
                Phase::Activating
            } else {
                Phase::Ready
            },
            status,
            data,
            error,
            perf,
            report,
            teardown: meta.disable,
        });

        let bucket = Arc::new(Mutex::new(TokenBucket::new(
            budgets.events_per_second,
            budgets.output_bytes_per_second,
            config.min_bytes_per_second,
        )));

        let seq = plugins.next_seq;
        plugins.next_seq += 1;
        plugins.entries.insert(
            key.clone(),
            Entry {
                record: Arc::clone(&record),
                bucket,
                seq,
            },
        );
        drop(plugins);

        tracing::info!(
            plugin = %label,
            id = %record.id,
            runtime = %record.runtime,
            version = %record.version,
            activating = meta.activating,
            "Registered plugin"
        );

        Ok(PluginHandle {
            inner: Arc::clone(&self.inner),
            key,
            label,
            seq,
        })
    }

    /// Replace the sinks for the channels given; others are kept.
    pub fn set_output_sinks(&self, sinks: SinkOverrides) {
        tracing::debug!(
            log = sinks.log.is_some(),
            metric = sinks.metric.is_some(),
            overlay = sinks.overlay.is_some(),
            "Wiring output sinks"
        );
        self.inner.sinks.write().apply(sinks);
    }

    /// Deliver a host event straight to a channel's sink, outside any
    /// plugin budget.
    pub fn deliver(&self, channel: Channel, event: &Value) -> bool {
        self.inner.deliver(channel, event)
    }

    /// Enable a plugin. Idempotent.
    pub fn enable(&self, label: &str) -> Option<Arc<PluginRecord>> {
        let key = key_of(label);
        let mut plugins = self.inner.plugins.write();
        let entry = plugins.entries.get_mut(&key)?;
        if entry.record.enabled {
            return Some(Arc::clone(&entry.record));
        }
        let mut updated = PluginRecord::clone(&entry.record);
        updated.enabled = true;
        entry.record = Arc::new(updated);
        tracing::debug!(plugin = %label, "Plugin enabled");
        Some(Arc::clone(&entry.record))
    }

    /// Disable a plugin and run its teardown hook once per transition.
    ///
    /// Teardown failures are logged; the plugin stays disabled.
    pub fn disable(&self, label: &str) -> Option<Arc<PluginRecord>> {
        let key = key_of(label);
        let updated = {
            let mut plugins = self.inner.plugins.write();
            let entry = plugins.entries.get_mut(&key)?;
            if !entry.record.enabled {
                return Some(Arc::clone(&entry.record));
            }
            let mut updated = PluginRecord::clone(&entry.record);
            updated.enabled = false;
            entry.record = Arc::new(updated);
            Arc::clone(&entry.record)
        };

        if let Some(teardown) = &updated.teardown {
            match guarded(|| teardown()) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(plugin = %label, error = %e, "Plugin disable hook failed");
                }
                Err(panic) => {
                    tracing::error!(plugin = %label, error = %panic, "Plugin disable hook panicked");
                }
            }
        }
        tracing::debug!(plugin = %label, "Plugin disabled");
        Some(updated)
    }

    /// Remove a plugin entirely. Returns whether it existed.
    pub fn unregister(&self, label: &str) -> bool {
        let removed = self
            .inner
            .plugins
            .write()
            .entries
            .remove(&key_of(label))
            .is_some();
        if removed {
            tracing::debug!(plugin = %label, "Plugin unregistered");
        }
        removed
    }

    pub fn get(&self, label: &str) -> Option<Arc<PluginRecord>> {
        self.inner.record(&key_of(label))
    }

    pub fn has(&self, label: &str) -> bool {
        self.inner.plugins.read().entries.contains_key(&key_of(label))
    }

    /// Every record, in registration order.
    pub fn list(&self) -> Vec<Arc<PluginRecord>> {
        let plugins = self.inner.plugins.read();
        let mut entries: Vec<&Entry> = plugins.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| Arc::clone(&entry.record))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.plugins.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Public summaries of every plugin.
    pub fn data(&self) -> RegistryData {
        let plugins: Vec<PluginSummary> = self
            .list()
            .iter()
            .map(|record| PluginSummary {
                id: record.id.clone(),
                label: record.label.clone(),
                version: record.version.clone(),
                runtime: record.runtime,
                public: record.public,
                observe: record.observe.clone(),
                budgets: record.budgets,
                outputs: record.outputs.clone(),
                enabled: record.enabled,
                perf: record.perf(),
                has_error: record.has_error(),
            })
            .collect();
        RegistryData {
            kind: REGISTRY_KIND,
            count: plugins.len(),
            plugins,
        }
    }

    /// Aggregated counts and per-plugin error reports.
    pub fn status(&self) -> RegistryStatus {
        let all = self.list();
        let enabled = all.iter().filter(|record| record.enabled).count();

        let mut errors = Vec::new();
        let mut error_count = 0;
        for record in &all {
            match record.error() {
                Ok(history) if history.is_empty() => {}
                Ok(history) => {
                    error_count += history.len();
                    errors.push(ErrorEntry {
                        label: record.label.clone(),
                        error: history,
                    });
                }
                Err(message) => {
                    error_count += 1;
                    errors.push(ErrorEntry {
                        label: record.label.clone(),
                        error: vec![message],
                    });
                }
            }
        }

        RegistryStatus {
            kind: REGISTRY_KIND,
            total: all.len(),
            enabled,
            disabled: all.len() - enabled,
            error_count,
            errors,
        }
    }

    /// Remove every record. Does nothing unless `force` is set.
    pub fn clear(&self, force: bool) {
        if !force {
            tracing::debug!("Registry clear ignored without force");
            return;
        }
        self.inner.plugins.write().entries.clear();
    }

    /// Disable every enabled plugin, running teardown hooks, then clear.
    pub fn shutdown(&self) {
        let labels: Vec<String> = self
            .list()
            .iter()
            .filter(|record| record.enabled)
            .map(|record| record.label.clone())
            .collect();
        for label in &labels {
            self.disable(label);
        }
        self.clear(true);
        tracing::info!(disabled = labels.len(), "Plugin registry shut down");
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("max_plugins", &self.inner.config.max_plugins)
            .field("plugin_count", &self.len())
            .finish_non_exhaustive()
    }
}

/// Mutation capability for one record, held only by the registering code.
///
/// A handle is bound to the registration that created it. Once that record
/// is unregistered the handle is inert, even if another plugin later takes
/// the same key.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<RegistryInner>,
    key: String,
    label: String,
    seq: u64,
}

impl PluginHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Emit an event to a permitted channel, subject to the plugin's budget.
    ///
    /// Returns `false` when the channel is not permitted, the plugin is
    /// disabled or gone, the bucket is empty, or the sink fails.
    pub fn emit(&self, channel: Channel, event: &Value) -> bool {
        let Some((record, bucket)) = self.inner.owned(&self.key, self.seq) else {
            return false;
        };
        if !record.enabled || !record.outputs.contains(&channel) {
            return false;
        }
        let bytes = self.inner.estimate_bytes(event);
        if !bucket.lock().try_consume(bytes) {
            tracing::trace!(plugin = %self.label, channel = %channel, bytes, "Emit rate limited");
            return false;
        }
        self.inner.deliver(channel, event)
    }

    /// Swap the record's introspection slots, keeping its identity.
    ///
    /// Slots absent from `next` keep their current value. Returns `false`
    /// if the record no longer exists.
    pub fn upgrade(&self, next: Accessors) -> bool {
        let mut plugins = self.inner.plugins.write();
        let Some(entry) = self.owned_entry(&mut plugins) else {
            tracing::debug!(plugin = %self.label, "Upgrade for a record that is gone");
            return false;
        };
        let mut updated = PluginRecord::clone(&entry.record);
        if let Some(status) = next.status {
            updated.status = status;
        }
        if let Some(data) = next.data {
            updated.data = data;
        }
        if let Some(error) = next.error {
            updated.error = error;
        }
        if let Some(perf) = next.perf {
            updated.perf = perf;
        }
        if let Some(report) = next.report {
            updated.report = Some(report);
        }
        updated.phase = Phase::Ready;
        entry.record = Arc::new(updated);
        drop(plugins);
        tracing::debug!(plugin = %self.label, "Plugin accessors upgraded");
        true
    }

    /// Ask the plugin to record an error in its own history.
    ///
    /// Returns whether a reporter accepted the message.
    pub fn flag_error(&self, message: &str) -> bool {
        let Some((record, _)) = self.inner.owned(&self.key, self.seq) else {
            return false;
        };
        let Some(report) = &record.report else {
            return false;
        };
        match guarded(|| report(message)) {
            Ok(()) => true,
            Err(panic) => {
                tracing::warn!(plugin = %self.label, error = %panic, "Plugin error reporter panicked");
                false
            }
        }
    }

    /// Install or replace the teardown hook.
    pub(crate) fn set_teardown(&self, teardown: TeardownFn) -> bool {
        let mut plugins = self.inner.plugins.write();
        let Some(entry) = self.owned_entry(&mut plugins) else {
            return false;
        };
        let mut updated = PluginRecord::clone(&entry.record);
        updated.teardown = Some(teardown);
        entry.record = Arc::new(updated);
        true
    }
}

impl PluginHandle {
    fn owned_entry<'a>(&self, plugins: &'a mut Plugins) -> Option<&'a mut Entry> {
        plugins
            .entries
            .get_mut(&self.key)
            .filter(|entry| entry.seq == self.seq)
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::error::PluginErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn accessors() -> Accessors {
        Accessors {
            status: Some(Arc::new(|| json!({"state": "ok"}))),
            data: Some(Arc::new(|| json!({}))),
            error: Some(Arc::new(|| Ok(Vec::new()))),
            ..Accessors::default()
        }
    }

    fn meta(label: &str) -> PluginMeta {
        PluginMeta::new(label).with_accessors(accessors())
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new(PluginsConfig::default())
    }

    #[test]
    fn register_normalizes_key_and_defaults() {
        let registry = registry();
        registry.register(meta("Logger")).unwrap();
        assert!(registry.has("logger"));
        let record = registry.get("LOGGER").unwrap();
        assert_eq!(record.key(), "logger");
        assert_eq!(record.label(), "Logger");
        assert_eq!(record.id(), "plugin:Logger");
        assert_eq!(record.version(), "0.0.0");
        assert!(record.is_public());
        assert_eq!(record.outputs(), &Channel::ALL);
        assert_eq!(record.budgets(), Budgets::default());
        assert!(record.mutate().is_empty());
    }

    #[test]
    fn rejects_blank_label() {
        let err = registry().register(meta("  ")).err().unwrap();
        assert_eq!(err.kind(), PluginErrorKind::Validation);
    }

    #[test]
    fn rejects_case_variant_duplicates() {
        let registry = registry();
        registry.register(meta("Metrics")).unwrap();
        let err = registry.register(meta("metrics")).err().unwrap();
        assert_eq!(err.kind(), PluginErrorKind::DuplicatePlugin);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("metrics").unwrap().label(), "Metrics");
    }

    #[test]
    fn rejects_mutation_requests_without_side_effects() {
        let registry = registry();
        let request = meta("Writer").with_contract(CapabilityContract {
            observe: vec!["graph".into()],
            mutate: vec!["state".into()],
        });
        let err = registry.register(request).err().unwrap();
        assert_eq!(err.kind(), PluginErrorKind::ContractViolation);
        assert!(registry.is_empty());
    }

    #[test]
    fn rejects_missing_introspection() {
        let registry = registry();
        let request = PluginMeta::new("Bare").with_accessors(Accessors {
            status: Some(Arc::new(|| Value::Null)),
            ..Accessors::default()
        });
        match registry.register(request) {
            Err(PluginError::MissingIntrospection { missing, .. }) => {
                assert_eq!(missing, vec!["data", "error"]);
            }
            other => panic!("unexpected result: {:?}", other.map(|h| h.key().to_string())),
        }
        assert!(!registry.has("Bare"));
    }

    #[test]
    fn lenient_mode_fills_missing_accessors() {
        let config = PluginsConfig {
            strict_introspection: false,
            ..PluginsConfig::default()
        };
        let registry = PluginRegistry::new(config);
        registry.register(PluginMeta::new("Bare")).unwrap();
        assert!(!registry.get("bare").unwrap().has_error());
    }

    #[test]
    fn enforces_capacity() {
        let config = PluginsConfig {
            max_plugins: 2,
            ..PluginsConfig::default()
        };
        let registry = PluginRegistry::new(config);
        registry.register(meta("a")).unwrap();
        registry.register(meta("b")).unwrap();
        let err = registry.register(meta("c")).err().unwrap();
        assert_eq!(err.kind(), PluginErrorKind::CapacityExceeded);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn stale_handle_cannot_touch_successor() {
        let registry = registry();
        let stale = registry.register(meta("Twin")).unwrap();
        assert!(registry.unregister("twin"));
        let fresh = registry
            .register(meta("twin").with_outputs(vec![Channel::Log]))
            .unwrap();

        let swapped = Accessors {
            status: Some(Arc::new(|| json!({"state": "hijacked"}))),
            ..Accessors::default()
        };
        assert!(!stale.upgrade(swapped));
        assert!(!stale.emit(Channel::Log, &json!("old")));
        assert!(!stale.flag_error("old failure"));
        assert!(!stale.set_teardown(Arc::new(|| Ok::<_, anyhow::Error>(()))));

        let record = registry.get("twin").unwrap();
        assert_eq!(record.label(), "twin");
        assert_eq!(record.status()["state"], "ok");
        assert!(fresh.emit(Channel::Log, &json!("new")));
    }

    #[test]
    fn emit_respects_outputs_and_enabled() {
        let registry = registry();
        let handle = registry
            .register(meta("Overlayer").with_outputs(vec![Channel::Overlay]))
            .unwrap();
        assert!(!handle.emit(Channel::Log, &json!("nope")));
        assert!(handle.emit(Channel::Overlay, &json!({"x": 1})));
        registry.disable("overlayer");
        assert!(!handle.emit(Channel::Overlay, &json!({"x": 1})));
        registry.enable("overlayer");
        assert!(handle.emit(Channel::Overlay, &json!({"x": 1})));
    }

    #[test]
    fn emit_is_rate_limited() {
        let registry = registry();
        let handle = registry
            .register(meta("Logger").with_budgets(BudgetOverrides::default().events_per_second(2)))
            .unwrap();
        let results: Vec<bool> = (0..3).map(|_| handle.emit(Channel::Log, &json!("ev"))).collect();
        assert_eq!(results, vec![true, true, false]);
    }

    #[test]
    fn sink_failures_are_swallowed() {
        let registry = registry();
        registry.set_output_sinks(SinkOverrides::default().log(|_| anyhow::bail!("sink down")));
        let handle = registry.register(meta("Logger")).unwrap();
        assert!(!handle.emit(Channel::Log, &json!("x")));
        assert!(handle.emit(Channel::Metric, &json!(1)));
    }

    #[test]
    fn upgrade_keeps_identity() {
        let registry = registry();
        let mut request = meta("Async");
        request.activating = true;
        let handle = registry.register(request).unwrap();
        let before = registry.get("async").unwrap();
        assert_eq!(before.lifecycle(), PluginLifecycle::Activating);

        assert!(handle.upgrade(Accessors {
            status: Some(Arc::new(|| json!({"state": "ready"}))),
            perf: Some(Arc::new(|| json!({"duration": 1.5}))),
            ..Accessors::default()
        }));

        let after = registry.get("async").unwrap();
        assert_eq!(after.id(), before.id());
        assert_eq!(after.key(), before.key());
        assert_eq!(after.label(), before.label());
        assert_eq!(after.registered_at(), before.registered_at());
        assert_eq!(after.status()["state"], "ready");
        assert_eq!(after.perf()["duration"], 1.5);
        assert_eq!(after.lifecycle(), PluginLifecycle::Active);
    }

    #[test]
    fn upgrade_after_unregister_fails() {
        let registry = registry();
        let handle = registry.register(meta("Gone")).unwrap();
        assert!(registry.unregister("GONE"));
        assert!(!registry.unregister("gone"));
        assert!(!handle.upgrade(accessors()));
        assert!(!handle.emit(Channel::Log, &json!("x")));
    }

    #[test]
    fn disable_runs_teardown_once() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry
            .register(meta("Teardown").with_teardown(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        registry.disable("teardown");
        registry.disable("teardown");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.get("teardown").unwrap().enabled());
    }

    #[test]
    fn failing_teardown_still_disables() {
        let registry = registry();
        registry
            .register(meta("Broken").with_teardown(|| anyhow::bail!("cannot stop")))
            .unwrap();
        let record = registry.disable("broken").unwrap();
        assert!(!record.enabled());
        assert_eq!(record.lifecycle(), PluginLifecycle::Disabled);
    }

    #[test]
    fn status_treats_failing_error_accessor_as_error() {
        let registry = registry();
        registry.register(meta("Healthy")).unwrap();
        registry
            .register(PluginMeta::new("Faulty").with_accessors(Accessors {
                error: Some(Arc::new(|| anyhow::bail!("accessor broke"))),
                ..accessors()
            }))
            .unwrap();
        registry
            .register(PluginMeta::new("Noisy").with_accessors(Accessors {
                error: Some(Arc::new(|| Ok(vec!["one".into(), "two".into()]))),
                ..accessors()
            }))
            .unwrap();
        registry.disable("healthy");

        let status = registry.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.enabled, 2);
        assert_eq!(status.disabled, 1);
        assert_eq!(status.error_count, 3);
        assert_eq!(status.errors[0].label, "Faulty");
        assert_eq!(status.errors[0].error, vec!["accessor broke".to_string()]);

        let data = registry.data();
        assert_eq!(data.count, 3);
        let flags: Vec<bool> = data.plugins.iter().map(|p| p.has_error).collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn panicking_accessors_do_not_escape() {
        let registry = registry();
        registry
            .register(PluginMeta::new("Panicky").with_accessors(Accessors {
                error: Some(Arc::new(|| panic!("bad plugin"))),
                perf: Some(Arc::new(|| panic!("bad perf"))),
                ..accessors()
            }))
            .unwrap();
        let data = registry.data();
        assert!(data.plugins[0].has_error);
        assert_eq!(data.plugins[0].perf, Value::Null);
        assert_eq!(registry.status().errors[0].error, vec!["bad plugin".to_string()]);
    }

    #[test]
    fn clear_requires_force() {
        let registry = registry();
        registry.register(meta("a")).unwrap();
        registry.clear(false);
        assert_eq!(registry.len(), 1);
        registry.clear(true);
        assert!(registry.is_empty());
    }

    #[test]
    fn shutdown_tears_down_enabled_plugins() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        for label in ["a", "b"] {
            let counter = Arc::clone(&calls);
            registry
                .register(meta(label).with_teardown(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        registry.disable("b");
        registry.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn flag_error_reaches_reporter() {
        let registry = registry();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let store = Arc::clone(&seen);
        let handle = registry
            .register(PluginMeta::new("Reporter").with_accessors(Accessors {
                report: Some(Arc::new(move |message: &str| store.lock().push(message.to_string()))),
                ..accessors()
            }))
            .unwrap();
        assert!(handle.flag_error("load failed"));
        assert_eq!(*seen.lock(), vec!["load failed".to_string()]);
    }

    #[test]
    fn list_keeps_registration_order() {
        let registry = registry();
        for label in ["zeta", "alpha", "mid"] {
            registry.register(meta(label)).unwrap();
        }
        let labels: Vec<String> = registry.list().iter().map(|r| r.label().to_string()).collect();
        assert_eq!(labels, vec!["zeta", "alpha", "mid"]);
    }
}
