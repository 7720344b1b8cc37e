//! Plugin surfaces and the frozen API handed back to the host.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::error::{PluginError, Result};
use super::registry::guarded;
use super::traits::{DataFn, ErrorFn, PerfFn, PluginRuntime, StatusFn, TeardownFn};

/// A callable member of a plugin surface.
pub type HookFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// One named member of a plugin surface.
#[derive(Clone)]
pub enum SurfaceMember {
    Hook(HookFn),
    Value(Value),
}

impl fmt::Debug for SurfaceMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hook(_) => f.write_str("Hook(..)"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// What a plugin factory returns: named hooks and values, plus an optional
/// teardown hook run when the plugin is disabled.
#[derive(Clone, Default)]
pub struct PluginSurface {
    members: BTreeMap<String, SurfaceMember>,
    teardown: Option<TeardownFn>,
}

impl PluginSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(
        mut self,
        name: impl Into<String>,
        hook: impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.members.insert(name.into(), SurfaceMember::Hook(Arc::new(hook)));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.members.insert(name.into(), SurfaceMember::Value(value));
        self
    }

    pub fn on_disable(
        mut self,
        teardown: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.teardown = Some(Arc::new(teardown));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, member: SurfaceMember) {
        self.members.insert(name.into(), member);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&SurfaceMember> {
        self.members.get(name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<String, SurfaceMember>, Option<TeardownFn>) {
        (self.members, self.teardown)
    }
}

impl fmt::Debug for PluginSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSurface")
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

/// A plugin's private error history.
#[derive(Clone)]
pub struct ErrorHistory {
    label: Arc<str>,
    entries: Arc<Mutex<Vec<String>>>,
}

impl ErrorHistory {
    pub fn new(label: &str) -> Self {
        Self {
            label: Arc::from(label),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append an error. Metadata, when present, is appended as JSON.
    pub fn record(&self, message: &str, meta: Option<&Value>) {
        let full = match meta {
            Some(meta) if meta.is_object() => format!("{message} :: {meta}"),
            _ => message.to_string(),
        };
        tracing::error!(plugin = %self.label, error = %full, "Plugin error");
        self.entries.lock().push(full);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for ErrorHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHistory")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

/// Generated introspection accessors. They shadow same-named surface members.
#[derive(Clone)]
pub(crate) struct Generated {
    pub status: StatusFn,
    pub data: DataFn,
    pub error: ErrorFn,
    pub perf: PerfFn,
}

/// Names claimed by the generated accessors.
pub const GENERATED_NAMES: [&str; 4] = ["status", "data", "error", "perf"];

struct ApiInner {
    label: String,
    runtime: PluginRuntime,
    version: String,
    generated: Generated,
    history: ErrorHistory,
    members: BTreeMap<String, SurfaceMember>,
}

/// Frozen composite API returned by a successful registration.
///
/// Combines the generated accessors with the plugin's own surface. The API
/// is immutable; clones share the same plugin.
#[derive(Clone)]
pub struct PluginApi {
    inner: Arc<ApiInner>,
}

impl PluginApi {
    pub(crate) fn new(
        label: String,
        runtime: PluginRuntime,
        version: String,
        generated: Generated,
        history: ErrorHistory,
        mut members: BTreeMap<String, SurfaceMember>,
    ) -> Self {
        for name in GENERATED_NAMES {
            members.remove(name);
        }
        Self {
            inner: Arc::new(ApiInner {
                label,
                runtime,
                version,
                generated,
                history,
                members,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn runtime(&self) -> PluginRuntime {
        self.inner.runtime
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn status(&self) -> Value {
        (self.inner.generated.status)()
    }

    pub fn data(&self) -> Value {
        (self.inner.generated.data)()
    }

    /// Snapshot of the error history.
    pub fn error(&self) -> Vec<String> {
        (self.inner.generated.error)().unwrap_or_default()
    }

    pub fn perf(&self) -> Value {
        (self.inner.generated.perf)()
    }

    /// Record an error in this plugin's history.
    pub fn report_error(&self, message: &str, meta: Option<&Value>) {
        self.inner.history.record(message, meta);
    }

    /// Every member name: generated accessors first, then the surface.
    pub fn keys(&self) -> Vec<String> {
        GENERATED_NAMES
            .iter()
            .map(|name| name.to_string())
            .chain(self.inner.members.keys().cloned())
            .collect()
    }

    pub fn member(&self, name: &str) -> Option<&SurfaceMember> {
        self.inner.members.get(name)
    }

    /// Invoke a member by name.
    ///
    /// Generated accessors answer their own names. A failing or panicking
    /// hook is written into the error history and reported as
    /// [`PluginError::Hook`].
    pub fn call(&self, name: &str, payload: &Value) -> Result<Value> {
        match name {
            "status" => return Ok(self.status()),
            "data" => return Ok(self.data()),
            "error" => return Ok(Value::from(self.error())),
            "perf" => return Ok(self.perf()),
            _ => {}
        }
        let hook = match self.inner.members.get(name) {
            Some(SurfaceMember::Hook(hook)) => Arc::clone(hook),
            Some(SurfaceMember::Value(value)) => return Ok(value.clone()),
            None => {
                return Err(PluginError::Validation(format!(
                    "plugin \"{}\" has no member {name}",
                    self.inner.label
                )))
            }
        };

        let outcome = match guarded(|| hook(payload)) {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("hook panicked: {panic}")),
        };
        outcome.map_err(|source| {
            self.inner
                .history
                .record(&format!("{name}: {source:#}"), None);
            PluginError::Hook {
                label: self.inner.label.clone(),
                hook: name.to_string(),
                source,
            }
        })
    }
}

impl fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApi")
            .field("label", &self.inner.label)
            .field("runtime", &self.inner.runtime)
            .field("version", &self.inner.version)
            .field("members", &self.inner.members.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api(surface: PluginSurface, history: ErrorHistory) -> PluginApi {
        let errors = history.clone();
        let generated = Generated {
            status: Arc::new(|| json!({"generated": true})),
            data: Arc::new(|| json!({})),
            error: Arc::new(move || Ok(errors.snapshot())),
            perf: Arc::new(|| Value::Null),
        };
        let (members, _) = surface.into_parts();
        PluginApi::new(
            "Demo".into(),
            PluginRuntime::Native,
            "1.0.0".into(),
            generated,
            history,
            members,
        )
    }

    #[test]
    fn generated_accessors_win_collisions() {
        let surface = PluginSurface::new()
            .value("status", json!("shadowed"))
            .value("greeting", json!("hi"));
        let api = api(surface, ErrorHistory::new("Demo"));
        assert!(api.member("status").is_none());
        assert_eq!(api.call("status", &Value::Null).unwrap()["generated"], true);
        assert_eq!(api.call("greeting", &Value::Null).unwrap(), json!("hi"));
        assert_eq!(api.keys(), vec!["status", "data", "error", "perf", "greeting"]);
    }

    #[test]
    fn failing_hook_lands_in_history() {
        let surface = PluginSurface::new().hook("onBoot", |_| anyhow::bail!("no config"));
        let api = api(surface, ErrorHistory::new("Demo"));
        let err = api.call("onBoot", &Value::Null).unwrap_err();
        assert!(matches!(err, PluginError::Hook { .. }));
        assert_eq!(api.error(), vec!["onBoot: no config".to_string()]);
    }

    #[test]
    fn panicking_hook_is_contained() {
        let surface = PluginSurface::new().hook("onPerf", |_| panic!("overflow"));
        let api = api(surface, ErrorHistory::new("Demo"));
        assert!(api.call("onPerf", &json!({})).is_err());
        assert_eq!(api.error().len(), 1);
        assert!(api.error()[0].contains("overflow"));
    }

    #[test]
    fn unknown_member_is_a_validation_error() {
        let api = api(PluginSurface::new(), ErrorHistory::new("Demo"));
        let err = api.call("missing", &Value::Null).unwrap_err();
        assert_eq!(err.kind(), crate::plugins::error::PluginErrorKind::Validation);
    }

    #[test]
    fn history_appends_metadata() {
        let history = ErrorHistory::new("Demo");
        history.record("failed", Some(&json!({"code": 7})));
        history.record("plain", Some(&json!("ignored")));
        assert_eq!(
            history.snapshot(),
            vec!["failed :: {\"code\":7}".to_string(), "plain".to_string()]
        );
    }
}
