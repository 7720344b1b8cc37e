//! Plugin façade: the entry points that turn untrusted factory code into a
//! registered plugin.
//!
//! Both the synchronous and asynchronous paths share one [`Activation`]
//! builder, so the sealed context, the reserved-name check and the generated
//! introspection accessors are written once. They differ only in when the
//! registry record is created:
//!
//! - sync: the factory runs first, then the record is registered
//! - async: an "activating" stub is registered first and upgraded in place
//!   once the factory settles; on failure the stub stays registered with
//!   the failure in its error history

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::PluginsConfig;

use super::context::{Clock, DevtoolsHook, Emitter, PluginContext};
use super::error::{PluginError, Result};
use super::registry::{guarded, PluginMeta, PluginRegistry};
use super::surface::{ErrorHistory, Generated, PluginApi, PluginSurface};
use super::traits::{
    Accessors, BudgetOverrides, Budgets, CapabilityContract, Channel, DataFn, ErrorFn, PerfFn,
    PluginRuntime, StatusFn,
};

/// Names of the host's reactive primitives. A plugin surface may not
/// shadow them.
pub const RESERVED_SURFACE_NAMES: &[&str] = &["state", "scope", "task", "effect", "plugin", "host"];

/// Result of a synchronous factory.
pub enum Init {
    /// The surface is ready.
    Ready(PluginSurface),
    /// The factory started work that has not finished. Rejected by the
    /// synchronous path.
    Pending(BoxFuture<'static, anyhow::Result<PluginSurface>>),
}

impl Init {
    pub fn pending(
        future: impl Future<Output = anyhow::Result<PluginSurface>> + Send + 'static,
    ) -> Self {
        Self::Pending(Box::pin(future))
    }
}

impl From<PluginSurface> for Init {
    fn from(surface: PluginSurface) -> Self {
        Self::Ready(surface)
    }
}

// ── Scheduling ──────────────────────────────────────────────────────────────

/// Deferred initialization job.
pub type InitJob = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePriority {
    High,
    Normal,
    Low,
}

/// Describes an initialization job to a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleMeta {
    pub key: String,
    pub scope: String,
    pub priority: SchedulePriority,
    pub tags: Vec<&'static str>,
    pub public: bool,
}

/// Host scheduler that runs plugin initialization instead of the caller.
///
/// The job must eventually run exactly once; dropping it fails the
/// registration.
pub trait InitScheduler: Send + Sync {
    fn schedule(&self, job: InitJob, meta: ScheduleMeta);
}

/// Registration whose initialization was handed to a scheduler.
pub struct ScheduledInit {
    label: String,
    receiver: oneshot::Receiver<Result<PluginApi>>,
}

impl ScheduledInit {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn wait(self) -> Result<PluginApi> {
        let label = self.label;
        self.receiver
            .await
            .unwrap_or_else(|_| Err(dropped_by_scheduler(&label)))
    }

    /// Block the current thread until the job has run. Must not be called
    /// from inside an async runtime.
    pub fn blocking_wait(self) -> Result<PluginApi> {
        let label = self.label;
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err(dropped_by_scheduler(&label)))
    }

    /// Take the outcome if the job has already run.
    pub fn try_take(&mut self) -> Option<Result<PluginApi>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped_by_scheduler(&self.label))),
        }
    }
}

impl fmt::Debug for ScheduledInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledInit")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn dropped_by_scheduler(label: &str) -> PluginError {
    PluginError::Factory {
        label: label.to_string(),
        source: anyhow::anyhow!("scheduler dropped the initialization job"),
    }
}

/// Outcome of [`register_plugin`].
#[derive(Debug)]
pub enum Registration {
    Ready(PluginApi),
    Scheduled(ScheduledInit),
}

impl Registration {
    pub fn ready(self) -> Option<PluginApi> {
        match self {
            Self::Ready(api) => Some(api),
            Self::Scheduled(_) => None,
        }
    }

    /// Wait for the API, whichever way it was produced.
    pub async fn resolve(self) -> Result<PluginApi> {
        match self {
            Self::Ready(api) => Ok(api),
            Self::Scheduled(scheduled) => scheduled.wait().await,
        }
    }
}

// ── Options ─────────────────────────────────────────────────────────────────

/// Caller-supplied registration options.
#[derive(Clone, Default)]
pub struct PluginOptions {
    pub id: Option<String>,
    pub version: Option<String>,
    pub public: Option<bool>,
    pub observe: Vec<String>,
    pub budgets: Option<BudgetOverrides>,
    pub outputs: Vec<Channel>,
    pub runtime: PluginRuntime,
    pub scheduler: Option<Arc<dyn InitScheduler>>,
    pub devtools: Option<Arc<dyn DevtoolsHook>>,
}

impl PluginOptions {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn public(mut self, public: bool) -> Self {
        self.public = Some(public);
        self
    }

    pub fn observe(mut self, observe: Vec<String>) -> Self {
        self.observe = observe;
        self
    }

    pub fn budgets(mut self, budgets: BudgetOverrides) -> Self {
        self.budgets = Some(budgets);
        self
    }

    pub fn outputs(mut self, outputs: Vec<Channel>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn runtime(mut self, runtime: PluginRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn InitScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn devtools(mut self, devtools: Arc<dyn DevtoolsHook>) -> Self {
        self.devtools = Some(devtools);
        self
    }
}

impl fmt::Debug for PluginOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginOptions")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("public", &self.public)
            .field("observe", &self.observe)
            .field("budgets", &self.budgets)
            .field("outputs", &self.outputs)
            .field("runtime", &self.runtime)
            .field("scheduler", &self.scheduler.is_some())
            .field("devtools", &self.devtools.is_some())
            .finish()
    }
}

// ── Shared builder ──────────────────────────────────────────────────────────

/// Activation timing, in clock milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerfSnapshot {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivationState {
    Activating,
    Active,
}

impl ActivationState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Activating => "activating",
            Self::Active => "active",
        }
    }
}

/// Normalized identity and contract of the plugin being activated.
#[derive(Debug)]
struct Profile {
    label: String,
    id: String,
    version: String,
    public: bool,
    runtime: PluginRuntime,
    observe: Vec<String>,
    budgets: Budgets,
    outputs: Vec<Channel>,
}

struct Activation {
    profile: Arc<Profile>,
    clock: Clock,
    history: ErrorHistory,
    perf: Arc<Mutex<PerfSnapshot>>,
    devtools: Option<Arc<dyn DevtoolsHook>>,
}

fn validate_label(label: &str) -> Result<()> {
    if label.trim().is_empty() {
        return Err(PluginError::Validation(
            "plugin label must be a non-empty string".into(),
        ));
    }
    Ok(())
}

impl Activation {
    fn new(label: &str, opts: &PluginOptions, config: &PluginsConfig) -> Self {
        let version = match opts.version.as_deref().map(str::trim) {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => "0.0.0".to_string(),
        };
        let budgets = match &opts.budgets {
            Some(overrides) => config.default_budgets.merged(overrides),
            None => config.default_budgets,
        };
        let outputs = if opts.outputs.is_empty() {
            config.default_outputs.clone()
        } else {
            opts.outputs.clone()
        };
        let profile = Profile {
            label: label.to_string(),
            id: opts.id.clone().unwrap_or_else(|| label.to_string()),
            version,
            public: opts.public.unwrap_or(true),
            runtime: opts.runtime,
            observe: opts.observe.clone(),
            budgets,
            outputs,
        };
        let clock = Clock::new();
        let perf = PerfSnapshot {
            start: clock.now_ms(),
            ..PerfSnapshot::default()
        };
        Self {
            profile: Arc::new(profile),
            clock,
            history: ErrorHistory::new(label),
            perf: Arc::new(Mutex::new(perf)),
            devtools: opts.devtools.clone(),
        }
    }

    fn context(&self, emitter: Emitter) -> PluginContext {
        PluginContext::new(self.clock, emitter, self.devtools.clone())
    }

    /// Introspection accessors reporting identity, contract, errors and
    /// timing.
    fn generated(&self, state: ActivationState) -> Generated {
        let status = {
            let profile = Arc::clone(&self.profile);
            let history = self.history.clone();
            let perf = Arc::clone(&self.perf);
            let status: StatusFn = Arc::new(move || {
                let errors = history.len();
                let perf = *perf.lock();
                json!({
                    "type": "plugin",
                    "key": profile.label,
                    "label": profile.label,
                    "public": profile.public,
                    "hasError": errors > 0,
                    "errorCount": errors,
                    "runtime": profile.runtime,
                    "version": profile.version,
                    "state": state.as_str(),
                    "perf": perf,
                })
            });
            status
        };
        let data = {
            let profile = Arc::clone(&self.profile);
            let history = self.history.clone();
            let perf = Arc::clone(&self.perf);
            let data: DataFn = Arc::new(move || {
                let errors = history.snapshot();
                let perf = *perf.lock();
                let description = match state {
                    ActivationState::Activating => format!("Activating plugin \"{}\"", profile.label),
                    ActivationState::Active => format!("Plugin registered as \"{}\"", profile.label),
                };
                json!({
                    "type": "plugin",
                    "id": profile.id,
                    "key": profile.label,
                    "label": profile.label,
                    "public": profile.public,
                    "hasError": !errors.is_empty(),
                    "errorHistory": errors,
                    "runtime": profile.runtime,
                    "version": profile.version,
                    "observe": profile.observe,
                    "budgets": profile.budgets,
                    "outputs": profile.outputs,
                    "state": state.as_str(),
                    "perf": perf,
                    "description": description,
                })
            });
            data
        };
        let error = {
            let history = self.history.clone();
            let error: ErrorFn = Arc::new(move || Ok(history.snapshot()));
            error
        };
        let perf = {
            let perf = Arc::clone(&self.perf);
            let snapshot: PerfFn = Arc::new(move || {
                let perf = *perf.lock();
                json!(perf)
            });
            snapshot
        };
        Generated {
            status,
            data,
            error,
            perf,
        }
    }

    fn accessors(&self, generated: &Generated) -> Accessors {
        let history = self.history.clone();
        Accessors {
            status: Some(Arc::clone(&generated.status)),
            data: Some(Arc::clone(&generated.data)),
            error: Some(Arc::clone(&generated.error)),
            perf: Some(Arc::clone(&generated.perf)),
            report: Some(Arc::new(move |message: &str| history.record(message, None))),
        }
    }

    fn meta(&self, accessors: Accessors, activating: bool) -> PluginMeta {
        let profile = &self.profile;
        PluginMeta {
            label: profile.label.clone(),
            id: Some(profile.id.clone()),
            version: Some(profile.version.clone()),
            public: Some(profile.public),
            runtime: profile.runtime,
            contract: CapabilityContract::observe_only(profile.observe.clone()),
            budgets: Some(BudgetOverrides::from(profile.budgets)),
            outputs: profile.outputs.clone(),
            accessors,
            disable: None,
            activating,
        }
    }

    /// Reject surfaces that shadow a host primitive.
    fn check_surface(&self, surface: &PluginSurface) -> Result<()> {
        if let Some(name) = surface
            .keys()
            .find(|name| RESERVED_SURFACE_NAMES.contains(name))
        {
            return Err(PluginError::contract(
                &self.profile.label,
                format!("surface overrides reserved host symbol \"{name}\""),
            ));
        }
        Ok(())
    }

    fn finish(self, generated: Generated, surface: PluginSurface) -> PluginApi {
        {
            let mut perf = self.perf.lock();
            perf.end = self.clock.now_ms();
            perf.duration = perf.end - perf.start;
        }

        if let Some(devtools) = &self.devtools {
            let announcement = json!({
                "type": "plugin",
                "label": self.profile.label,
                "runtime": self.profile.runtime,
                "version": self.profile.version,
            });
            if let Err(panic) = guarded(|| devtools.announce(&announcement)) {
                tracing::warn!(plugin = %self.profile.label, error = %panic, "Devtools announce panicked");
            }
        }

        let (members, _) = surface.into_parts();
        PluginApi::new(
            self.profile.label.clone(),
            self.profile.runtime,
            self.profile.version.clone(),
            generated,
            self.history,
            members,
        )
    }
}

fn history_message(error: &PluginError) -> String {
    match error {
        PluginError::Factory { source, .. } => format!("{source:#}"),
        other => other.to_string(),
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Register a plugin whose factory completes synchronously.
///
/// With a scheduler in `opts`, initialization is handed to it and the
/// result arrives through [`Registration::Scheduled`].
pub fn register_plugin<F>(
    registry: &PluginRegistry,
    label: &str,
    factory: F,
    opts: PluginOptions,
) -> Result<Registration>
where
    F: FnOnce(&PluginContext) -> anyhow::Result<Init> + Send + 'static,
{
    validate_label(label)?;

    let Some(scheduler) = opts.scheduler.clone() else {
        return run_sync(registry, label, factory, &opts).map(Registration::Ready);
    };

    let meta = ScheduleMeta {
        key: format!("plugin:init:{label}"),
        scope: label.to_string(),
        priority: SchedulePriority::High,
        tags: vec!["plugin", "init"],
        public: opts.public.unwrap_or(true),
    };
    let (sender, receiver) = oneshot::channel();
    let registry = registry.clone();
    let job_label = label.to_string();
    scheduler.schedule(
        Box::new(move || {
            let outcome = run_sync(&registry, &job_label, factory, &opts);
            let _ = sender.send(outcome);
        }),
        meta,
    );
    tracing::debug!(plugin = %label, "Plugin initialization scheduled");
    Ok(Registration::Scheduled(ScheduledInit {
        label: label.to_string(),
        receiver,
    }))
}

fn run_sync<F>(
    registry: &PluginRegistry,
    label: &str,
    factory: F,
    opts: &PluginOptions,
) -> Result<PluginApi>
where
    F: FnOnce(&PluginContext) -> anyhow::Result<Init>,
{
    let activation = Activation::new(label, opts, registry.config());
    let emitter = Emitter::unbound();
    let ctx = activation.context(emitter.clone());

    let surface = match guarded(|| factory(&ctx)) {
        Ok(Ok(Init::Ready(surface))) => surface,
        Ok(Ok(Init::Pending(_))) => {
            return Err(PluginError::Validation(format!(
                "factory for \"{label}\" returned a pending initialization; \
                 register it through register_plugin_async or create_plugin_async"
            )))
        }
        Ok(Err(source)) => {
            return Err(PluginError::Factory {
                label: label.to_string(),
                source,
            })
        }
        Err(panic) => {
            return Err(PluginError::Factory {
                label: label.to_string(),
                source: anyhow::anyhow!("factory panicked: {panic}"),
            })
        }
    };
    activation.check_surface(&surface)?;

    let generated = activation.generated(ActivationState::Active);
    let mut meta = activation.meta(activation.accessors(&generated), false);
    meta.disable = surface.clone().into_parts().1;
    let handle = registry.register(meta)?;
    emitter.bind(handle);

    Ok(activation.finish(generated, surface))
}

/// Register a plugin whose factory completes asynchronously.
///
/// The record is visible as "activating" while the factory runs. A failed
/// activation stays registered and enabled with the failure recorded in its
/// error history; the error is also returned.
pub async fn register_plugin_async<F, Fut>(
    registry: &PluginRegistry,
    label: &str,
    factory: F,
    opts: PluginOptions,
) -> Result<PluginApi>
where
    F: FnOnce(PluginContext) -> Fut,
    Fut: Future<Output = anyhow::Result<PluginSurface>>,
{
    validate_label(label)?;

    let activation = Activation::new(label, &opts, registry.config());
    let stub = activation.generated(ActivationState::Activating);
    let handle = registry.register(activation.meta(activation.accessors(&stub), true))?;
    let ctx = activation.context(Emitter::bound(handle.clone()));

    let outcome = match guarded(|| factory(ctx)) {
        Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("factory panicked")),
        },
        Err(panic) => Err(anyhow::anyhow!("factory panicked: {panic}")),
    };

    let checked = outcome
        .map_err(|source| PluginError::Factory {
            label: label.to_string(),
            source,
        })
        .and_then(|surface| activation.check_surface(&surface).map(|()| surface));

    match checked {
        Ok(surface) => {
            let generated = activation.generated(ActivationState::Active);
            if !handle.upgrade(activation.accessors(&generated)) {
                tracing::warn!(plugin = %label, "Plugin was unregistered during activation");
            }
            if let Some(teardown) = surface.clone().into_parts().1 {
                handle.set_teardown(teardown);
            }
            Ok(activation.finish(generated, surface))
        }
        Err(error) => {
            let message = history_message(&error);
            if !handle.flag_error(&message) {
                activation.history.record(&message, None);
            }
            Err(error)
        }
    }
}
