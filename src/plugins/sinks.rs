//! Output sinks: host-wired destinations for plugin channels.
//!
//! Every channel starts with a no-op sink. The host replaces sinks
//! selectively; channels it does not mention keep what they had.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::registry::PluginRegistry;
use super::traits::Channel;

/// Consumer for one output channel.
pub type Sink = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

fn noop_sink() -> Sink {
    Arc::new(|_event: &Value| -> anyhow::Result<()> { Ok(()) })
}

/// Current sink per channel.
#[derive(Clone)]
pub struct OutputSinks {
    log: Sink,
    metric: Sink,
    overlay: Sink,
}

impl Default for OutputSinks {
    fn default() -> Self {
        Self {
            log: noop_sink(),
            metric: noop_sink(),
            overlay: noop_sink(),
        }
    }
}

impl OutputSinks {
    pub fn get(&self, channel: Channel) -> Sink {
        match channel {
            Channel::Log => Arc::clone(&self.log),
            Channel::Metric => Arc::clone(&self.metric),
            Channel::Overlay => Arc::clone(&self.overlay),
        }
    }

    /// Replace only the channels present in `overrides`.
    pub fn apply(&mut self, overrides: SinkOverrides) {
        if let Some(log) = overrides.log {
            self.log = log;
        }
        if let Some(metric) = overrides.metric {
            self.metric = metric;
        }
        if let Some(overlay) = overrides.overlay {
            self.overlay = overlay;
        }
    }
}

impl fmt::Debug for OutputSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSinks").finish_non_exhaustive()
    }
}

/// Partial sink replacement.
#[derive(Clone, Default)]
pub struct SinkOverrides {
    pub log: Option<Sink>,
    pub metric: Option<Sink>,
    pub overlay: Option<Sink>,
}

impl SinkOverrides {
    pub fn log(mut self, sink: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.log = Some(Arc::new(sink));
        self
    }

    pub fn metric(
        mut self,
        sink: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.metric = Some(Arc::new(sink));
        self
    }

    pub fn overlay(
        mut self,
        sink: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.overlay = Some(Arc::new(sink));
        self
    }

    /// Sinks that forward every channel into `tracing`.
    pub fn tracing() -> Self {
        let forward = |channel: Channel| -> Sink {
            Arc::new(move |event: &Value| -> anyhow::Result<()> {
                tracing::info!(channel = %channel, event = %event, "plugin output");
                Ok(())
            })
        };
        Self {
            log: Some(forward(Channel::Log)),
            metric: Some(forward(Channel::Metric)),
            overlay: Some(forward(Channel::Overlay)),
        }
    }
}

/// Wire host or devtools sinks into a registry.
pub fn wire_plugin_sinks(registry: &PluginRegistry, sinks: SinkOverrides) {
    registry.set_output_sinks(sinks);
}

/// Routes host runtime events to the registry's sinks by their `type` field.
///
/// Host events bypass plugin budgets: they are not plugin emits.
#[derive(Clone, Debug)]
pub struct RuntimeEventRouter {
    registry: PluginRegistry,
}

impl RuntimeEventRouter {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    /// Channel a runtime event is routed to, if any.
    pub fn route_for(event: &Value) -> Option<Channel> {
        match event.get("type").and_then(Value::as_str)? {
            "perf" => Some(Channel::Metric),
            "error" => Some(Channel::Log),
            "overlay" => Some(Channel::Overlay),
            _ => None,
        }
    }

    /// Deliver one event. Returns whether a sink accepted it.
    pub fn dispatch(&self, event: &Value) -> bool {
        match Self::route_for(event) {
            Some(channel) => self.registry.deliver(channel, event),
            None => false,
        }
    }
}

/// Subscribe a router to a host runtime event source.
///
/// `subscribe` receives the callback the host should invoke per event.
pub fn start_plugin_bridge<S>(registry: &PluginRegistry, subscribe: S) -> RuntimeEventRouter
where
    S: FnOnce(Box<dyn Fn(&Value) + Send + Sync>),
{
    let router = RuntimeEventRouter::new(registry.clone());
    let callback = router.clone();
    subscribe(Box::new(move |event: &Value| {
        callback.dispatch(event);
    }));
    tracing::debug!("runtime event bridge started");
    router
}
