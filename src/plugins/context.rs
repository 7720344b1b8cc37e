//! Sealed execution context handed to plugin factories.
//!
//! The context is the whole of what untrusted code can reach: a monotonic
//! clock, one emit function per channel, and an optional devtools announce
//! hook. It holds no reference to the registry or to host state.

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use super::registry::PluginHandle;
use super::traits::Channel;

/// Monotonic millisecond clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Fractional milliseconds since the clock was created.
    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    /// Whole milliseconds, as handed to binary modules.
    pub fn now_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Read-only devtools collaborator notified when plugins come up.
pub trait DevtoolsHook: Send + Sync {
    fn announce(&self, event: &Value);
}

/// Emit surface bound to a registry handle once one exists.
///
/// Before the owning registration completes, every emit is dropped.
#[derive(Clone, Default)]
pub struct Emitter {
    handle: Arc<OnceLock<PluginHandle>>,
}

impl Emitter {
    pub(crate) fn unbound() -> Self {
        Self::default()
    }

    pub(crate) fn bound(handle: PluginHandle) -> Self {
        let emitter = Self::unbound();
        emitter.bind(handle);
        emitter
    }

    /// Attach the handle. Later calls are ignored: a context is wired to
    /// exactly one registration.
    pub(crate) fn bind(&self, handle: PluginHandle) {
        let _ = self.handle.set(handle);
    }

    pub fn emit(&self, channel: Channel, event: Value) -> bool {
        match self.handle.get() {
            Some(handle) => handle.emit(channel, &event),
            None => false,
        }
    }

    pub fn log(&self, event: Value) -> bool {
        self.emit(Channel::Log, event)
    }

    pub fn metric(&self, event: Value) -> bool {
        self.emit(Channel::Metric, event)
    }

    pub fn overlay(&self, event: Value) -> bool {
        self.emit(Channel::Overlay, event)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("bound", &self.handle.get().is_some())
            .finish()
    }
}

/// Context passed to plugin factories.
#[derive(Clone)]
pub struct PluginContext {
    clock: Clock,
    emit: Emitter,
    devtools: Option<Arc<dyn DevtoolsHook>>,
}

impl PluginContext {
    pub(crate) fn new(clock: Clock, emit: Emitter, devtools: Option<Arc<dyn DevtoolsHook>>) -> Self {
        Self {
            clock,
            emit,
            devtools,
        }
    }

    pub fn now(&self) -> f64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn emit(&self) -> &Emitter {
        &self.emit
    }

    pub fn devtools(&self) -> Option<&dyn DevtoolsHook> {
        self.devtools.as_deref()
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("emit", &self.emit)
            .field("devtools", &self.devtools.is_some())
            .finish()
    }
}
