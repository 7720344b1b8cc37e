//! Plugin governance for untrusted extensions.
//!
//! Plugins are registered through a façade that hands the factory a sealed
//! [`PluginContext`] (clock, rate-limited emit, optional devtools announce)
//! and nothing else. The [`PluginRegistry`] owns every record and enforces
//! the rules:
//!
//! - **Observe-only**: any declared mutate capability is refused
//! - **Budgets**: each plugin emits through its own token bucket
//! - **Declared outputs**: emits to undeclared channels are dropped
//! - **Introspection**: every record answers `status`, `data`, `error`, `perf`
//! - **Containment**: plugin failures land in the plugin's own error history
//!
//! Binary plugins (`runtime-wasm` feature) run in the `wasmi` interpreter
//! and are registered through the same façade, so none of the above depends
//! on the substrate.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use warden::config::PluginsConfig;
//! use warden::plugins::{register_plugin, PluginOptions, PluginRegistry, PluginSurface};
//!
//! let registry = PluginRegistry::new(PluginsConfig::default());
//! let _api = register_plugin(
//!     &registry,
//!     "Greeter",
//!     |ctx| {
//!         ctx.emit().log(json!("starting"));
//!         Ok(PluginSurface::new().value("greeting", json!("hello")).into())
//!     },
//!     PluginOptions::default(),
//! )?
//! .ready();
//! # Ok::<(), warden::plugins::PluginError>(())
//! ```

pub mod bucket;
pub mod codec;
pub mod context;
pub mod error;
pub mod facade;
#[cfg(feature = "runtime-wasm")]
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod sinks;
pub mod surface;
pub mod traits;

pub use bucket::TokenBucket;
pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use context::{Clock, DevtoolsHook, Emitter, PluginContext};
pub use error::{PluginError, PluginErrorKind};
pub use facade::{
    register_plugin, register_plugin_async, Init, InitJob, InitScheduler, PluginOptions,
    Registration, ScheduleMeta, SchedulePriority, ScheduledInit, RESERVED_SURFACE_NAMES,
};
#[cfg(feature = "runtime-wasm")]
pub use loader::{BridgeState, ExtraImports, LifecycleOp, WasmPluginLoader};
pub use manifest::{create_plugin, create_plugin_async, PluginManifest, PluginSource};
pub use registry::{
    PluginHandle, PluginLifecycle, PluginMeta, PluginRecord, PluginRegistry, RegistryData,
    RegistryStatus,
};
pub use sinks::{start_plugin_bridge, wire_plugin_sinks, RuntimeEventRouter, Sink, SinkOverrides};
pub use surface::{PluginApi, PluginSurface, SurfaceMember};
pub use traits::{
    Accessors, BudgetOverrides, Budgets, CapabilityContract, Channel, Introspect, PluginRuntime,
};
