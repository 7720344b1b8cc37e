//! WASM host bridge.
//!
//! Runs untrusted binary plugins in the `wasmi` interpreter and adapts them
//! to the same surface a native plugin returns, so registration, capability
//! checks and rate limiting do not depend on the substrate.
//!
//! # Guest ABI
//!
//! Required exports:
//!
//! - `memory`: linear memory
//! - `plugin_init(ptr, len) -> (ptr, len)`: receives the encoded manifest
//! - `plugin_call(op, ptr, len) -> (ptr, len)`: lifecycle operations
//! - `__alloc(size) -> ptr` (or `alloc`): guest allocator
//!
//! `__free(ptr)` (or `free`) is optional. Host imports live in `env`:
//! `host_now() -> i64`, `host_emit(channel, ptr, len)`, `host_alloc(size)`
//! and `host_free(ptr)`; the last two delegate to the guest allocator.
//!
//! Every guest call is refuelled to `bridge.fuel_limit` first, and linear
//! memory cannot grow past `bridge.max_memory_pages`.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use wasmi::{
    Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, TypedFunc,
};

use crate::config::BridgeConfig;

use super::codec::{Codec, MsgPackCodec};
use super::context::{Clock, Emitter, PluginContext};
use super::error::{PluginError, Result as PluginResult};
use super::facade::PluginOptions;
use super::manifest::{create_plugin_async, PluginManifest};
use super::registry::PluginRegistry;
use super::surface::{PluginApi, PluginSurface};
use super::traits::{Channel, PluginRuntime};

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
const WASM_PAGE_BYTES: usize = 64 * 1024;

const ALLOC_EXPORTS: [&str; 2] = ["__alloc", "alloc"];
const FREE_EXPORTS: [&str; 2] = ["__free", "free"];

/// Lifecycle operations a binary plugin answers through `plugin_call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Boot,
    GraphReady,
    NodeUpdate,
    StatusChange,
    Error,
    Perf,
    Dispose,
}

impl LifecycleOp {
    pub const ALL: [LifecycleOp; 7] = [
        LifecycleOp::Boot,
        LifecycleOp::GraphReady,
        LifecycleOp::NodeUpdate,
        LifecycleOp::StatusChange,
        LifecycleOp::Error,
        LifecycleOp::Perf,
        LifecycleOp::Dispose,
    ];

    /// Operation id passed as the first `plugin_call` argument.
    pub fn id(self) -> i32 {
        match self {
            Self::Boot => 1,
            Self::GraphReady => 2,
            Self::NodeUpdate => 3,
            Self::StatusChange => 4,
            Self::Error => 5,
            Self::Perf => 6,
            Self::Dispose => 7,
        }
    }

    /// Surface member name.
    pub fn hook_name(self) -> &'static str {
        match self {
            Self::Boot => "onBoot",
            Self::GraphReady => "onGraphReady",
            Self::NodeUpdate => "onNodeUpdate",
            Self::StatusChange => "onStatusChange",
            Self::Error => "onError",
            Self::Perf => "onPerf",
            Self::Dispose => "onDispose",
        }
    }
}

/// Per-instance host state, visible to host imports through `Caller::data`.
pub struct BridgeState {
    label: String,
    codec: Arc<dyn Codec>,
    emitter: Option<Emitter>,
    clock: Clock,
    limits: StoreLimits,
}

impl BridgeState {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Emit through the owning plugin's budget. Dropped until the plugin is
    /// registered.
    pub fn emit(&self, channel: Channel, event: Value) -> bool {
        match &self.emitter {
            Some(emitter) => emitter.emit(channel, event),
            None => {
                tracing::trace!(plugin = %self.label, channel = %channel, "Emit before registration dropped");
                false
            }
        }
    }
}

/// Additional host import namespaces offered to a guest.
pub trait ExtraImports: Send + Sync {
    /// Namespace name, for diagnostics.
    fn namespace(&self) -> &str;

    fn link(&self, linker: &mut Linker<BridgeState>) -> Result<()>;
}

fn guest_func(caller: &Caller<'_, BridgeState>, names: &[&str]) -> Option<wasmi::Func> {
    names
        .iter()
        .find_map(|name| caller.get_export(name).and_then(Extern::into_func))
}

/// Validate a guest `(ptr, len)` pair against a memory of `size` bytes.
fn span(size: usize, ptr: i32, len: i32) -> Result<Range<usize>> {
    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        bail!("negative span ({ptr}, {len})");
    };
    if len == 0 {
        return Ok(0..0);
    }
    if start == 0 {
        bail!("null pointer with length {len}");
    }
    let end = start
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or_else(|| anyhow!("span {start}+{len} exceeds guest memory ({size} bytes)"))?;
    Ok(start..end)
}

fn link_host_imports(linker: &mut Linker<BridgeState>) -> Result<()> {
    linker
        .func_wrap("env", "host_now", |caller: Caller<'_, BridgeState>| -> i64 {
            i64::try_from(caller.data().now_millis()).unwrap_or(i64::MAX)
        })
        .map_err(|e| anyhow!("{e}"))?;

    linker
        .func_wrap(
            "env",
            "host_emit",
            |caller: Caller<'_, BridgeState>, channel: i32, ptr: i32, len: i32| {
                let state = caller.data();
                let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
                    tracing::warn!(plugin = %state.label, "host_emit without exported memory");
                    return;
                };
                let data = memory.data(&caller);
                let event = span(data.len(), ptr, len)
                    .and_then(|range| state.codec.decode(&data[range]));
                match event {
                    Ok(event) => {
                        let channel = Channel::from_id(u32::try_from(channel).unwrap_or(0));
                        state.emit(channel, event);
                    }
                    Err(e) => {
                        tracing::warn!(plugin = %state.label, error = %e, "Dropped undecodable guest emit");
                    }
                }
            },
        )
        .map_err(|e| anyhow!("{e}"))?;

    linker
        .func_wrap(
            "env",
            "host_alloc",
            |mut caller: Caller<'_, BridgeState>, size: i32| -> Result<i32, wasmi::Error> {
                let alloc = guest_func(&caller, &ALLOC_EXPORTS)
                    .ok_or_else(|| wasmi::Error::new("guest exports no allocator"))?;
                alloc.typed::<i32, i32>(&caller)?.call(&mut caller, size)
            },
        )
        .map_err(|e| anyhow!("{e}"))?;

    linker
        .func_wrap(
            "env",
            "host_free",
            |mut caller: Caller<'_, BridgeState>, ptr: i32| -> Result<(), wasmi::Error> {
                match guest_func(&caller, &FREE_EXPORTS) {
                    Some(free) => free.typed::<i32, ()>(&caller)?.call(&mut caller, ptr),
                    None => Ok(()),
                }
            },
        )
        .map_err(|e| anyhow!("{e}"))?;

    Ok(())
}

/// An instantiated guest that passed ABI validation.
struct Guest {
    store: Store<BridgeState>,
    memory: Memory,
    init: TypedFunc<(i32, i32), (i32, i32)>,
    call: TypedFunc<(i32, i32, i32), (i32, i32)>,
    alloc: TypedFunc<i32, i32>,
    free: Option<TypedFunc<i32, ()>>,
    fuel_limit: u64,
}

impl Guest {
    fn bind(&mut self, ctx: &PluginContext) {
        let state = self.store.data_mut();
        state.emitter = Some(ctx.emit().clone());
        state.clock = ctx.clock();
    }

    fn refuel(&mut self) -> Result<()> {
        self.store
            .set_fuel(self.fuel_limit)
            .map_err(|e| anyhow!("failed to set fuel: {e}"))
    }

    /// Copy `bytes` into a fresh guest allocation.
    fn write(&mut self, bytes: &[u8]) -> Result<(i32, i32)> {
        if bytes.is_empty() {
            return Ok((0, 0));
        }
        let len = i32::try_from(bytes.len()).context("payload too large for guest memory")?;
        self.refuel()?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| anyhow!("guest allocator trapped: {e}"))?;
        let range = span(self.memory.data(&self.store).len(), ptr, len)
            .context("guest allocator returned an invalid span")?;
        self.memory.data_mut(&mut self.store)[range].copy_from_slice(bytes);
        Ok((ptr, len))
    }

    /// Copy a guest span out, then release it.
    fn take(&mut self, ptr: i32, len: i32) -> Result<Vec<u8>> {
        let range = span(self.memory.data(&self.store).len(), ptr, len)
            .context("guest returned a malformed (ptr, len) pair")?;
        let bytes = self.memory.data(&self.store)[range].to_vec();
        self.release(ptr)?;
        Ok(bytes)
    }

    fn release(&mut self, ptr: i32) -> Result<()> {
        if ptr == 0 {
            return Ok(());
        }
        if self.free.is_none() {
            return Ok(());
        }
        self.refuel()?;
        if let Some(free) = &self.free {
            free.call(&mut self.store, ptr)
                .map_err(|e| anyhow!("guest free trapped: {e}"))?;
        }
        Ok(())
    }

    fn initialize(&mut self, manifest: &Value) -> Result<Value> {
        let payload = self.store.data().codec.encode(manifest)?;
        let (ptr, len) = self.write(&payload)?;
        self.refuel()?;
        let (out_ptr, out_len) = self
            .init
            .call(&mut self.store, (ptr, len))
            .map_err(|e| anyhow!("plugin_init trapped: {e}"))?;
        let response = self.take(out_ptr, out_len)?;
        if out_ptr != ptr {
            self.release(ptr)?;
        }
        self.store.data().codec.decode(&response)
    }

    fn call_op(&mut self, op: LifecycleOp, payload: &Value) -> Result<Value> {
        tracing::trace!(plugin = %self.store.data().label, op = op.hook_name(), "Guest call");
        let encoded = self.store.data().codec.encode(payload)?;
        let (ptr, len) = self.write(&encoded)?;
        self.refuel()?;
        let (out_ptr, out_len) = self
            .call
            .call(&mut self.store, (op.id(), ptr, len))
            .map_err(|e| anyhow!("plugin_call({}) trapped: {e}", op.hook_name()))?;
        let response = self.take(out_ptr, out_len)?;
        if out_ptr != ptr {
            self.release(ptr)?;
        }
        self.store.data().codec.decode(&response)
    }
}

fn typed_export<P, R>(
    store: &Store<BridgeState>,
    instance: &Instance,
    name: &str,
) -> Option<TypedFunc<P, R>>
where
    P: wasmi::WasmParams,
    R: wasmi::WasmResults,
{
    instance.get_typed_func::<P, R>(store, name).ok()
}

/// Loads a binary plugin module and registers it.
pub struct WasmPluginLoader {
    bytes: Vec<u8>,
    manifest: PluginManifest,
    codec: Arc<dyn Codec>,
    imports: Vec<Arc<dyn ExtraImports>>,
}

impl WasmPluginLoader {
    /// Defaults to the MessagePack codec.
    pub fn new(bytes: impl Into<Vec<u8>>, manifest: PluginManifest) -> Self {
        Self {
            bytes: bytes.into(),
            manifest,
            codec: Arc::new(MsgPackCodec),
            imports: Vec::new(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>, manifest: PluginManifest) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read plugin module: {}", path.display()))?;
        Ok(Self::new(bytes, manifest))
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_imports(mut self, imports: Arc<dyn ExtraImports>) -> Self {
        self.imports.push(imports);
        self
    }

    /// Instantiate, validate the guest ABI, then register through the async
    /// façade as a binary plugin.
    ///
    /// ABI problems fail with [`PluginError::Abi`] before the registry is
    /// touched.
    pub async fn load(self, registry: &PluginRegistry, opts: PluginOptions) -> PluginResult<PluginApi> {
        self.manifest.validate()?;
        let label = self.manifest.label().unwrap_or_default().to_string();
        let guest = self.instantiate(&label, &registry.config().bridge)?;
        let guest = Arc::new(Mutex::new(guest));

        let mut manifest = self.manifest;
        manifest.runtime = Some(PluginRuntime::Binary);
        let manifest_value = serde_json::to_value(&manifest)
            .map_err(|e| PluginError::Validation(format!("manifest is not serializable: {e}")))?;

        tracing::info!(plugin = %label, codec = self.codec.name(), "Loading binary plugin");

        let surface = binary_surface(&guest);
        create_plugin_async(
            registry,
            &manifest,
            move |ctx: PluginContext| async move {
                let mut guest = guest.lock();
                guest.bind(&ctx);
                let response = guest.initialize(&manifest_value)?;
                tracing::debug!(plugin = %guest.store.data().label, response = %response, "plugin_init returned");
                Ok::<_, anyhow::Error>(surface)
            },
            opts,
        )
        .await
    }

    fn instantiate(&self, label: &str, bridge: &BridgeConfig) -> PluginResult<Guest> {
        if self.bytes.len() < WASM_MAGIC.len() || self.bytes[..4] != WASM_MAGIC {
            return Err(PluginError::Abi(format!(
                "module for \"{label}\" is not a WASM binary"
            )));
        }

        let mut config = Config::default();
        config.consume_fuel(true);
        let engine = Engine::new(&config);
        let module = Module::new(&engine, &self.bytes[..])
            .map_err(|e| PluginError::Abi(format!("failed to compile module: {e}")))?;

        let max_memory = usize::try_from(bridge.max_memory_pages)
            .unwrap_or(usize::MAX)
            .saturating_mul(WASM_PAGE_BYTES);
        let state = BridgeState {
            label: label.to_string(),
            codec: Arc::clone(&self.codec),
            emitter: None,
            clock: Clock::new(),
            limits: StoreLimitsBuilder::new().memory_size(max_memory).build(),
        };
        let mut store = Store::new(&engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(bridge.fuel_limit)
            .map_err(|e| PluginError::Abi(format!("failed to set fuel: {e}")))?;

        let mut linker = <Linker<BridgeState>>::new(&engine);
        link_host_imports(&mut linker)
            .map_err(|e| PluginError::Abi(format!("failed to link host imports: {e:#}")))?;
        for imports in &self.imports {
            imports.link(&mut linker).map_err(|e| {
                PluginError::Abi(format!(
                    "failed to link import namespace {}: {e:#}",
                    imports.namespace()
                ))
            })?;
        }

        let instance = linker
            .instantiate_and_start(&mut store, &module)
            .map_err(|e| PluginError::Abi(format!("failed to instantiate module: {e}")))?;

        let missing = |export: &str| PluginError::Abi(format!("module for \"{label}\" does not export {export}"));
        let memory = instance
            .get_memory(&store, "memory")
            .ok_or_else(|| missing("memory"))?;
        let init = typed_export::<(i32, i32), (i32, i32)>(&store, &instance, "plugin_init")
            .ok_or_else(|| missing("plugin_init(i32, i32) -> (i32, i32)"))?;
        let call = typed_export::<(i32, i32, i32), (i32, i32)>(&store, &instance, "plugin_call")
            .ok_or_else(|| missing("plugin_call(i32, i32, i32) -> (i32, i32)"))?;
        let alloc = ALLOC_EXPORTS
            .iter()
            .find_map(|name| typed_export::<i32, i32>(&store, &instance, name))
            .ok_or_else(|| missing("an allocator (__alloc or alloc)"))?;
        let free = FREE_EXPORTS
            .iter()
            .find_map(|name| typed_export::<i32, ()>(&store, &instance, name));

        tracing::debug!(plugin = %label, has_free = free.is_some(), "Guest ABI validated");

        Ok(Guest {
            store,
            memory,
            init,
            call,
            alloc,
            free,
            fuel_limit: bridge.fuel_limit,
        })
    }
}

impl fmt::Debug for WasmPluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmPluginLoader")
            .field("module_size", &self.bytes.len())
            .field("manifest", &self.manifest)
            .field("codec", &self.codec.name())
            .field("imports", &self.imports.len())
            .finish()
    }
}

/// One hook per lifecycle operation, each a guest call.
fn binary_surface(guest: &Arc<Mutex<Guest>>) -> PluginSurface {
    LifecycleOp::ALL.iter().fold(PluginSurface::new(), |surface, &op| {
        let guest = Arc::clone(guest);
        surface.hook(op.hook_name(), move |payload| guest.lock().call_op(op, payload))
    })
}
