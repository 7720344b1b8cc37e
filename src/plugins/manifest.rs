//! Declarative manifest adapter.
//!
//! A manifest names the plugin and declares its contract. The adapter merges
//! it over caller options (the manifest wins) and routes the plugin through
//! the sync or async façade. The two paths never promote into each other.

use serde::{Deserialize, Serialize};
use std::future::Future;

use super::context::PluginContext;
use super::error::{PluginError, Result};
use super::facade::{register_plugin, register_plugin_async, Init, PluginOptions, Registration};
use super::registry::PluginRegistry;
use super::surface::{PluginApi, PluginSurface};
use super::traits::{BudgetOverrides, Channel, PluginRuntime};

/// Plugin manifest, as read from JSON or TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct PluginManifest {
    /// Stable identifier; used as the label when `name` is absent
    pub id: Option<String>,
    /// Display label
    pub name: Option<String>,
    pub version: Option<String>,
    pub public: Option<bool>,
    pub runtime: Option<PluginRuntime>,
    /// Read capabilities
    #[serde(alias = "capabilities")]
    pub observe: Option<Vec<String>>,
    /// Write capabilities. Always refused; present so the request is named.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mutate: Vec<String>,
    pub budgets: Option<BudgetOverrides>,
    pub outputs: Option<Vec<Channel>>,
}

impl PluginManifest {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(raw)
            .map_err(|e| PluginError::Validation(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(raw)
            .map_err(|e| PluginError::Validation(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Require an `id` or a `name`, and refuse write capabilities.
    pub fn validate(&self) -> Result<()> {
        if self.label().is_none() {
            return Err(PluginError::Validation(
                "manifest requires an id or a name".into(),
            ));
        }
        if !self.mutate.is_empty() {
            return Err(PluginError::contract(
                self.label().unwrap_or_default(),
                format!(
                    "mutations are not permitted for plugins (requested: {})",
                    self.mutate.join(", ")
                ),
            ));
        }
        Ok(())
    }

    /// Display label: `name`, falling back to `id`. Blank values count as
    /// absent.
    pub fn label(&self) -> Option<&str> {
        fn present(value: &Option<String>) -> Option<&str> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
        }
        present(&self.name).or_else(|| present(&self.id))
    }

    /// Merge manifest fields over `opts`. Manifest values win.
    pub fn merge(&self, mut opts: PluginOptions) -> PluginOptions {
        if let Some(id) = &self.id {
            opts.id = Some(id.clone());
        }
        if let Some(version) = &self.version {
            opts.version = Some(version.clone());
        }
        if let Some(public) = self.public {
            opts.public = Some(public);
        }
        if let Some(runtime) = self.runtime {
            opts.runtime = runtime;
        }
        if let Some(observe) = &self.observe {
            opts.observe = observe.clone();
        }
        if let Some(budgets) = self.budgets {
            opts.budgets = Some(budgets);
        }
        if let Some(outputs) = &self.outputs {
            opts.outputs = outputs.clone();
        }
        opts
    }
}

/// Synchronous factory accepted by [`create_plugin`].
pub type SyncFactory = Box<dyn FnOnce(&PluginContext) -> anyhow::Result<Init> + Send + 'static>;

/// What a manifest is paired with.
pub enum PluginSource {
    /// A ready-made surface, wrapped in a trivial factory
    Hooks(PluginSurface),
    Factory(SyncFactory),
}

impl PluginSource {
    pub fn factory(
        factory: impl FnOnce(&PluginContext) -> anyhow::Result<Init> + Send + 'static,
    ) -> Self {
        Self::Factory(Box::new(factory))
    }
}

impl From<PluginSurface> for PluginSource {
    fn from(surface: PluginSurface) -> Self {
        Self::Hooks(surface)
    }
}

/// Register a manifest-described plugin through the synchronous façade.
///
/// A factory that returns [`Init::Pending`] fails with a validation error
/// naming [`create_plugin_async`].
pub fn create_plugin(
    registry: &PluginRegistry,
    manifest: &PluginManifest,
    source: PluginSource,
    opts: PluginOptions,
) -> Result<Registration> {
    manifest.validate()?;
    let label = manifest.label().unwrap_or_default().to_string();
    let opts = manifest.merge(opts);
    match source {
        PluginSource::Hooks(surface) => {
            register_plugin(registry, &label, move |_ctx| Ok(Init::Ready(surface)), opts)
        }
        PluginSource::Factory(factory) => register_plugin(registry, &label, factory, opts),
    }
}

/// Register a manifest-described plugin through the asynchronous façade.
pub async fn create_plugin_async<F, Fut>(
    registry: &PluginRegistry,
    manifest: &PluginManifest,
    factory: F,
    opts: PluginOptions,
) -> Result<PluginApi>
where
    F: FnOnce(PluginContext) -> Fut,
    Fut: Future<Output = anyhow::Result<PluginSurface>>,
{
    manifest.validate()?;
    let label = manifest.label().unwrap_or_default().to_string();
    register_plugin_async(registry, &label, factory, manifest.merge(opts)).await
}
