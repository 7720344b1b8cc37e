//! Error taxonomy for plugin registration and execution.

use thiserror::Error;

/// Coarse classification of a [`PluginError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginErrorKind {
    Validation,
    ContractViolation,
    MissingIntrospection,
    DuplicatePlugin,
    CapacityExceeded,
    Abi,
    Factory,
    Hook,
}

/// Plugin system errors.
///
/// Everything up to and including `Abi` is raised before the registry is
/// touched. `Factory` and `Hook` come from the plugin's own code and are also
/// written into that plugin's error history.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Malformed call arguments
    #[error("invalid plugin arguments: {0}")]
    Validation(String),

    /// Requested write capabilities, or a surface shadowing a reserved name
    #[error("contract violation for plugin \"{label}\": {reason}")]
    ContractViolation { label: String, reason: String },

    /// Required introspection accessors were not supplied
    #[error("plugin \"{label}\" must provide {}", missing.join(", "))]
    MissingIntrospection {
        label: String,
        missing: Vec<&'static str>,
    },

    /// A plugin with the same normalized key already exists
    #[error("duplicate plugin: {0}")]
    DuplicatePlugin(String),

    /// Registry is at its configured maximum
    #[error("registry at capacity ({0})")]
    CapacityExceeded(usize),

    /// Binary module does not follow the host ABI
    #[error("plugin ABI error: {0}")]
    Abi(String),

    /// The plugin factory failed during activation
    #[error("plugin \"{label}\" failed to activate: {source}")]
    Factory {
        label: String,
        #[source]
        source: anyhow::Error,
    },

    /// A plugin hook failed after activation
    #[error("plugin \"{label}\" hook {hook} failed: {source}")]
    Hook {
        label: String,
        hook: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PluginError {
    pub fn kind(&self) -> PluginErrorKind {
        match self {
            Self::Validation(_) => PluginErrorKind::Validation,
            Self::ContractViolation { .. } => PluginErrorKind::ContractViolation,
            Self::MissingIntrospection { .. } => PluginErrorKind::MissingIntrospection,
            Self::DuplicatePlugin(_) => PluginErrorKind::DuplicatePlugin,
            Self::CapacityExceeded(_) => PluginErrorKind::CapacityExceeded,
            Self::Abi(_) => PluginErrorKind::Abi,
            Self::Factory { .. } => PluginErrorKind::Factory,
            Self::Hook { .. } => PluginErrorKind::Hook,
        }
    }

    pub(crate) fn contract(label: &str, reason: impl Into<String>) -> Self {
        Self::ContractViolation {
            label: label.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = PluginError> = std::result::Result<T, E>;
