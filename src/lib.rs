//! warden: governance and sandboxing for untrusted plugins.
//!
//! See [`plugins`] for the registry, façade and host bridge, and [`config`]
//! for the TOML configuration they read.

pub mod config;
pub mod plugins;
