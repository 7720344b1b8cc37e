use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use warden::config::{self, PluginsConfig};
use warden::plugins::{PluginManifest, PluginRegistry};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Load and inspect sandboxed plugins", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `warden=trace`; overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a WASM plugin into a fresh registry and print its introspection
    Load {
        /// WASM module
        module: PathBuf,
        /// Manifest file (.json or .toml)
        #[arg(short, long)]
        manifest: PathBuf,
        #[arg(long, value_enum, default_value_t = CodecArg::Msgpack)]
        codec: CodecArg,
        /// Invoke onBoot after registration
        #[arg(long)]
        boot: bool,
    },
    /// Print the config JSON schema
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecArg {
    Json,
    Msgpack,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<PluginsConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            PluginsConfig::load(path)
        }
        None => match PluginsConfig::default_path() {
            Some(path) => PluginsConfig::load(&path),
            None => Ok(PluginsConfig::default()),
        },
    }
}

fn read_manifest(path: &Path) -> Result<PluginManifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    let manifest = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => PluginManifest::from_json_str(&raw)?,
        _ => PluginManifest::from_toml_str(&raw)?,
    };
    Ok(manifest)
}

#[cfg(feature = "runtime-wasm")]
fn load_plugin(
    registry: &PluginRegistry,
    module: &Path,
    manifest: PluginManifest,
    codec: CodecArg,
    boot: bool,
) -> Result<()> {
    use serde_json::json;
    use std::sync::Arc;
    use warden::plugins::{
        wire_plugin_sinks, Codec, JsonCodec, MsgPackCodec, PluginOptions, SinkOverrides,
        WasmPluginLoader,
    };

    wire_plugin_sinks(registry, SinkOverrides::tracing());
    let codec: Arc<dyn Codec> = match codec {
        CodecArg::Json => Arc::new(JsonCodec),
        CodecArg::Msgpack => Arc::new(MsgPackCodec),
    };
    let loader = WasmPluginLoader::from_file(module, manifest)?.with_codec(codec);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let api = runtime.block_on(loader.load(registry, PluginOptions::default()))?;

    if boot {
        if let Err(e) = api.call("onBoot", &json!({})) {
            tracing::warn!(plugin = %api.label(), error = %e, "onBoot failed");
        }
    }

    let report = json!({
        "status": registry.status(),
        "data": registry.data(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    registry.shutdown();
    Ok(())
}

#[cfg(not(feature = "runtime-wasm"))]
fn load_plugin(
    _registry: &PluginRegistry,
    _module: &Path,
    _manifest: PluginManifest,
    _codec: CodecArg,
    _boot: bool,
) -> Result<()> {
    bail!("warden was built without WASM support. Rebuild with --features runtime-wasm")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Commands::Schema => {
            println!("{}", config::schema_json()?);
            Ok(())
        }
        Commands::Load {
            module,
            manifest,
            codec,
            boot,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let registry = PluginRegistry::new(config);
            let manifest = read_manifest(&manifest)?;
            load_plugin(&registry, &module, manifest, codec, boot)
        }
    }
}
