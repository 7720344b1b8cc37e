#![cfg(feature = "runtime-wasm")]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;

use warden::config::PluginsConfig;
use warden::plugins::{
    JsonCodec, PluginErrorKind, PluginManifest, PluginOptions, PluginRegistry, PluginRuntime,
    SinkOverrides, WasmPluginLoader,
};

/// Echoes every payload; `onBoot` also emits a MessagePack `{"type":"log"}`
/// on channel 1 and an unknown channel 9.
const MSGPACK_ECHO: &str = r#"
(module
  (import "env" "host_emit" (func $emit (param i32 i32 i32)))
  (import "env" "host_now" (func $now (result i64)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 2048))
  (global $freed (mut i32) (i32.const 0))
  (data (i32.const 64) "\81\a4type\a3log")
  (func (export "__alloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))
  (func (export "__free") (param i32)
    (global.set $freed (i32.add (global.get $freed) (i32.const 1))))
  (func (export "plugin_init") (param i32 i32) (result i32 i32)
    (drop (call $now))
    (i32.const 0) (i32.const 0))
  (func (export "plugin_call") (param $op i32) (param $ptr i32) (param $len i32) (result i32 i32)
    (if (i32.eq (local.get $op) (i32.const 1))
      (then
        (call $emit (i32.const 1) (i32.const 64) (i32.const 10))
        (call $emit (i32.const 9) (i32.const 64) (i32.const 10))))
    (local.get $ptr) (local.get $len)))
"#;

fn registry() -> PluginRegistry {
    PluginRegistry::new(PluginsConfig::default())
}

#[tokio::test]
async fn module_without_call_export_fails_before_registration() {
    let wasm = wat::parse_str(
        r#"
(module
  (memory (export "memory") 1)
  (func (export "__alloc") (param i32) (result i32) (i32.const 1024))
  (func (export "plugin_init") (param i32 i32) (result i32 i32) (i32.const 0) (i32.const 0)))
"#,
    )
    .unwrap();
    let manifest = PluginManifest::from_json_str(r#"{"name": "Broken"}"#).unwrap();
    let registry = registry();

    let err = WasmPluginLoader::new(wasm, manifest)
        .load(&registry, PluginOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), PluginErrorKind::Abi);
    assert!(!registry.has("Broken"));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn msgpack_module_loads_from_disk_and_emits() {
    let mut module = tempfile::NamedTempFile::new().unwrap();
    module.write_all(&wat::parse_str(MSGPACK_ECHO).unwrap()).unwrap();
    let manifest = PluginManifest::from_toml_str(
        r#"
name = "Echo"
version = "0.3.0"
outputs = ["log", "overlay"]
"#,
    )
    .unwrap();

    let registry = registry();
    let seen: Arc<Mutex<Vec<(&'static str, Value)>>> = Arc::default();
    let log = Arc::clone(&seen);
    let overlay = Arc::clone(&seen);
    registry.set_output_sinks(
        SinkOverrides::default()
            .log(move |event| {
                log.lock().push(("log", event.clone()));
                Ok(())
            })
            .overlay(move |event| {
                overlay.lock().push(("overlay", event.clone()));
                Ok(())
            }),
    );

    let api = WasmPluginLoader::from_file(module.path(), manifest)
        .unwrap()
        .load(&registry, PluginOptions::default())
        .await
        .unwrap();

    let payload = json!({"graph": {"nodes": [1, 2, 3]}, "ok": true});
    assert_eq!(api.call("onGraphReady", &payload).unwrap(), payload);

    api.call("onBoot", &json!({})).unwrap();
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ("log", json!({"type": "log"})));
    assert_eq!(seen[1].0, "overlay");

    let record = registry.get("echo").unwrap();
    assert_eq!(record.runtime(), PluginRuntime::Binary);
    assert_eq!(record.version(), "0.3.0");
    assert_eq!(api.status()["runtime"], "binary");
}

#[tokio::test]
async fn undeclared_channel_is_dropped() {
    let registry = registry();
    let delivered: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = Arc::clone(&delivered);
    registry.set_output_sinks(SinkOverrides::default().overlay(move |event| {
        sink.lock().push(event.clone());
        Ok(())
    }));

    let manifest = PluginManifest {
        name: Some("LogOnly".into()),
        outputs: Some(vec![warden::plugins::Channel::Log]),
        ..PluginManifest::default()
    };
    let api = WasmPluginLoader::new(wat::parse_str(MSGPACK_ECHO).unwrap(), manifest)
        .load(&registry, PluginOptions::default())
        .await
        .unwrap();
    api.call("onBoot", &json!(null)).unwrap();
    assert!(delivered.lock().is_empty());
}

#[tokio::test]
async fn fuel_limit_stops_runaway_guests() {
    let wasm = wat::parse_str(
        r#"
(module
  (memory (export "memory") 1)
  (func (export "__alloc") (param i32) (result i32) (i32.const 1024))
  (func (export "plugin_init") (param i32 i32) (result i32 i32) (i32.const 0) (i32.const 0))
  (func (export "plugin_call") (param i32 i32 i32) (result i32 i32)
    (loop $forever (br $forever))
    (i32.const 0) (i32.const 0)))
"#,
    )
    .unwrap();
    let mut config = PluginsConfig::default();
    config.bridge.fuel_limit = 10_000;
    let registry = PluginRegistry::new(config);

    let api = WasmPluginLoader::new(wasm, PluginManifest::from_json_str(r#"{"id": "spin"}"#).unwrap())
        .with_codec(Arc::new(JsonCodec))
        .load(&registry, PluginOptions::default())
        .await
        .unwrap();

    let err = api.call("onPerf", &json!(null)).unwrap_err();
    assert_eq!(err.kind(), PluginErrorKind::Hook);
    assert_eq!(api.error().len(), 1);
    assert!(registry.get("spin").unwrap().has_error());
}
