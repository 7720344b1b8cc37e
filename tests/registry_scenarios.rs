use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use warden::config::PluginsConfig;
use warden::plugins::{
    register_plugin_async, Accessors, BudgetOverrides, CapabilityContract, Channel, Introspect,
    PluginErrorKind, PluginLifecycle, PluginMeta, PluginOptions, PluginRegistry, SinkOverrides,
    TokenBucket,
};

#[derive(Default)]
struct Probe {
    errors: Mutex<Vec<String>>,
}

impl Introspect for Probe {
    fn status(&self) -> Value {
        json!({"ok": true})
    }

    fn data(&self) -> Value {
        json!({"nodes": 3})
    }

    fn error(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.errors.lock().clone())
    }

    fn report(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

fn meta(label: &str) -> PluginMeta {
    PluginMeta::new(label).with_accessors(Accessors::from_introspect(Arc::new(Probe::default())))
}

fn registry() -> PluginRegistry {
    PluginRegistry::new(PluginsConfig::default())
}

#[test]
fn logger_burst_is_capped_by_events_per_second() {
    let registry = registry();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    registry.set_output_sinks(SinkOverrides::default().log(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let handle = registry
        .register(meta("Logger").with_budgets(BudgetOverrides::default().events_per_second(2)))
        .unwrap();
    let event = json!({"msg": "tick"});
    let results: Vec<bool> = (0..3).map(|_| handle.emit(Channel::Log, &event)).collect();

    assert_eq!(results, vec![true, true, false]);
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
}

#[test]
fn bucket_recovers_after_one_event_interval() {
    let start = Instant::now();
    let mut bucket = TokenBucket::starting_at(2, 64_000, 1024, start);
    assert!(bucket.try_consume_at(10, start));
    assert!(bucket.try_consume_at(10, start));
    assert!(!bucket.try_consume_at(10, start));
    assert!(bucket.try_consume_at(10, start + Duration::from_millis(500)));
}

#[tokio::test]
async fn rejected_async_factory_stays_visible() {
    let registry = registry();
    let result = register_plugin_async(
        &registry,
        "X",
        |_ctx| async { Err(anyhow::anyhow!("bundle missing")) },
        PluginOptions::default(),
    )
    .await;
    assert!(result.is_err());

    assert!(registry.has("X"));
    let record = registry.get("X").unwrap();
    assert!(!record.error().unwrap().is_empty());
    assert!(record.enabled());
    assert_eq!(record.lifecycle(), PluginLifecycle::ActiveWithErrors);

    let status = registry.status();
    assert_eq!(status.enabled, 1);
    assert_eq!(status.error_count, 1);
    assert_eq!(status.errors[0].label, "X");
}

#[test]
fn duplicate_labels_collide_case_insensitively() {
    let registry = registry();
    registry.register(meta("Metrics")).unwrap();
    let err = registry.register(meta("metrics")).unwrap_err();
    assert_eq!(err.kind(), PluginErrorKind::DuplicatePlugin);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get("METRICS").unwrap().label(), "Metrics");
}

#[test]
fn registered_key_is_lowercase_label() {
    let registry = registry();
    for label in ["Alpha", "beta", "GammaRay"] {
        registry.register(meta(label)).unwrap();
        assert!(registry.has(label));
        assert_eq!(registry.get(label).unwrap().key(), label.to_lowercase());
    }
    let labels: Vec<String> = registry.list().iter().map(|r| r.label().to_string()).collect();
    assert_eq!(labels, vec!["Alpha", "beta", "GammaRay"]);
}

#[test]
fn mutate_requests_leave_registry_untouched() {
    let registry = registry();
    let err = registry
        .register(meta("Writer").with_contract(CapabilityContract {
            observe: vec!["graph".into()],
            mutate: vec!["graph".into()],
        }))
        .unwrap_err();
    assert_eq!(err.kind(), PluginErrorKind::ContractViolation);
    assert!(registry.is_empty());
}

#[test]
fn upgrade_keeps_identity() {
    let registry = registry();
    let handle = registry
        .register(PluginMeta {
            activating: true,
            ..meta("Stub")
        })
        .unwrap();
    let before = registry.get("stub").unwrap();

    let upgraded = handle.upgrade(Accessors {
        status: Some(Arc::new(|| json!({"state": "active"}))),
        ..Accessors::default()
    });
    assert!(upgraded);

    let after = registry.get("stub").unwrap();
    assert_eq!(after.id(), before.id());
    assert_eq!(after.key(), before.key());
    assert_eq!(after.label(), before.label());
    assert_eq!(after.registered_at(), before.registered_at());
    assert_eq!(after.status(), json!({"state": "active"}));
    assert_eq!(after.data(), json!({"nodes": 3}));
    assert_eq!(after.lifecycle(), PluginLifecycle::Active);
}

#[test]
fn double_disable_runs_teardown_once() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    registry
        .register(meta("Overlay").with_teardown(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    assert!(registry.disable("overlay").is_some());
    registry.disable("overlay");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        registry.get("overlay").unwrap().lifecycle(),
        PluginLifecycle::Disabled
    );
}

#[test]
fn failing_sink_does_not_stop_sibling_plugins() {
    let registry = registry();
    registry.set_output_sinks(
        SinkOverrides::default()
            .log(|_| anyhow::bail!("disk full"))
            .metric(|_| Ok(())),
    );
    let noisy = registry.register(meta("Noisy")).unwrap();
    let quiet = registry.register(meta("Quiet")).unwrap();

    assert!(!noisy.emit(Channel::Log, &json!("line")));
    assert!(quiet.emit(Channel::Metric, &json!({"fps": 60})));
    assert_eq!(registry.len(), 2);
}

#[test]
fn shutdown_tears_down_and_empties() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    for label in ["One", "Two"] {
        let counter = Arc::clone(&calls);
        registry
            .register(meta(label).with_teardown(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }
    registry.shutdown();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(registry.is_empty());
}
