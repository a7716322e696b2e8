//! End-to-end coverage of the fire-and-forget publish path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use ember_bus::{
    handler_fn, Bus, BusConfig, BusError, BusLogger, DispatchMode, Envelope, Handler, LogLevel,
    Matcher, PublishOpts, SchemaRegistry, SubscribeOpts,
};

fn accept_any() -> SchemaRegistry {
    SchemaRegistry::new().with_schema("test.event", "1.0", |_: &Value| true)
}

async fn make_bus(registry: SchemaRegistry) -> Arc<Bus> {
    Bus::new(BusConfig::with_registry(registry)).await.unwrap()
}

/// Captures every structured record the bus emits.
#[derive(Default)]
struct RecordingLogger {
    records: Mutex<Vec<(LogLevel, String, Value)>>,
}

impl RecordingLogger {
    fn events(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event, _)| event.clone())
            .collect()
    }
}

impl BusLogger for RecordingLogger {
    fn log(&self, level: LogLevel, event: &str, fields: &Value) {
        self.records
            .lock()
            .unwrap()
            .push((level, event.to_string(), fields.clone()));
    }
}

#[tokio::test]
async fn basic_publish_reaches_the_listener_once() {
    let bus = make_bus(accept_any()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.subscribe(
        "test.event",
        handler_fn(move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(envelope).unwrap();
                Ok(true)
            }
        }),
        SubscribeOpts::default(),
    )
    .await
    .unwrap();

    let published = bus
        .publish("test.event", json!({"data": 42}), PublishOpts::module("m"))
        .await
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.message_type, "test.event");
    assert_eq!(seen.payload, json!({"data": 42}));
    assert_eq!(seen.module, "m");
    assert_eq!(seen.correlation_id, published.correlation_id);
    assert!(seen.causation_path.is_empty());

    // Exactly once.
    assert!(rx.try_recv().is_err());

    bus.close(None).await;
}

#[tokio::test]
async fn publish_requires_module_and_schema() {
    let bus = make_bus(accept_any()).await;
    let invoked = Arc::new(AtomicUsize::new(0));
    {
        let invoked = Arc::clone(&invoked);
        bus.subscribe(
            "test.event",
            handler_fn(move |_| {
                let invoked = Arc::clone(&invoked);
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            }),
            SubscribeOpts::default(),
        )
        .await
        .unwrap();
    }

    let err = bus
        .publish("test.event", json!({}), PublishOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::MissingModule));

    let err = bus
        .publish("unknown.event", json!({}), PublishOpts::module("m"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaMissing { .. }));

    let err = bus
        .publish(
            "test.event",
            json!({}),
            PublishOpts::module("m").with_schema_version("9.9"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaMissing { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    bus.close(None).await;
}

#[tokio::test]
async fn rejected_payload_raises_and_skips_listeners() {
    let registry =
        SchemaRegistry::new().with_schema("test.event", "1.0", |p: &Value| p.get("n").is_some());
    let logger = Arc::new(RecordingLogger::default());
    let mut config = BusConfig::with_registry(registry);
    config.logger = Some(logger.clone());
    let bus = Bus::new(config).await.unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    {
        let invoked = Arc::clone(&invoked);
        bus.subscribe(
            "test.event",
            handler_fn(move |_| {
                let invoked = Arc::clone(&invoked);
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            }),
            SubscribeOpts::default(),
        )
        .await
        .unwrap();
    }

    let err = bus
        .publish("test.event", json!({"wrong": 1}), PublishOpts::module("m"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaValidation { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert!(logger
        .events()
        .contains(&"publish_schema_validation_failed".to_string()));
    bus.close(None).await;
}

#[tokio::test]
async fn subscriber_schema_gates_only_that_listener() {
    let bus = make_bus(accept_any()).await;
    let picky = Arc::new(AtomicUsize::new(0));
    let lax = Arc::new(AtomicUsize::new(0));

    {
        let picky = Arc::clone(&picky);
        bus.subscribe(
            "test.event",
            handler_fn(move |_| {
                let picky = Arc::clone(&picky);
                async move {
                    picky.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            }),
            SubscribeOpts::default().with_schema(|p: &Value| p.get("special").is_some()),
        )
        .await
        .unwrap();
    }
    {
        let lax = Arc::clone(&lax);
        bus.subscribe(
            "test.event",
            handler_fn(move |_| {
                let lax = Arc::clone(&lax);
                async move {
                    lax.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            }),
            SubscribeOpts::default(),
        )
        .await
        .unwrap();
    }

    bus.publish("test.event", json!({"plain": true}), PublishOpts::module("m"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(picky.load(Ordering::SeqCst), 0);
    assert_eq!(lax.load(Ordering::SeqCst), 1);
    bus.close(None).await;
}

#[tokio::test]
async fn listener_counts_and_unsubscribe() {
    let bus = make_bus(accept_any()).await;

    let shared = handler_fn(|_| async { Ok(true) });
    bus.subscribe("test.event", shared.clone(), SubscribeOpts::default())
        .await
        .unwrap();
    bus.subscribe(
        "test.event",
        handler_fn(|_| async { Ok(true) }),
        SubscribeOpts::default().with_meta(json!({"tag": "metered"})),
    )
    .await
    .unwrap();

    assert_eq!(bus.listener_count(Some("test.event")).await, 2);
    assert_eq!(bus.listener_count(None).await, 2);

    // By handler identity.
    let removed = bus
        .unsubscribe("test.event", Matcher::Handler(shared))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(bus.listener_count(Some("test.event")).await, 1);

    // By meta equality.
    let removed = bus
        .unsubscribe("test.event", Matcher::Meta(json!({"tag": "metered"})))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(bus.listener_count(Some("test.event")).await, 0);

    bus.subscribe(
        "test.event",
        handler_fn(|_| async { Ok(true) }),
        SubscribeOpts::default(),
    )
    .await
    .unwrap();
    bus.clear_listeners(Some("test.event")).await.unwrap();
    assert_eq!(bus.listener_count(None).await, 0);

    bus.close(None).await;
}

/// Listener that republishes a fixed event type derived from the incoming
/// envelope, reporting the publish outcome.
struct Republisher {
    target: &'static str,
    module: &'static str,
    outcome: mpsc::UnboundedSender<Result<Envelope, BusError>>,
}

#[async_trait]
impl Handler for Republisher {
    async fn handle(&self, bus: &Bus, envelope: &Envelope) -> anyhow::Result<bool> {
        let result = bus
            .publish(
                self.target,
                json!({}),
                PublishOpts::module(self.module).with_parent(envelope.clone()),
            )
            .await;
        let _ = self.outcome.send(result);
        Ok(true)
    }
}

#[tokio::test]
async fn republishing_loop_hits_cycle_detection() {
    let registry = SchemaRegistry::new()
        .with_schema("a", "1.0", |_: &Value| true)
        .with_schema("b", "1.0", |_: &Value| true);
    let mut config = BusConfig::with_registry(registry);
    config.max_depth = 2;
    let bus = Bus::new(config).await.unwrap();

    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();

    bus.subscribe(
        "a",
        Arc::new(Republisher {
            target: "b",
            module: "loop",
            outcome: a_tx,
        }),
        SubscribeOpts::default(),
    )
    .await
    .unwrap();
    bus.subscribe(
        "b",
        Arc::new(Republisher {
            target: "a",
            module: "loop",
            outcome: b_tx,
        }),
        SubscribeOpts::default(),
    )
    .await
    .unwrap();

    bus.publish("a", json!({}), PublishOpts::module("loop"))
        .await
        .unwrap();

    // First hop succeeds and shares the correlation chain.
    let hop = tokio::time::timeout(Duration::from_secs(2), a_rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(hop.causation_path.len(), 1);

    // Second hop closes the loop and must be rejected inside the handler.
    let rejected = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(rejected, BusError::CycleDetected { .. }));

    bus.close(None).await;
}

#[tokio::test]
async fn derivation_chains_stop_at_max_depth() {
    let registry = SchemaRegistry::new()
        .with_schema("e0", "1.0", |_: &Value| true)
        .with_schema("e1", "1.0", |_: &Value| true)
        .with_schema("e2", "1.0", |_: &Value| true)
        .with_schema("e3", "1.0", |_: &Value| true);
    let mut config = BusConfig::with_registry(registry);
    config.max_depth = 2;
    let bus = Bus::new(config).await.unwrap();

    let e0 = bus
        .publish("e0", json!({}), PublishOpts::module("m"))
        .await
        .unwrap();
    let e1 = bus
        .publish("e1", json!({}), PublishOpts::module("m").with_parent(e0))
        .await
        .unwrap();
    let e2 = bus
        .publish("e2", json!({}), PublishOpts::module("m").with_parent(e1))
        .await
        .unwrap();
    assert_eq!(e2.causation_path.len(), 2);

    let err = bus
        .publish("e3", json!({}), PublishOpts::module("m").with_parent(e2))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::MaxDepthExceeded { depth: 3, max_depth: 2 }));

    bus.close(None).await;
}

#[tokio::test]
async fn buffered_mode_applies_backpressure() {
    let mut config = BusConfig::with_registry(accept_any());
    config.mode = DispatchMode::Buffered {
        buffer_size: 1,
        concurrency: 1,
    };
    let bus = Bus::new(config).await.unwrap();

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        bus.subscribe(
            "test.event",
            handler_fn(move |_| {
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(true)
                }
            }),
            SubscribeOpts::default(),
        )
        .await
        .unwrap();
    }

    // Taken by the only worker, which then blocks.
    bus.publish("test.event", json!({"n": 1}), PublishOpts::module("m"))
        .await
        .unwrap();
    started.notified().await;

    // Queued; the buffer is now full.
    bus.publish("test.event", json!({"n": 2}), PublishOpts::module("m"))
        .await
        .unwrap();

    // Rejected.
    let err = bus
        .publish("test.event", json!({"n": 3}), PublishOpts::module("m"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::BufferFull));

    release.notify_one();
    release.notify_one();
    bus.close(None).await;
}

#[tokio::test]
async fn handler_failures_are_logged_not_raised() {
    let logger = Arc::new(RecordingLogger::default());
    let mut config = BusConfig::with_registry(accept_any());
    config.logger = Some(logger.clone());
    let bus = Bus::new(config).await.unwrap();

    bus.subscribe(
        "test.event",
        handler_fn(|_| async { Err(anyhow::anyhow!("listener exploded")) }),
        SubscribeOpts::default(),
    )
    .await
    .unwrap();

    // The publisher never observes the failure.
    bus.publish("test.event", json!({}), PublishOpts::module("m"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if logger.events().contains(&"handler_failed".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    bus.close(None).await;
}

#[tokio::test]
async fn closed_bus_rejects_everything_and_close_is_idempotent() {
    let bus = make_bus(accept_any()).await;
    bus.close(None).await;
    assert!(bus.is_closed());

    let err = bus
        .publish("test.event", json!({}), PublishOpts::module("m"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Closed));

    let err = bus
        .subscribe(
            "test.event",
            handler_fn(|_| async { Ok(true) }),
            SubscribeOpts::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Closed));

    let err = bus
        .unsubscribe("test.event", Matcher::Meta(json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Closed));

    // Second close is a no-op.
    bus.close(None).await;
    assert!(bus.is_closed());
}

#[tokio::test]
async fn panicking_logger_never_poisons_publish() {
    struct PanickyLogger;
    impl BusLogger for PanickyLogger {
        fn log(&self, _level: LogLevel, _event: &str, _fields: &Value) {
            panic!("sink exploded");
        }
    }

    let mut config = BusConfig::with_registry(accept_any());
    config.logger = Some(Arc::new(PanickyLogger));
    let bus = Bus::new(config).await.unwrap();

    bus.publish("test.event", json!({}), PublishOpts::module("m"))
        .await
        .unwrap();
    bus.close(None).await;
}
