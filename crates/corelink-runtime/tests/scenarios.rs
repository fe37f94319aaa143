//! End-to-end runs through a real kernel and connectors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use corelink_kernel::health::COMPONENT_REGISTRY;
use corelink_runtime::{CoreError, Connector, DeliveryMode, Event, Kernel, KernelConfig, handler};
use corelink_types::{AppState, Capabilities, Metadata, Severity};
use serde_json::{Value, json};

async fn start_kernel(config: KernelConfig) -> Kernel {
    let kernel = Kernel::new(config);
    kernel.start().await.expect("kernel starts");
    kernel
}

fn manual_health() -> KernelConfig {
    KernelConfig {
        auto_heal: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn wildcard_subscription_between_connectors() {
    let kernel = start_kernel(manual_health()).await;
    let received: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));

    let viewer = Connector::new("viewer", "1.0");
    let sink = Arc::clone(&received);
    viewer
        .subscribe(
            "scene.*",
            handler(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(event);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();
    viewer.connect(&kernel).await.unwrap();

    let director = Connector::new("director", "1.0");
    let director_handle = director.connect(&kernel).await.unwrap();

    director.emit("scene.ready", json!({"frame": 7}), None).await.unwrap();
    director.emit("shot.ready", json!({"frame": 8}), None).await.unwrap();

    let events = received.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, "scene.ready");
    assert_eq!(events[0].payload, json!({"frame": 7}));
    assert_eq!(events[0].source, director_handle.app_id);

    kernel.stop().await.unwrap();
}

#[tokio::test]
async fn wildcard_does_not_match_bare_prefix() {
    let kernel = start_kernel(manual_health()).await;
    let hits = Arc::new(AtomicUsize::new(0));

    let viewer = Connector::new("viewer", "1.0");
    let seen = Arc::clone(&hits);
    viewer
        .subscribe(
            "scene.*",
            handler(move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();
    viewer.connect(&kernel).await.unwrap();

    let director = Connector::new("director", "1.0");
    director.connect(&kernel).await.unwrap();
    for topic in ["scene", "scenery", "scene.a.b"] {
        director.emit(topic, Value::Null, None).await.unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_handler_does_not_block_the_others() {
    let kernel = start_kernel(manual_health()).await;
    let first = Arc::new(AtomicUsize::new(0));
    let third = Arc::new(AtomicUsize::new(0));

    let listener = Connector::new("listener", "1.0");
    let counter = Arc::clone(&first);
    listener
        .subscribe(
            "alarm",
            handler(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();
    listener
        .subscribe("alarm", handler(|_| async { Err::<Value, _>(CoreError::Handler("sensor offline".into())) }))
        .unwrap();
    let counter = Arc::clone(&third);
    listener
        .subscribe(
            "alarm",
            handler(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();
    listener.connect(&kernel).await.unwrap();

    let siren = Connector::new("siren", "1.0");
    siren.connect(&kernel).await.unwrap();
    siren.emit("alarm", json!("fire"), None).await.unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(third.load(Ordering::SeqCst), 1);
    assert_eq!(kernel.status().router.handler_errors, 1);
}

#[tokio::test]
async fn disconnected_backlog_is_reported_and_healed() {
    let kernel = start_kernel(KernelConfig {
        disconnected_threshold: 10,
        ..manual_health()
    })
    .await;
    let registry = kernel.registry().unwrap();

    for n in 0..11 {
        let connector = Connector::new(format!("worker-{n}"), "1.0");
        connector.connect(&kernel).await.unwrap();
        connector.disconnect().await;
    }
    assert_eq!(registry.find_by_state(AppState::Disconnected).len(), 11);

    let report = kernel.check_now().unwrap();
    let warning = report
        .issues_for(COMPONENT_REGISTRY)
        .find(|i| i.severity == Severity::Warning)
        .expect("registry warning");
    assert!(warning.auto_remediable);

    let healed = kernel.heal_now().unwrap();
    assert_eq!(healed.fixed.len(), 1);
    assert_eq!(healed.remaining, 0);
    assert!(registry.find_by_state(AppState::Disconnected).is_empty());

    let after = kernel.check_now().unwrap();
    assert_eq!(after.issues_for(COMPONENT_REGISTRY).count(), 0);
    assert!(after.is_healthy());
}

#[tokio::test]
async fn unanswered_request_times_out_without_leaking() {
    let kernel = start_kernel(manual_health()).await;
    let client = Connector::new("pinger", "1.0");
    let handle = client.connect(&kernel).await.unwrap();

    let started = Instant::now();
    let err = client
        .request("ping", json!({"seq": 1}), Duration::from_millis(50))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, CoreError::Timeout { ref topic, timeout_ms: 50 } if topic == "ping"));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");

    let router = kernel.router().unwrap();
    assert!(router.subscriptions_owned_by(handle.app_id).is_empty());
    assert_eq!(router.subscription_count(), 0);
}

#[tokio::test]
async fn request_reply_across_queued_router() {
    let kernel = start_kernel(KernelConfig {
        delivery_mode: DeliveryMode::Queued,
        event_queue_capacity: 16,
        ..manual_health()
    })
    .await;

    let clock = Arc::new(Connector::new("clock", "1.0").with_capabilities(["time"]));
    let me = Arc::clone(&clock);
    clock
        .subscribe(
            "time.now",
            handler(move |event: Event| {
                let me = Arc::clone(&me);
                async move { me.reply(&event, json!("12:00")).await.map(|_| Value::Null) }
            }),
        )
        .unwrap();
    clock.connect(&kernel).await.unwrap();

    let client = Connector::new("reader", "1.0");
    client.connect(&kernel).await.unwrap();
    let answer = client
        .request("time.now", Value::Null, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(answer, json!("12:00"));

    let timekeepers = kernel.registry().unwrap().find_by_capability("time");
    assert_eq!(timekeepers.len(), 1);

    clock.disconnect().await;
    kernel.stop().await.unwrap();
}

#[tokio::test]
async fn capacity_limit_applies_to_connectors() {
    let kernel = start_kernel(KernelConfig {
        max_apps: 1,
        ..manual_health()
    })
    .await;

    let x = Connector::new("X", "1.0");
    x.connect(&kernel).await.unwrap();
    let y = Connector::new("Y", "1.0");
    assert!(matches!(y.connect(&kernel).await, Err(CoreError::CapacityExceeded { max: 1 })));

    let registry = kernel.registry().unwrap();
    let x_id = x.app_id().unwrap();
    x.disconnect().await;
    assert!(registry.unregister(x_id));
    y.connect(&kernel).await.unwrap();
    assert_eq!(registry.count(), 1);

    let extra = registry.register("Z", "1.0", Capabilities::new(), Metadata::new());
    assert!(extra.is_err());
}

#[tokio::test]
async fn stopping_the_kernel_refuses_new_connections() {
    let kernel = start_kernel(manual_health()).await;
    kernel.stop().await.unwrap();
    let late = Connector::new("late", "1.0");
    assert!(matches!(late.connect(&kernel).await, Err(CoreError::KernelNotRunning)));
}
