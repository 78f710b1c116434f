//! End-to-end tests driving the transport manager event loop against a
//! recording mock adapter.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{self, timeout};

use courier_transport::{
    subscribe, AdapterError, AdapterLogLevel, BrokerEvent, ConnectionParams, EventSink,
    FailureReaction, MqttAdapter, Postman, QoS, SubscribeRequest, SubscribeStatus, TopicEvent,
    TransportError, TransportManager, Will,
};

/// Records every adapter call and exposes the callback sink so tests can
/// play the broker side.
struct MockAdapter {
    sink: Mutex<Option<EventSink>>,
    next_mid: AtomicU16,
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    publishes: Mutex<Vec<(String, Vec<u8>, QoS, bool)>>,
    lifecycle: Mutex<Vec<&'static str>>,
}

impl MockAdapter {
    fn new() -> Arc<MockAdapter> {
        Arc::new(MockAdapter {
            sink: Mutex::new(None),
            next_mid: AtomicU16::new(1),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Vec::new()),
        })
    }

    fn sink(&self) -> EventSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("callbacks not registered")
    }

    fn last_mid(&self) -> u16 {
        self.next_mid.load(Ordering::SeqCst) - 1
    }

    fn subscribe_count(&self) -> usize {
        self.subscribes.lock().unwrap().len()
    }

    fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.lock().unwrap().len()
    }

    fn lifecycle(&self) -> Vec<&'static str> {
        self.lifecycle.lock().unwrap().clone()
    }
}

impl MqttAdapter for MockAdapter {
    fn register_callbacks(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn connect_async(&self, _host: &str, _port: u16, _keepalive: u16) -> Result<(), AdapterError> {
        self.lifecycle.lock().unwrap().push("connect_async");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), AdapterError> {
        self.lifecycle.lock().unwrap().push("disconnect");
        Ok(())
    }

    fn subscribe(&self, filter: &str, _qos: QoS) -> Result<SubscribeRequest, AdapterError> {
        self.subscribes.lock().unwrap().push(filter.to_string());
        Ok(SubscribeRequest {
            mid: self.next_mid.fetch_add(1, Ordering::SeqCst),
            status: SubscribeStatus::Sent,
        })
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), AdapterError> {
        self.unsubscribes.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16, AdapterError> {
        self.publishes
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        Ok(0)
    }

    fn will_set(
        &self,
        _topic: &str,
        _payload: &[u8],
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), AdapterError> {
        self.lifecycle.lock().unwrap().push("will_set");
        Ok(())
    }

    fn loop_start(&self) -> Result<(), AdapterError> {
        self.lifecycle.lock().unwrap().push("loop_start");
        Ok(())
    }

    fn loop_stop(&self, _force: bool) -> Result<(), AdapterError> {
        self.lifecycle.lock().unwrap().push("loop_stop");
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn event_label(event: &TopicEvent) -> String {
    match event {
        TopicEvent::Message { topic, payload } => {
            format!("message {} {}", topic, String::from_utf8_lossy(payload))
        }
        TopicEvent::SubscriptionAvailable { topic } => format!("available {}", topic),
        TopicEvent::SubscriptionUnavailable { topic } => format!("unavailable {}", topic),
        TopicEvent::SubscriptionFailed { topic, description } => {
            format!("failed {}: {}", topic, description)
        }
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for a mailbox event")
        .expect("event channel closed")
}

/// Drives the spawned manager task until `cond` holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition was not reached in time");
}

/// Lets queued inputs drain so absence of an effect can be asserted.
async fn settle() {
    time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test(start_paused = true)]
async fn startup_broadcasts_and_shutdown_stops_the_adapter() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    manager.set_will(&Will::new("status/it-client", "gone")).unwrap();

    let mut broker_events = handle.broker_events();
    let runner = tokio::spawn(manager.run());

    wait_until(|| adapter.lifecycle().contains(&"connect_async")).await;
    assert_eq!(broker_events.recv().await.unwrap(), BrokerEvent::Disconnected);

    adapter.sink().on_connect(0);
    assert_eq!(broker_events.recv().await.unwrap(), BrokerEvent::Connected);

    // Adapter log lines are bridged into tracing without further effects.
    adapter.sink().on_log(AdapterLogLevel::Debug, "keepalive check");

    handle.shutdown();
    runner.await.unwrap().unwrap();

    let lifecycle = adapter.lifecycle();
    assert_eq!(
        lifecycle,
        vec!["will_set", "loop_start", "connect_async", "disconnect", "loop_stop"]
    );
}

#[tokio::test(start_paused = true)]
async fn subscribe_ack_and_deliver_round_trip() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    adapter.sink().on_connect(0);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    subscribe(
        &handle,
        "foo/+/baz",
        |mailbox| {
            mailbox.add_handler(move |event| {
                let _ = events_tx.send(event_label(event));
            });
        },
        FailureReaction::SendNotification,
    )
    .unwrap();

    wait_until(|| adapter.subscribe_count() == 1).await;
    assert_eq!(*adapter.subscribes.lock().unwrap(), vec!["foo/+/baz"]);

    adapter.sink().on_subscribe(adapter.last_mid(), vec![0]);
    assert_eq!(next_event(&mut events).await, "available foo/+/baz");

    // Inbound fan-out happens synchronously on the adapter's thread.
    adapter.sink().on_message("foo/1/baz", b"hi", 0, false);
    assert_eq!(next_event(&mut events).await, "message foo/1/baz hi");

    // Non-matching topics are dropped with a warning.
    adapter.sink().on_message("elsewhere", b"no", 0, false);
    settle().await;
    assert!(events.try_recv().is_err());

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_subscriptions_in_order() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    adapter.sink().on_connect(0);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    subscribe(
        &handle,
        "t",
        |mailbox| {
            mailbox.add_handler(move |event| {
                let _ = events_tx.send(event_label(event));
            });
        },
        FailureReaction::SendNotification,
    )
    .unwrap();

    wait_until(|| adapter.subscribe_count() == 1).await;
    adapter.sink().on_subscribe(adapter.last_mid(), vec![0]);
    assert_eq!(next_event(&mut events).await, "available t");

    // Connection drops: the subscription becomes unavailable.
    adapter.sink().on_disconnect(7);
    assert_eq!(next_event(&mut events).await, "unavailable t");

    // Reconnect: the manager re-issues the broker subscribe on its own.
    adapter.sink().on_connect(0);
    wait_until(|| adapter.subscribe_count() == 2).await;
    adapter.sink().on_subscribe(adapter.last_mid(), vec![0]);
    assert_eq!(next_event(&mut events).await, "available t");

    settle().await;
    assert!(events.try_recv().is_err());

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_subscription_times_out() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (mut manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    manager.set_subscription_timeout(Duration::from_secs(2));
    let runner = tokio::spawn(manager.run());

    adapter.sink().on_connect(0);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    subscribe(
        &handle,
        "t",
        |mailbox| {
            mailbox.add_handler(move |event| {
                let _ = events_tx.send(event_label(event));
            });
        },
        FailureReaction::SendNotification,
    )
    .unwrap();

    wait_until(|| adapter.subscribe_count() == 1).await;
    let mid = adapter.last_mid();

    // No SUBACK ever arrives; the periodic check reports the timeout.
    assert_eq!(
        next_event(&mut events).await,
        "failed t: subscription timed out"
    );

    // The pending entry is gone, so a late SUBACK is dropped.
    adapter.sink().on_subscribe(mid, vec![0]);
    settle().await;
    assert!(events.try_recv().is_err());

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn rejected_subscription_reports_the_granted_qos() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    adapter.sink().on_connect(0);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    subscribe(
        &handle,
        "t",
        |mailbox| {
            mailbox.add_handler(move |event| {
                let _ = events_tx.send(event_label(event));
            });
        },
        FailureReaction::SendNotification,
    )
    .unwrap();

    wait_until(|| adapter.subscribe_count() == 1).await;

    // 0x80 is the SUBACK failure code.
    adapter.sink().on_subscribe(adapter.last_mid(), vec![128]);
    assert_eq!(next_event(&mut events).await, "failed t: unexpected qos: 128");

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn propagating_failure_stops_the_manager() {
    init_tracing();

    struct PropagatingPostman;
    impl Postman for PropagatingPostman {
        fn subscription_available(&self, _topic: &str) {}
        fn subscription_unavailable(&self, _topic: &str) {}
        fn post(&self, _topic: &str, _payload: Bytes) {}
        // Default subscription_failed propagates.
    }

    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    adapter.sink().on_connect(0);
    handle.subscribe_topic("t", Arc::new(PropagatingPostman)).unwrap();

    wait_until(|| adapter.subscribe_count() == 1).await;
    adapter.sink().on_subscribe(adapter.last_mid(), vec![128]);

    let result = runner.await.unwrap();
    match result {
        Err(TransportError::SubscriptionFailed(failure)) => {
            assert_eq!(failure.topic, "t");
            assert_eq!(failure.description, "unexpected qos: 128");
        }
        other => panic!("expected a propagated subscription failure, got {:?}", other),
    }

    // The adapter loop is stopped even on the error path.
    assert!(adapter.lifecycle().contains(&"loop_stop"));
}

#[tokio::test(start_paused = true)]
async fn removing_all_handlers_unsubscribes_exactly_once() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    adapter.sink().on_connect(0);

    let handler_ids = Arc::new(Mutex::new(Vec::new()));
    let mailbox = subscribe(
        &handle,
        "t",
        |mailbox| {
            let mut ids = handler_ids.lock().unwrap();
            ids.push(mailbox.add_handler(|_| {}));
            ids.push(mailbox.add_handler(|_| {}));
        },
        FailureReaction::SendNotification,
    )
    .unwrap();

    wait_until(|| adapter.subscribe_count() == 1).await;
    assert_eq!(mailbox.subscribers_count(), 2);

    let ids = handler_ids.lock().unwrap().clone();
    mailbox.remove_handler(ids[0]);
    settle().await;
    assert_eq!(adapter.unsubscribe_count(), 0);

    mailbox.remove_handler(ids[1]);
    wait_until(|| adapter.unsubscribe_count() == 1).await;

    settle().await;
    assert_eq!(adapter.unsubscribe_count(), 1);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn setup_without_handlers_registers_nothing() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    adapter.sink().on_connect(0);

    let mailbox = subscribe(&handle, "t", |_| {}, FailureReaction::SendNotification).unwrap();
    assert_eq!(mailbox.subscribers_count(), 0);

    settle().await;
    assert_eq!(adapter.subscribe_count(), 0);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_filter_is_rejected_before_reaching_the_manager() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    let result = subscribe(
        &handle,
        "t/#/x",
        |mailbox| {
            mailbox.add_handler(|_| {});
        },
        FailureReaction::SendNotification,
    );
    assert!(matches!(result, Err(TransportError::InvalidTopic(_))));

    settle().await;
    assert_eq!(adapter.subscribe_count(), 0);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn publish_goes_straight_to_the_adapter() {
    init_tracing();
    let adapter = MockAdapter::new();
    let (manager, handle) =
        TransportManager::new(adapter.clone(), ConnectionParams::new("it-client", "localhost"));
    let runner = tokio::spawn(manager.run());

    handle.publish("metrics/cpu", "0.42");

    let publishes = adapter.publishes.lock().unwrap().clone();
    assert_eq!(publishes.len(), 1);
    let (topic, payload, qos, retain) = &publishes[0];
    assert_eq!(topic, "metrics/cpu");
    assert_eq!(payload, b"0.42");
    assert_eq!(*qos, QoS::AtMostOnce);
    assert!(!retain);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}
