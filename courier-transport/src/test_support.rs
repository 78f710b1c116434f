//! Shared doubles for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use courier_core::qos::QoS;

use crate::adapter::{EventSink, MqttAdapter, SubscribeRequest, SubscribeStatus};
use crate::error::AdapterError;
use crate::postman::Postman;

/// Postman that records every callback as a readable line.
pub(crate) struct RecordingPostman {
    events: Mutex<Vec<String>>,
}

impl RecordingPostman {
    pub(crate) fn new() -> Arc<RecordingPostman> {
        Arc::new(RecordingPostman {
            events: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn take_events(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl Postman for RecordingPostman {
    fn subscription_available(&self, topic: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("available {}", topic));
    }

    fn subscription_unavailable(&self, topic: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("unavailable {}", topic));
    }

    fn post(&self, topic: &str, payload: Bytes) {
        self.events.lock().unwrap().push(format!(
            "post {}: {}",
            topic,
            String::from_utf8_lossy(&payload)
        ));
    }

    fn subscription_failed(
        &self,
        topic: &str,
        description: &str,
    ) -> Result<(), crate::postman::SubscriptionFailure> {
        self.events
            .lock()
            .unwrap()
            .push(format!("failed {}: {}", topic, description));
        Ok(())
    }
}

/// Adapter double recording every call and handing out sequential mids.
pub(crate) struct TestAdapter {
    sink: Mutex<Option<EventSink>>,
    next_mid: AtomicU16,
    pub(crate) subscribes: Mutex<Vec<String>>,
    pub(crate) unsubscribes: Mutex<Vec<String>>,
    pub(crate) publishes: Mutex<Vec<(String, Vec<u8>, QoS, bool)>>,
    pub(crate) lifecycle: Mutex<Vec<&'static str>>,
    pub(crate) fail_publish: AtomicBool,
}

impl TestAdapter {
    pub(crate) fn new() -> Arc<TestAdapter> {
        Arc::new(TestAdapter {
            sink: Mutex::new(None),
            next_mid: AtomicU16::new(1),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
        })
    }

    pub(crate) fn sink(&self) -> EventSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("callbacks not registered")
    }

    /// The mid handed out by the most recent subscribe call.
    pub(crate) fn last_mid(&self) -> u16 {
        self.next_mid.load(Ordering::SeqCst) - 1
    }
}

impl MqttAdapter for TestAdapter {
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
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AdapterError::NoConnection);
        }
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
