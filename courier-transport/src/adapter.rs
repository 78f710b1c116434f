//! The seam between the transport manager and the wire-level MQTT client
//! library.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use courier_core::qos::QoS;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::error::AdapterError;
use crate::manager::Input;
use crate::subscription::DeliveryMap;

/// Outcome of an accepted subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    /// The request went out on the wire.
    Sent,
    /// There is no broker connection right now.
    NoConnection,
    /// The connection went down while sending.
    ConnectionLost,
}

/// An accepted subscribe request and the message id assigned to it.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeRequest {
    pub mid: u16,
    pub status: SubscribeStatus,
}

/// Severity of a log line produced by the MQTT client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterLogLevel {
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

/// Thin interface over the wire-level MQTT client library.
///
/// Implementations must be callable from any thread. `subscribe` reports
/// `NoConnection`/`ConnectionLost` through [`SubscribeStatus`] rather than as
/// errors: the manager accepts such requests and relies on the subscription
/// timeout when the connection does not come back.
pub trait MqttAdapter: Send + Sync {
    /// Hand the adapter the callback bundle it must invoke for connection,
    /// subscription, message, and log events.
    fn register_callbacks(&self, sink: EventSink);

    fn connect_async(&self, host: &str, port: u16, keepalive: u16) -> Result<(), AdapterError>;

    fn disconnect(&self) -> Result<(), AdapterError>;

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<SubscribeRequest, AdapterError>;

    fn unsubscribe(&self, filter: &str) -> Result<(), AdapterError>;

    /// Publish a message. Returns the message id assigned by the client.
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16, AdapterError>;

    /// Set the will for the client. Only valid before the network loop runs.
    fn will_set(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), AdapterError>;

    /// Start the client's network loop.
    fn loop_start(&self) -> Result<(), AdapterError>;

    /// Stop the client's network loop, blocking until it is down.
    fn loop_stop(&self, force: bool) -> Result<(), AdapterError>;
}

/// Callback bundle given to [`MqttAdapter`] implementations.
///
/// Connection and subscription events are re-posted to the manager's input
/// channel and handled on the manager task. Inbound messages are fanned out
/// right here, on the adapter's thread, through the shared delivery trie.
#[derive(Clone)]
pub struct EventSink {
    inputs: mpsc::UnboundedSender<Input>,
    delivery: Arc<RwLock<DeliveryMap>>,
}

impl EventSink {
    pub(crate) fn new(
        inputs: mpsc::UnboundedSender<Input>,
        delivery: Arc<RwLock<DeliveryMap>>,
    ) -> EventSink {
        EventSink { inputs, delivery }
    }

    /// A connection attempt finished; `rc == 0` means success.
    pub fn on_connect(&self, rc: i32) {
        info!("Broker connect result, rc={}", rc);

        if rc == 0 {
            let _ = self.inputs.send(Input::Connected);
        }
    }

    /// The connection closed; `rc == 0` means a deliberate disconnect.
    pub fn on_disconnect(&self, rc: i32) {
        info!("Broker disconnect, rc={}", rc);

        if rc != 0 {
            let _ = self.inputs.send(Input::Disconnected);
        }
    }

    /// A SUBACK arrived for the subscribe request with the given message id.
    pub fn on_subscribe(&self, mid: u16, granted_qos: Vec<u8>) {
        if granted_qos.is_empty() {
            warn!("SUBACK with empty granted QoS list, mid={}", mid);
            return;
        }

        trace!("SUBACK, mid={}, granted_qos={:?}", mid, granted_qos);
        let _ = self.inputs.send(Input::SubscriptionAck { mid, granted_qos });
    }

    /// An inbound PUBLISH. Runs on the adapter's thread, concurrently with
    /// the manager task.
    pub fn on_message(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) {
        trace!(
            "Inbound message, topic={}, payloadlen={}, qos={}, retain={}",
            topic,
            payload.len(),
            qos,
            retain
        );

        let subscribers = self.delivery.read().unwrap().matches(topic);
        if subscribers.is_empty() {
            warn!(
                "Message for unregistered topic, topic={}, payloadlen={}",
                topic,
                payload.len()
            );
            return;
        }

        let payload = Bytes::copy_from_slice(payload);
        for entry in subscribers {
            entry.deliver_message(topic, &payload);
        }
    }

    /// A log line from the MQTT client library, bridged into `tracing`.
    pub fn on_log(&self, level: AdapterLogLevel, message: &str) {
        match level {
            AdapterLogLevel::Error => error!("[mqtt client] {}", message),
            AdapterLogLevel::Warning | AdapterLogLevel::Notice => {
                warn!("[mqtt client] {}", message)
            }
            AdapterLogLevel::Info => info!("[mqtt client] {}", message),
            AdapterLogLevel::Debug => debug!("[mqtt client] {}", message),
        }
    }
}
