//! Courier MQTT transport layer.
//!
//! This crate brokers between application-level subscribers/publishers and a
//! single MQTT broker connection. Applications register interest in topic
//! filters (MQTT `+`/`#` wildcards included) through per-topic mailboxes and
//! publish messages through the transport handle; the manager owns the broker
//! connection lifecycle, keeps per-filter subscription state across
//! reconnects, times out unacknowledged subscribes, and fans inbound messages
//! out to subscribers.
//!
//! The wire-level MQTT client stays behind the [`MqttAdapter`] trait; the
//! transport drives it and reacts to its callbacks through [`EventSink`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_transport::{
//!     subscribe, ConnectionParams, FailureReaction, MqttAdapter, TopicEvent, TransportManager,
//! };
//!
//! # fn mqtt_client() -> Arc<dyn MqttAdapter> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> courier_transport::Result<()> {
//!     let params = ConnectionParams::new("my-client", "localhost").port(1883);
//!     let (manager, handle) = TransportManager::new(mqtt_client(), params);
//!     let runner = tokio::spawn(manager.run());
//!
//!     let _mailbox = subscribe(
//!         &handle,
//!         "sensors/+/temperature",
//!         |mailbox| {
//!             mailbox.add_handler(|event| {
//!                 if let TopicEvent::Message { topic, payload } = event {
//!                     println!("{}: {} bytes", topic, payload.len());
//!                 }
//!             });
//!         },
//!         FailureReaction::SendNotification,
//!     )?;
//!
//!     handle.publish("sensors/kitchen/temperature", "21.5");
//!
//!     handle.shutdown();
//!     runner.await.expect("manager task panicked")?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod error;
pub mod mailbox;
pub mod manager;
pub mod options;
pub mod postman;
mod subscription;
#[cfg(test)]
mod test_support;

pub use adapter::{AdapterLogLevel, EventSink, MqttAdapter, SubscribeRequest, SubscribeStatus};
pub use error::{AdapterError, Result, TransportError};
pub use mailbox::{subscribe, HandlerId, LocalEndpoint, TopicEvent, TopicMailbox};
pub use manager::{BrokerEvent, TransportHandle, TransportManager};
pub use options::{ConnectionParams, Will};
pub use postman::{FailureReaction, Postman, SubscriptionFailure};

// Re-export commonly used types from courier-core
pub use courier_core::codec::{DecodePayload, EncodePayload};
pub use courier_core::qos::QoS;
