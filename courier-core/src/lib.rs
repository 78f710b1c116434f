//! Core types for the Courier MQTT transport layer.
//!
//! This crate provides the building blocks the transport is assembled from:
//! topic splitting and validation, the wildcard-aware subscription trie used
//! for message routing, QoS levels, and the payload codec seam.

pub mod codec;
pub mod error;
pub mod qos;
pub mod topic;
pub mod trie;

pub use error::{CodecError, TopicError};
pub use qos::QoS;
pub use trie::SubscriptionTrie;
