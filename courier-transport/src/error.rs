//! Transport error types.

use courier_core::error::{CodecError, TopicError};
use thiserror::Error;

use crate::postman::SubscriptionFailure;

/// Errors reported by the wire-level MQTT adapter.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("no connection to broker")]
    NoConnection,

    #[error("connection to broker lost")]
    ConnectionLost,

    #[error("MQTT client error: {0}")]
    Client(String),
}

/// Errors that can occur in the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    SubscriptionFailed(#[from] SubscriptionFailure),

    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport manager is not running")]
    ManagerStopped,
}

pub type Result<T> = std::result::Result<T, TransportError>;
