//! Error types for the Courier core crate.

use thiserror::Error;

/// Error type for topic validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// Topic is empty (zero length).
    #[error("topic name cannot be empty")]
    Empty,

    /// Topic exceeds maximum length.
    #[error("topic name exceeds maximum length of {} bytes", crate::topic::MAX_TOPIC_LENGTH)]
    TooLong,

    /// Topic contains null character (U+0000).
    #[error("topic name cannot contain null character")]
    ContainsNullChar,

    /// Wildcard characters not allowed in publish topics.
    #[error("wildcard characters (+, #) not allowed in publish topics")]
    WildcardInPublishTopic,

    /// Single-level wildcard (+) must occupy entire level.
    #[error("single-level wildcard (+) must occupy entire topic level")]
    InvalidSingleLevelWildcard,

    /// Multi-level wildcard (#) must be at end and occupy entire level.
    #[error("multi-level wildcard (#) must be at end and occupy entire level")]
    InvalidMultiLevelWildcard,
}

/// Error type for payload codec failures.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("payload encoding failed: {0}")]
    Encode(String),

    #[error("payload decoding failed: {0}")]
    Decode(String),
}
