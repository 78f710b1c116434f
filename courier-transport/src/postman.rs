//! The postman interface: the callback bundle that turns transport events
//! into application events for one subscription.

use bytes::Bytes;
use thiserror::Error;

/// A broker subscription could not be established.
#[derive(Debug, Clone, Error)]
#[error("subscription failed, topic_filter='{topic}', description='{description}'")]
pub struct SubscriptionFailure {
    pub topic: String,
    pub description: String,
}

/// Reaction of a postman to a failed subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureReaction {
    /// Report the failure as an error. It propagates out of the transport
    /// manager's event loop and stops the manager.
    #[default]
    PropagateError,

    /// Emit a [`TopicEvent::SubscriptionFailed`](crate::mailbox::TopicEvent)
    /// for the application to handle.
    SendNotification,
}

/// Delivery target for one subscription.
///
/// Postmen are held behind `Arc` by the transport manager, the delivery trie,
/// and the topic mailbox that produced them; two postman handles designate
/// the same postman iff their `Arc`s point at the same object.
pub trait Postman: Send + Sync {
    /// The subscription has been acknowledged by the broker.
    fn subscription_available(&self, topic: &str);

    /// The subscription was lost because the broker connection went down.
    fn subscription_unavailable(&self, topic: &str);

    /// An inbound message on a topic matching the subscription.
    fn post(&self, topic: &str, payload: Bytes);

    /// The subscription attempt failed.
    ///
    /// The default implementation reports the failure as an error, which
    /// propagates out of the transport manager's event loop.
    fn subscription_failed(
        &self,
        topic: &str,
        description: &str,
    ) -> Result<(), SubscriptionFailure> {
        Err(SubscriptionFailure {
            topic: topic.to_string(),
            description: description.to_string(),
        })
    }
}
