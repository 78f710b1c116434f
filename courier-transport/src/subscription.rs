//! Per-filter subscription bookkeeping shared between the manager and the
//! delivery trie.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::time::Instant;

use courier_core::trie::SubscriptionTrie;

use crate::postman::{Postman, SubscriptionFailure};

/// Trie used for routing inbound messages to subscription entries.
pub(crate) type DeliveryMap = SubscriptionTrie<SubscriptionRef>;

/// A broker subscribe whose SUBACK has not arrived yet.
#[derive(Debug)]
pub(crate) struct PendingSubscription {
    pub(crate) filter: String,
    pub(crate) initiated_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionStatus {
    /// Fresh topic filter, no subscription attempt yet.
    New,
    /// Successfully subscribed at the broker.
    Subscribed,
    /// Subscription lost because of disconnection from the broker.
    Unsubscribed,
    /// Subscription attempt failed.
    Failed,
}

/// State of one registered topic filter: its subscription status and the
/// postmen interested in it.
pub(crate) struct SubscriptionInfo {
    status: SubscriptionStatus,
    postmen: Vec<Arc<dyn Postman>>,
    // Populated only while status is Failed.
    failure_description: String,
}

impl SubscriptionInfo {
    fn new() -> SubscriptionInfo {
        SubscriptionInfo {
            status: SubscriptionStatus::New,
            postmen: Vec::new(),
            failure_description: String::new(),
        }
    }

    pub(crate) fn has_postmen(&self) -> bool {
        !self.postmen.is_empty()
    }

    /// The broker acknowledged the subscription.
    pub(crate) fn subscription_created(&mut self, topic: &str) {
        self.status = SubscriptionStatus::Subscribed;
        self.failure_description.clear();

        for postman in &self.postmen {
            postman.subscription_available(topic);
        }
    }

    /// The broker connection went down.
    pub(crate) fn subscription_lost(&mut self, topic: &str) {
        self.status = SubscriptionStatus::Unsubscribed;
        self.failure_description.clear();

        for postman in &self.postmen {
            postman.subscription_unavailable(topic);
        }
    }

    /// The subscription attempt failed.
    pub(crate) fn subscription_failed(
        &mut self,
        topic: &str,
        description: &str,
    ) -> Result<(), SubscriptionFailure> {
        self.status = SubscriptionStatus::Failed;
        self.failure_description = description.to_string();

        for postman in &self.postmen {
            postman.subscription_failed(topic, description)?;
        }

        Ok(())
    }

    /// Register a postman, immediately replaying the current status to it.
    /// Adding the same postman twice is a no-op.
    pub(crate) fn add_postman(
        &mut self,
        topic: &str,
        postman: Arc<dyn Postman>,
    ) -> Result<(), SubscriptionFailure> {
        if self.postmen.iter().any(|p| Arc::ptr_eq(p, &postman)) {
            return Ok(());
        }

        match self.status {
            SubscriptionStatus::Subscribed => postman.subscription_available(topic),
            SubscriptionStatus::Failed => {
                postman.subscription_failed(topic, &self.failure_description)?
            }
            _ => {}
        }

        // Stored only once the status replay went through.
        self.postmen.push(postman);
        Ok(())
    }

    pub(crate) fn remove_postman(&mut self, postman: &Arc<dyn Postman>) {
        self.postmen.retain(|p| !Arc::ptr_eq(p, postman));
    }

    /// Fan an inbound message out to every interested postman.
    pub(crate) fn deliver_message(&self, topic: &str, payload: &Bytes) {
        for postman in &self.postmen {
            postman.post(topic, payload.clone());
        }
    }
}

/// Shared handle to a [`SubscriptionInfo`]. One per registered filter, held
/// by both the registry and the delivery trie. Equality and hashing are by
/// pointer identity.
#[derive(Clone)]
pub(crate) struct SubscriptionRef(Arc<Mutex<SubscriptionInfo>>);

impl SubscriptionRef {
    pub(crate) fn new() -> SubscriptionRef {
        SubscriptionRef(Arc::new(Mutex::new(SubscriptionInfo::new())))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SubscriptionInfo> {
        self.0.lock().unwrap()
    }

    /// Deliver an inbound message. Callable from any thread.
    pub(crate) fn deliver_message(&self, topic: &str, payload: &Bytes) {
        self.lock().deliver_message(topic, payload);
    }
}

impl PartialEq for SubscriptionRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SubscriptionRef {}

impl Hash for SubscriptionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl std::fmt::Debug for SubscriptionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.lock();
        f.debug_struct("SubscriptionRef")
            .field("status", &info.status)
            .field("postmen", &info.postmen.len())
            .finish()
    }
}
