//! Per-topic mailboxes and the subscribe helper.
//!
//! A topic mailbox wraps an in-process message endpoint and counts the
//! handlers installed on it. When the count drops back to zero the mailbox
//! asks the transport manager to drop the broker subscription for its filter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use courier_core::topic::validate_subscribe_filter;

use crate::error::Result;
use crate::manager::{Input, TransportHandle};
use crate::postman::{FailureReaction, Postman, SubscriptionFailure};

/// Typed events delivered to a topic mailbox.
#[derive(Debug, Clone)]
pub enum TopicEvent {
    /// An inbound message on a topic matching the subscription.
    Message { topic: String, payload: Bytes },

    /// The subscription has been acknowledged by the broker.
    SubscriptionAvailable { topic: String },

    /// The subscription was lost because the connection went down.
    SubscriptionUnavailable { topic: String },

    /// The subscription attempt failed. Sent only by postmen created with
    /// [`FailureReaction::SendNotification`].
    SubscriptionFailed { topic: String, description: String },
}

type HandlerFn = Arc<dyn Fn(&TopicEvent) + Send + Sync>;
type FilterFn = Arc<dyn Fn(&TopicEvent) -> bool + Send + Sync>;

/// Identifier of a handler installed on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// In-process message endpoint: a named fan-out list of typed-event handlers.
pub struct LocalEndpoint {
    id: u64,
    name: String,
    handlers: Mutex<Vec<(HandlerId, HandlerFn)>>,
    delivery_filter: Mutex<Option<FilterFn>>,
}

impl LocalEndpoint {
    pub fn new() -> LocalEndpoint {
        let id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
        LocalEndpoint {
            id,
            name: format!("endpoint-{}", id),
            handlers: Mutex::new(Vec::new()),
            delivery_filter: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install an event handler.
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().unwrap().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns true when it was installed here.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let count_before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != count_before
    }

    /// Install a predicate that decides which events get delivered.
    pub fn set_delivery_filter<F>(&self, filter: F)
    where
        F: Fn(&TopicEvent) -> bool + Send + Sync + 'static,
    {
        *self.delivery_filter.lock().unwrap() = Some(Arc::new(filter));
    }

    /// Remove the delivery filter, letting every event through again.
    pub fn drop_delivery_filter(&self) {
        *self.delivery_filter.lock().unwrap() = None;
    }

    /// Deliver an event to every installed handler. Callable from any
    /// thread; handlers run outside the endpoint lock.
    pub fn deliver(&self, event: &TopicEvent) {
        if let Some(filter) = self.delivery_filter.lock().unwrap().clone() {
            if !filter(event) {
                return;
            }
        }

        let handlers: Vec<HandlerFn> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }
}

impl Default for LocalEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Postman that forwards transport callbacks as typed events to an endpoint.
struct EndpointPostman {
    endpoint: Arc<LocalEndpoint>,
    on_failure: FailureReaction,
}

impl Postman for EndpointPostman {
    fn subscription_available(&self, topic: &str) {
        self.endpoint.deliver(&TopicEvent::SubscriptionAvailable {
            topic: topic.to_string(),
        });
    }

    fn subscription_unavailable(&self, topic: &str) {
        self.endpoint.deliver(&TopicEvent::SubscriptionUnavailable {
            topic: topic.to_string(),
        });
    }

    fn post(&self, topic: &str, payload: Bytes) {
        self.endpoint.deliver(&TopicEvent::Message {
            topic: topic.to_string(),
            payload,
        });
    }

    fn subscription_failed(
        &self,
        topic: &str,
        description: &str,
    ) -> std::result::Result<(), SubscriptionFailure> {
        match self.on_failure {
            FailureReaction::SendNotification => {
                self.endpoint.deliver(&TopicEvent::SubscriptionFailed {
                    topic: topic.to_string(),
                    description: description.to_string(),
                });
                Ok(())
            }
            FailureReaction::PropagateError => Err(SubscriptionFailure {
                topic: topic.to_string(),
                description: description.to_string(),
            }),
        }
    }
}

/// A reference-counted per-topic endpoint.
///
/// Endpoint operations are forwarded to the wrapped [`LocalEndpoint`];
/// handler installation and removal additionally maintain the subscriber
/// count that keeps the broker subscription alive.
pub struct TopicMailbox {
    filter: String,
    // Weak: the mailbox must not keep the manager's input channel open.
    manager: mpsc::WeakUnboundedSender<Input>,
    endpoint: Arc<LocalEndpoint>,
    postman: Arc<dyn Postman>,
    subscribers: AtomicU32,
}

impl TopicMailbox {
    fn new(
        filter: String,
        manager: mpsc::WeakUnboundedSender<Input>,
        endpoint: Arc<LocalEndpoint>,
        postman: Arc<dyn Postman>,
    ) -> TopicMailbox {
        TopicMailbox {
            filter,
            manager,
            endpoint,
            postman,
            subscribers: AtomicU32::new(0),
        }
    }

    /// The topic filter this mailbox is tied to.
    pub fn topic_filter(&self) -> &str {
        &self.filter
    }

    pub fn id(&self) -> u64 {
        self.endpoint.id()
    }

    pub fn name(&self) -> &str {
        self.endpoint.name()
    }

    pub fn subscribers_count(&self) -> u32 {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Install an event handler, keeping the subscription alive.
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        let id = self.endpoint.add_handler(handler);
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        id
    }

    /// Remove a handler. When the last one goes, the manager is asked to
    /// drop the broker subscription for this filter.
    pub fn remove_handler(&self, id: HandlerId) {
        if !self.endpoint.remove_handler(id) {
            return;
        }

        if self.subscribers.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(
                "Last handler removed, unsubscribing topic_filter={}",
                self.filter
            );

            if let Some(inputs) = self.manager.upgrade() {
                let _ = inputs.send(Input::UnsubscribeTopic {
                    filter: self.filter.clone(),
                    postman: Arc::clone(&self.postman),
                });
            }
        }
    }

    /// Install a delivery filter on the wrapped endpoint.
    pub fn set_delivery_filter<F>(&self, filter: F)
    where
        F: Fn(&TopicEvent) -> bool + Send + Sync + 'static,
    {
        self.endpoint.set_delivery_filter(filter);
    }

    /// Remove the delivery filter from the wrapped endpoint.
    pub fn drop_delivery_filter(&self) {
        self.endpoint.drop_delivery_filter();
    }

    /// Deliver an event to the wrapped endpoint.
    pub fn deliver(&self, event: &TopicEvent) {
        self.endpoint.deliver(event);
    }
}

/// Create a topic mailbox for `filter`, let `setup` install handlers on it,
/// and register the subscription with the manager.
///
/// When `setup` installs no handlers, nothing is registered and the mailbox
/// is returned inert.
pub fn subscribe<F>(
    handle: &TransportHandle,
    filter: impl Into<String>,
    setup: F,
    on_failure: FailureReaction,
) -> Result<Arc<TopicMailbox>>
where
    F: FnOnce(&TopicMailbox),
{
    let filter = filter.into();
    validate_subscribe_filter(&filter)?;

    let endpoint = Arc::new(LocalEndpoint::new());
    let postman: Arc<dyn Postman> = Arc::new(EndpointPostman {
        endpoint: Arc::clone(&endpoint),
        on_failure,
    });

    let mailbox = Arc::new(TopicMailbox::new(
        filter.clone(),
        handle.downgrade_inputs(),
        endpoint,
        Arc::clone(&postman),
    ));

    setup(&mailbox);

    if mailbox.subscribers_count() != 0 {
        handle.subscribe_topic(filter, postman)?;
    }

    Ok(mailbox)
}
