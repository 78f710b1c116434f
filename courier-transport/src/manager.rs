//! The transport manager: owns the broker connection, the subscription
//! registry, and the pending-subscription table.
//!
//! The manager is a single task driven by one FIFO input channel carrying
//! both application commands and adapter events, plus a periodic check of
//! pending subscriptions. All registry, trie, and pending-table mutations
//! happen on this task; inbound message fan-out runs on the adapter's thread
//! through the shared delivery trie (see [`EventSink`]).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use courier_core::codec::EncodePayload;
use courier_core::qos::QoS;
use courier_core::topic::validate_publish_topic;

use crate::adapter::{EventSink, MqttAdapter, SubscribeStatus};
use crate::error::{Result, TransportError};
use crate::options::{ConnectionParams, Will};
use crate::postman::Postman;
use crate::subscription::{DeliveryMap, PendingSubscription, SubscriptionRef};

/// QoS used for every subscribe and publish issued by the transport.
const QOS_TO_USE: QoS = QoS::AtMostOnce;

const PENDING_CHECK_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Inputs serialized onto the manager task.
pub(crate) enum Input {
    SubscribeTopic {
        filter: String,
        postman: Arc<dyn Postman>,
    },
    UnsubscribeTopic {
        filter: String,
        postman: Arc<dyn Postman>,
    },
    Connected,
    Disconnected,
    SubscriptionAck {
        mid: u16,
        granted_qos: Vec<u8>,
    },
    Shutdown,
}

/// Broadcast notifications about the state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connected,
}

/// Cloneable command endpoint of a [`TransportManager`].
#[derive(Clone)]
pub struct TransportHandle {
    inputs: mpsc::UnboundedSender<Input>,
    broker_events: broadcast::Sender<BrokerEvent>,
    adapter: Arc<dyn MqttAdapter>,
}

impl TransportHandle {
    /// Register `postman` for `filter`. The manager subscribes at the broker
    /// when this is the first postman for the filter.
    pub fn subscribe_topic(
        &self,
        filter: impl Into<String>,
        postman: Arc<dyn Postman>,
    ) -> Result<()> {
        self.inputs
            .send(Input::SubscribeTopic {
                filter: filter.into(),
                postman,
            })
            .map_err(|_| TransportError::ManagerStopped)
    }

    /// Drop `postman`'s interest in `filter`. The manager unsubscribes at the
    /// broker when this was the last postman for the filter.
    pub fn unsubscribe_topic(
        &self,
        filter: impl Into<String>,
        postman: Arc<dyn Postman>,
    ) -> Result<()> {
        self.inputs
            .send(Input::UnsubscribeTopic {
                filter: filter.into(),
                postman,
            })
            .map_err(|_| TransportError::ManagerStopped)
    }

    /// Publish a message with QoS 0, no retain. Best effort: failures are
    /// logged and dropped. The adapter is invoked on the caller's thread.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        let payload = payload.into();

        if let Err(e) = validate_publish_topic(topic) {
            warn!("Dropping publish to invalid topic, topic={}: {}", topic, e);
            return;
        }

        debug!(
            "Publishing message, topic={}, payloadlen={}",
            topic,
            payload.len()
        );

        if let Err(e) = self.adapter.publish(topic, &payload, QOS_TO_USE, false) {
            warn!(
                "Publish failed, topic={}, payloadlen={}: {}",
                topic,
                payload.len(),
                e
            );
        }
    }

    /// Encode a value with its payload codec and publish it (QoS 0, no
    /// retain). Best effort, like [`publish`](Self::publish).
    pub fn publish_value<M: EncodePayload>(&self, topic: &str, value: &M) {
        match value.encode_payload() {
            Ok(payload) => self.publish(topic, payload),
            Err(e) => warn!("Payload encoding failed, topic={}: {}", topic, e),
        }
    }

    /// Subscribe to broker connection lifecycle broadcasts.
    pub fn broker_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.broker_events.subscribe()
    }

    /// Ask the manager to stop. [`TransportManager::run`] then disconnects
    /// from the broker and stops the adapter's network loop.
    pub fn shutdown(&self) {
        let _ = self.inputs.send(Input::Shutdown);
    }

    pub(crate) fn downgrade_inputs(&self) -> mpsc::WeakUnboundedSender<Input> {
        self.inputs.downgrade()
    }
}

/// Event-driven coordinator between application subscriptions and one MQTT
/// broker connection.
///
/// Created together with its [`TransportHandle`]; configured with
/// [`set_will`](Self::set_will) and
/// [`set_subscription_timeout`](Self::set_subscription_timeout) before being
/// consumed by [`run`](Self::run).
pub struct TransportManager {
    params: ConnectionParams,
    adapter: Arc<dyn MqttAdapter>,
    inputs: mpsc::UnboundedReceiver<Input>,
    broker_events: broadcast::Sender<BrokerEvent>,
    state: ConnectionState,
    // Every registered topic filter, with and without wildcards.
    registered: HashMap<String, SubscriptionRef>,
    // Topic filters indexed for inbound message delivery. Shared with the
    // adapter's EventSink; written only on the manager task.
    delivery: Arc<RwLock<DeliveryMap>>,
    pending: HashMap<u16, PendingSubscription>,
    subscription_timeout: Duration,
}

impl TransportManager {
    /// Create a manager and its command endpoint. The adapter immediately
    /// receives the callback bundle it must drive.
    pub fn new(
        adapter: Arc<dyn MqttAdapter>,
        params: ConnectionParams,
    ) -> (TransportManager, TransportHandle) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (broker_events, _) = broadcast::channel(16);
        let delivery = Arc::new(RwLock::new(DeliveryMap::new()));

        adapter.register_callbacks(EventSink::new(inputs_tx.clone(), Arc::clone(&delivery)));

        let handle = TransportHandle {
            inputs: inputs_tx,
            broker_events: broker_events.clone(),
            adapter: Arc::clone(&adapter),
        };

        let manager = TransportManager {
            params,
            adapter,
            inputs: inputs_rx,
            broker_events,
            state: ConnectionState::Disconnected,
            registered: HashMap::new(),
            delivery,
            pending: HashMap::new(),
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
        };

        (manager, handle)
    }

    /// Set the will message for the client. Must be called before
    /// [`run`](Self::run).
    pub fn set_will(&self, will: &Will) -> Result<()> {
        self.adapter
            .will_set(&will.topic, &will.payload, will.qos, will.retain)?;
        Ok(())
    }

    /// Set the timeout for pending broker subscriptions (60 s by default).
    /// Must be called before [`run`](Self::run).
    pub fn set_subscription_timeout(&mut self, timeout: Duration) {
        self.subscription_timeout = timeout;
    }

    /// Run the manager until [`TransportHandle::shutdown`] is called or every
    /// handle is dropped.
    ///
    /// Fatal errors end the loop: adapter startup failures, hard subscribe
    /// errors, and subscription failures whose postman propagates
    /// ([`FailureReaction::PropagateError`](crate::postman::FailureReaction)).
    /// On the way out the broker connection is closed (when up) and the
    /// adapter's network loop is stopped; both teardown steps run even if one
    /// of them fails.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Starting transport manager, client_id={}, broker={}:{}",
            self.params.client_id, self.params.host, self.params.port
        );

        let startup = self.startup();
        let run_result = match startup {
            Ok(()) => self.event_loop().await,
            Err(e) => Err(e),
        };

        // Both teardown steps run even if one of them fails; the first error
        // wins.
        let disconnect_result = if self.state == ConnectionState::Connected {
            self.adapter.disconnect()
        } else {
            Ok(())
        };
        let stop_result = self.adapter.loop_stop(true);

        run_result
            .and(disconnect_result.map_err(TransportError::from))
            .and(stop_result.map_err(TransportError::from))
    }

    fn startup(&mut self) -> Result<()> {
        self.adapter.loop_start()?;
        self.enter_disconnected();
        self.adapter.connect_async(
            &self.params.host,
            self.params.port,
            self.params.keepalive,
        )?;
        Ok(())
    }

    async fn event_loop(&mut self) -> Result<()> {
        let mut pending_check = time::interval(PENDING_CHECK_PERIOD);
        pending_check.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    None | Some(Input::Shutdown) => return Ok(()),
                    Some(input) => self.handle_input(input)?,
                },
                _ = pending_check.tick() => self.on_pending_check()?,
            }
        }
    }

    fn handle_input(&mut self, input: Input) -> Result<()> {
        match input {
            Input::SubscribeTopic { filter, postman } => {
                self.on_subscribe_topic(filter, postman)
            }
            Input::UnsubscribeTopic { filter, postman } => {
                self.on_unsubscribe_topic(&filter, &postman);
                Ok(())
            }
            Input::Connected => self.on_connected(),
            Input::Disconnected => {
                self.on_disconnected();
                Ok(())
            }
            Input::SubscriptionAck { mid, granted_qos } => {
                self.on_subscription_ack(mid, &granted_qos)
            }
            // Handled by the event loop before dispatching here.
            Input::Shutdown => Ok(()),
        }
    }

    fn on_connected(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connected;
        let _ = self.broker_events.send(BrokerEvent::Connected);

        // All registered subscriptions must be restored.
        self.restore_subscriptions()
    }

    fn on_disconnected(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        // Leaving the connected state: every subscription is lost and nothing
        // is pending anymore.
        self.drop_subscription_statuses();
        self.pending.clear();

        self.enter_disconnected();
    }

    fn enter_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        let _ = self.broker_events.send(BrokerEvent::Disconnected);
    }

    fn on_subscribe_topic(&mut self, filter: String, postman: Arc<dyn Postman>) -> Result<()> {
        debug!("Adding topic postman, topic_filter={}", filter);

        let (entry, created) = match self.registered.entry(filter.clone()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => (vacant.insert(SubscriptionRef::new()).clone(), true),
        };

        entry.lock().add_postman(&filter, postman)?;

        if created {
            self.delivery.write().unwrap().insert(&filter, entry)?;
            if self.state == ConnectionState::Connected {
                self.issue_broker_subscribe(&filter)?;
            }
        }

        Ok(())
    }

    fn on_unsubscribe_topic(&mut self, filter: &str, postman: &Arc<dyn Postman>) {
        debug!("Removing topic postman, topic_filter={}", filter);

        let Some(entry) = self.registered.get(filter).cloned() else {
            warn!(
                "Topic filter for unsubscription is not registered, topic_filter={}",
                filter
            );
            return;
        };

        entry.lock().remove_postman(postman);
        if entry.lock().has_postmen() {
            return;
        }

        self.delivery.write().unwrap().remove(filter, &entry);
        self.registered.remove(filter);

        info!("Topic unsubscription, topic_filter={}", filter);

        // Nothing reasonable left to do on failure; the local state is
        // already consistent.
        if let Err(e) = self.adapter.unsubscribe(filter) {
            warn!("Broker unsubscribe failed, topic_filter={}: {}", filter, e);
        }
    }

    fn on_subscription_ack(&mut self, mid: u16, granted_qos: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Connected {
            debug!("SUBACK outside of connected state ignored, mid={}", mid);
            return Ok(());
        }

        let Some(pending) = self.pending.remove(&mid) else {
            warn!("SUBACK with unknown mid, mid={}", mid);
            return Ok(());
        };

        let Some(entry) = self.registered.get(&pending.filter).cloned() else {
            warn!(
                "SUBACK for unregistered topic filter, mid={}, topic_filter={}",
                mid, pending.filter
            );
            return Ok(());
        };

        let Some(&granted) = granted_qos.first() else {
            warn!("SUBACK with empty granted QoS list, mid={}", mid);
            return Ok(());
        };

        debug!(
            "SUBACK, mid={}, topic_filter={}, granted_qos={}",
            mid, pending.filter, granted
        );

        self.process_subscription_result(&pending.filter, &entry, granted)
    }

    fn process_subscription_result(
        &self,
        filter: &str,
        entry: &SubscriptionRef,
        granted_qos: u8,
    ) -> Result<()> {
        // The broker may grant a lower level or refuse outright (0x80, which
        // maps to QoS::Invalid); only the requested level counts as success.
        if QoS::from(granted_qos) == QOS_TO_USE {
            entry.lock().subscription_created(filter);
        } else {
            error!(
                "Unexpected granted QoS, topic_filter={}, granted_qos={}",
                filter, granted_qos
            );
            entry
                .lock()
                .subscription_failed(filter, &format!("unexpected qos: {}", granted_qos))?;
        }

        Ok(())
    }

    fn on_pending_check(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, pending)| now - pending.initiated_at > self.subscription_timeout)
            .map(|(mid, _)| *mid)
            .collect();

        for mid in expired {
            let Some(pending) = self.pending.remove(&mid) else {
                continue;
            };

            error!("Subscription timed out, topic_filter={}", pending.filter);

            match self.registered.get(&pending.filter).cloned() {
                Some(entry) => entry
                    .lock()
                    .subscription_failed(&pending.filter, "subscription timed out")?,
                None => warn!(
                    "Timed-out subscription is no longer registered, topic_filter={}",
                    pending.filter
                ),
            }
        }

        Ok(())
    }

    /// Issue a broker subscribe for `filter` and record it as pending.
    ///
    /// `NoConnection`/`ConnectionLost` outcomes are accepted and recorded
    /// anyway; the pending check reports them as failed when the connection
    /// does not come back within the subscription timeout.
    fn issue_broker_subscribe(&mut self, filter: &str) -> Result<()> {
        info!("Topic subscription, topic_filter={}", filter);

        let request = self.adapter.subscribe(filter, QOS_TO_USE)?;
        if request.status != SubscribeStatus::Sent {
            debug!(
                "Subscribe not sent ({:?}), topic_filter={}",
                request.status, filter
            );
        }

        self.pending.insert(
            request.mid,
            PendingSubscription {
                filter: filter.to_string(),
                initiated_at: Instant::now(),
            },
        );

        Ok(())
    }

    fn drop_subscription_statuses(&mut self) {
        for (filter, entry) in &self.registered {
            entry.lock().subscription_lost(filter);
        }
    }

    fn restore_subscriptions(&mut self) -> Result<()> {
        let filters: Vec<String> = self.registered.keys().cloned().collect();
        for filter in filters {
            self.issue_broker_subscribe(&filter)?;
        }
        Ok(())
    }
}
