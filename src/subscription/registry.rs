//! Topic to listener bookkeeping with reference counting
//!
//! The first listener on a topic triggers one broker subscribe and removing
//! the last one triggers one broker unsubscribe. Those decisions are taken
//! under the registry lock and queued, in order, for a single worker task
//! that talks to the [`ConnectionManager`]. Near-simultaneous attaches to
//! the same topic therefore issue one subscribe.
//!
//! Restoring topics on a new broker session goes through the same queue, so
//! a restore can never overtake an unsubscribe for a topic that lost its
//! last listener. The worker tracks what the current session is subscribed
//! to and never subscribes a topic twice in one session.

use crate::codec::PayloadDecoder;
use crate::config::DeliverySection;
use crate::connection::{ConnectionManager, MessageDispatcher};
use crate::listener::ListenerId;
use crate::observability::metrics;
use crate::protocol::{validate_topic, MessageValidator, SchemaKind, TopicError, ValidatorError};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub type MessageCallback = dyn Fn(&str) + Send + Sync;

/// Listeners of one topic; the topic's reference count is their number
#[derive(Default)]
struct TopicEntry {
    listeners: BTreeMap<ListenerId, Arc<MessageCallback>>,
}

#[derive(Debug)]
enum TopicCommand {
    Subscribe(String),
    Unsubscribe(String),
    /// Subscribe every active topic on the given session
    Restore(u64),
    Flush(oneshot::Sender<()>),
}

pub struct SubscriptionRegistry {
    topics: Mutex<HashMap<String, TopicEntry>>,
    commands: mpsc::UnboundedSender<TopicCommand>,
    validator: Option<MessageValidator>,
}

impl SubscriptionRegistry {
    /// Create the registry, register it as `connection`'s dispatcher and
    /// start its command worker. Must be called inside a tokio runtime.
    pub fn new(
        connection: Arc<ConnectionManager>,
        delivery: &DeliverySection,
    ) -> Result<Arc<Self>, ValidatorError> {
        let validator = if delivery.validate_inbound {
            Some(MessageValidator::new()?)
        } else {
            None
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            commands,
            validator,
        });

        let dispatcher: Weak<dyn MessageDispatcher> = Arc::downgrade(&registry) as _;
        connection.set_dispatcher(dispatcher);
        let worker = CommandWorker {
            connection,
            registry: Arc::downgrade(&registry),
            session: None,
            subscribed: HashSet::new(),
        };
        tokio::spawn(worker.run(command_rx));

        Ok(registry)
    }

    /// Register `callback` for messages on `topic` (exact match).
    ///
    /// The listener stays registered until the returned handle is disposed
    /// or dropped.
    pub fn add_message_listener<F>(
        self: &Arc<Self>,
        topic: &str,
        callback: F,
    ) -> Result<MessageListenerHandle, TopicError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        validate_topic(topic)?;
        let id = ListenerId::next();

        {
            let mut topics = self.lock();
            let entry = topics.entry(topic.to_string()).or_default();
            entry.listeners.insert(id, Arc::new(callback));
            if entry.listeners.len() == 1 {
                info!(topic = %topic, "First listener on topic, subscribing");
                self.enqueue(TopicCommand::Subscribe(topic.to_string()));
            }
        }

        debug!(topic = %topic, listener = %id, "Message listener added");
        Ok(MessageListenerHandle {
            topic: topic.to_string(),
            id,
            registry: Arc::downgrade(self),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn ref_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Topics with at least one listener, sorted
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Listeners across all topics
    pub fn listener_count(&self) -> usize {
        self.lock().values().map(|entry| entry.listeners.len()).sum()
    }

    /// Resolves once every broker subscribe/unsubscribe queued so far has
    /// been issued
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(TopicCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Decode `payload` once and hand it to every listener on `topic`
    pub fn on_broker_message(&self, topic: &str, payload: &[u8]) {
        metrics().message_received();

        let listeners: Vec<Arc<MessageCallback>> = match self.lock().get(topic) {
            Some(entry) => entry.listeners.values().cloned().collect(),
            None => {
                debug!(topic = %topic, "No listeners for topic, dropping message");
                metrics().message_unrouted();
                return;
            }
        };

        let span = crate::delivery_span!(topic = %topic, listeners = listeners.len());
        let _enter = span.enter();

        let decoded = PayloadDecoder::decode_bytes(payload);
        if !self.accepts(topic, &decoded) {
            metrics().message_rejected();
            return;
        }

        let mut delivered = 0u64;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&decoded))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        topic = %topic,
                        "Message listener panicked: {}",
                        panic_message(panic.as_ref())
                    );
                    metrics().listener_panicked();
                }
            }
        }
        metrics().messages_delivered(delivered);
    }

    fn accepts(&self, topic: &str, decoded: &str) -> bool {
        let Some(validator) = &self.validator else {
            return true;
        };

        let value: Value = match serde_json::from_str(decoded) {
            Ok(value) => value,
            Err(_) => {
                warn!(topic = %topic, "Dropping non-JSON payload");
                return false;
            }
        };

        let validation = validator.validate_kind(SchemaKind::Inbound, &value);
        if !validation.is_success() {
            warn!(
                topic = %topic,
                errors = ?validation.errors(),
                "Dropping invalid inbound envelope"
            );
            return false;
        }
        true
    }

    fn remove_listener(&self, topic: &str, id: ListenerId) -> bool {
        let mut topics = self.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return false;
        };
        if entry.listeners.remove(&id).is_none() {
            return false;
        }

        if entry.listeners.is_empty() {
            topics.remove(topic);
            info!(topic = %topic, "Last listener removed, unsubscribing");
            self.enqueue(TopicCommand::Unsubscribe(topic.to_string()));
        }
        true
    }

    fn enqueue(&self, command: TopicCommand) {
        if let Err(e) = self.commands.send(command) {
            warn!("Subscription worker stopped, dropping {:?}", e.0);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicEntry>> {
        // listeners never run under this lock
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MessageDispatcher for SubscriptionRegistry {
    fn on_broker_message(&self, topic: &str, payload: &[u8]) {
        SubscriptionRegistry::on_broker_message(self, topic, payload);
    }

    fn on_session_established(&self, session: u64) {
        self.enqueue(TopicCommand::Restore(session));
    }
}

/// Issues queued broker commands one at a time
struct CommandWorker {
    connection: Arc<ConnectionManager>,
    registry: Weak<SubscriptionRegistry>,
    /// Session that `subscribed` describes
    session: Option<u64>,
    subscribed: HashSet<String>,
}

impl CommandWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TopicCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                TopicCommand::Subscribe(topic) => self.subscribe(&topic).await,
                TopicCommand::Unsubscribe(topic) => self.unsubscribe(&topic).await,
                TopicCommand::Restore(session) => self.restore(session).await,
                TopicCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Subscription worker stopped");
    }

    async fn subscribe(&mut self, topic: &str) {
        if !self.connection.is_connected() {
            // every new session queues a restore; running it now covers this
            // topic and leaves the queued one with nothing to do
            if self.connection.connect(None).await {
                self.restore(self.connection.session()).await;
            } else {
                warn!(topic = %topic, "Broker not connected, subscribe deferred");
            }
            return;
        }
        if !self.is_active(topic) {
            return;
        }
        self.enter_session(self.connection.session());
        self.subscribe_on_session(topic).await;
    }

    async fn unsubscribe(&mut self, topic: &str) {
        if !self.subscribed.remove(topic) {
            debug!(topic = %topic, "Topic not subscribed on this session");
            return;
        }
        if let Err(e) = self.connection.unsubscribe_topic(topic).await {
            warn!(topic = %topic, "Broker unsubscribe failed: {}", e);
        }
    }

    async fn restore(&mut self, session: u64) {
        if session != self.connection.session() {
            debug!(session, "Skipping restore for superseded session");
            return;
        }
        self.enter_session(session);

        let topics = match self.registry.upgrade() {
            Some(registry) => registry.active_topics(),
            None => return,
        };
        if topics.is_empty() {
            return;
        }

        info!(count = topics.len(), session, "Restoring topic subscriptions");
        for topic in topics {
            self.subscribe_on_session(&topic).await;
        }
    }

    async fn subscribe_on_session(&mut self, topic: &str) {
        if self.subscribed.contains(topic) {
            return;
        }
        match self.connection.subscribe_topic(topic).await {
            Ok(()) => {
                self.subscribed.insert(topic.to_string());
            }
            Err(e) => {
                // retried by the restore of the next session
                warn!(topic = %topic, "Broker subscribe failed: {}", e);
                metrics().subscribe_failed();
            }
        }
    }

    fn enter_session(&mut self, session: u64) {
        if self.session != Some(session) {
            self.session = Some(session);
            self.subscribed.clear();
        }
    }

    fn is_active(&self, topic: &str) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.ref_count(topic) > 0)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Keeps a message listener registered
#[must_use = "dropping the handle removes the listener"]
pub struct MessageListenerHandle {
    topic: String,
    id: ListenerId,
    registry: Weak<SubscriptionRegistry>,
    disposed: AtomicBool,
}

impl MessageListenerHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener, unsubscribing the topic when it was the last
    /// one. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove_listener(&self.topic, self.id) {
                debug!(topic = %self.topic, listener = %self.id, "Message listener removed");
            }
        }
    }
}

impl Drop for MessageListenerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
