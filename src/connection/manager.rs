//! The single shared broker session
//!
//! [`ConnectionManager`] owns the one physical session of a service. It
//! opens it lazily, confirms it on broker acknowledgment, reconnects with
//! backoff after unexpected drops or a failed first attempt, and tells the
//! dispatcher about every acknowledged session so it can restore its topics.
//! Sessions are numbered; events from a superseded session are ignored.

use super::state::{ConnectionEvent, ConnectionState, ReconnectionDecision, StateMachine};
use crate::config::{BrokerSection, ReconnectSection};
use crate::listener::{ListenerId, ListenerSet};
use crate::observability::metrics;
use crate::transport::{Broker, BrokerError, BrokerEvent};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Receives inbound messages and restores subscriptions on new sessions
pub trait MessageDispatcher: Send + Sync {
    fn on_broker_message(&self, topic: &str, payload: &[u8]);

    /// Session `session` was acknowledged and starts with no subscriptions
    fn on_session_established(&self, session: u64);
}

pub type ConnectionCallback = dyn Fn(&ConnectionState) + Send + Sync;

type PendingConnect = Shared<BoxFuture<'static, bool>>;
type AckSender = oneshot::Sender<Result<(), String>>;

pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    broker_url: String,
    client_id_prefix: String,
    connect_timeout: Duration,
    reconnect: ReconnectSection,
    state_tx: watch::Sender<ConnectionState>,
    /// Serializes state changes with the session and shutdown counters
    transition_lock: Mutex<()>,
    client_id: Mutex<Option<String>>,
    retry_count: AtomicU32,
    /// Number of the current session; bumped to retire one
    generation: AtomicU64,
    reconnecting: AtomicBool,
    /// Bumped by every `shutdown`
    shutdown_epoch: watch::Sender<u64>,
    pending: Mutex<Option<PendingConnect>>,
    listeners: ListenerSet<ConnectionCallback>,
    dispatcher: RwLock<Option<Weak<dyn MessageDispatcher>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: &BrokerSection,
        reconnect: ReconnectSection,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_epoch, _) = watch::channel(0);

        Arc::new(Self {
            broker,
            broker_url: config.url.clone(),
            client_id_prefix: config.client_id_prefix.clone(),
            connect_timeout: config.connect_timeout(),
            reconnect,
            state_tx,
            transition_lock: Mutex::new(()),
            client_id: Mutex::new(None),
            retry_count: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            shutdown_epoch,
            pending: Mutex::new(None),
            listeners: ListenerSet::default(),
            dispatcher: RwLock::new(None),
        })
    }

    /// Route inbound messages to `dispatcher`. Held weakly; the dispatcher
    /// usually owns this manager.
    pub fn set_dispatcher(&self, dispatcher: Weak<dyn MessageDispatcher>) {
        *self
            .dispatcher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(dispatcher);
    }

    pub fn is_connected(&self) -> bool {
        StateMachine::can_publish(self.state())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn client_id(&self) -> Option<String> {
        lock(&self.client_id).clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    /// Number of the current broker session
    pub fn session(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Call `callback` on every future state transition until the handle is
    /// disposed or dropped
    pub fn add_connection_listener<F>(self: &Arc<Self>, callback: F) -> ConnectionListenerHandle
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let id = self.listeners.insert(Arc::new(callback));
        debug!(listener = %id, "Connection listener added");
        ConnectionListenerHandle {
            id,
            manager: Arc::downgrade(self),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn connection_listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Open the shared session, or join the attempt already in flight.
    ///
    /// `true` once the broker acknowledged the session, `false` on refusal,
    /// timeout or shutdown. `client_id` is only used when a new session is
    /// opened; otherwise the previous identifier is reused or one is
    /// generated from the configured prefix.
    pub async fn connect(self: &Arc<Self>, client_id: Option<String>) -> bool {
        if self.is_connected() {
            return true;
        }

        if self.reconnecting.load(Ordering::SeqCst) {
            debug!("Reconnection in progress, waiting for its outcome");
            return self.wait_for_connected(self.connect_timeout).await;
        }

        let attempt = {
            let mut pending = lock(&self.pending);
            match pending.as_ref() {
                Some(attempt) if attempt.peek().is_none() => attempt.clone(),
                _ => {
                    let manager = Arc::clone(self);
                    // spawned so that dropping every caller cannot abandon it halfway
                    let task = tokio::spawn(async move { manager.establish(client_id).await });
                    let attempt = task.map(|outcome| outcome.unwrap_or(false)).boxed().shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Broker-level subscribe on the current session
    pub async fn subscribe_topic(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NoSession);
        }
        self.broker.subscribe(topic).await?;
        metrics().broker_subscribed();
        Ok(())
    }

    /// Broker-level unsubscribe. Without a session there is nothing to undo;
    /// the topic will simply not be restored.
    pub async fn unsubscribe_topic(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_connected() {
            debug!(topic = %topic, "Not connected, skipping broker unsubscribe");
            return Ok(());
        }
        self.broker.unsubscribe(topic).await?;
        metrics().broker_unsubscribed();
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NoSession);
        }
        self.broker.publish(topic, payload).await
    }

    /// Close the session and stop any reconnection. A later `connect` opens
    /// a fresh session.
    pub async fn shutdown(&self) {
        info!(broker = %self.broker_url, "Closing broker connection");

        self.transition_if(ConnectionEvent::Closed, || {
            self.shutdown_epoch.send_modify(|epoch| *epoch += 1);
            self.generation.fetch_add(1, Ordering::SeqCst);
            true
        });
        lock(&self.pending).take();
        self.retry_count.store(0, Ordering::SeqCst);

        if let Err(e) = self.broker.close().await {
            warn!("Broker close failed: {}", e);
        }
    }

    async fn establish(self: Arc<Self>, requested_id: Option<String>) -> bool {
        let client_id = self.resolve_client_id(requested_id);
        let epoch = *self.shutdown_epoch.borrow();
        let span = crate::connection_span!(client_id = %client_id, broker = %self.broker_url);

        async move {
            self.transition(ConnectionEvent::ConnectRequested);
            metrics().connection_attempt();

            match self.open_session(&client_id).await {
                Ok(generation) => self.on_established(generation),
                Err(reason) => {
                    warn!(reason = %reason, "Broker connection attempt failed");
                    metrics().connection_failed();
                    let current = self.transition_if(ConnectionEvent::AttemptFailed, || {
                        self.epoch_is(epoch)
                    });
                    // callers see `false`; retries continue in the background
                    if current {
                        self.spawn_reconnect_loop(epoch);
                    }
                    false
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Start a session and wait for its acknowledgment. Returns the session
    /// number on success.
    async fn open_session(self: &Arc<Self>, client_id: &str) -> Result<u64, String> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        self.broker
            .open(client_id, events_tx)
            .await
            .map_err(|e| e.to_string())?;

        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::spawn(Self::pump_events(
            Arc::downgrade(self),
            generation,
            events_rx,
            ack_tx,
        ));

        match tokio::time::timeout(self.connect_timeout, ack_rx).await {
            Ok(Ok(outcome)) => outcome.map(|()| generation),
            Ok(Err(_)) => Err("event stream closed before acknowledgment".to_string()),
            Err(_) => {
                // retire the session so a late acknowledgment is ignored
                let _ = self.generation.compare_exchange(
                    generation,
                    generation + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                if let Err(e) = self.broker.close().await {
                    debug!("Closing unacknowledged session failed: {}", e);
                }
                Err(format!(
                    "no acknowledgment within {}ms",
                    self.connect_timeout.as_millis()
                ))
            }
        }
    }

    /// Drains one session's events until it ends or is superseded
    async fn pump_events(
        manager: Weak<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
        ack: AckSender,
    ) {
        let mut ack = Some(ack);
        let mut lost_reason = None;

        while let Some(event) = events.recv().await {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if manager.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "Ignoring event from superseded session");
                return;
            }

            match event {
                BrokerEvent::Connected => match ack.take() {
                    Some(ack) => {
                        let _ = ack.send(Ok(()));
                    }
                    None => debug!("Duplicate acknowledgment ignored"),
                },
                BrokerEvent::Message { topic, payload } => manager.dispatch(&topic, &payload),
                BrokerEvent::Disconnected(reason) => {
                    lost_reason = Some(reason);
                    break;
                }
            }
        }

        let reason = lost_reason.unwrap_or_else(|| "event stream closed".to_string());
        match ack.take() {
            Some(ack) => {
                let _ = ack.send(Err(reason));
            }
            None => {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_connection_lost(generation, reason);
                }
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.on_broker_message(topic, payload),
            None => {
                debug!(topic = %topic, "No dispatcher registered, dropping message");
                metrics().message_unrouted();
            }
        }
    }

    fn dispatcher(&self) -> Option<Arc<dyn MessageDispatcher>> {
        self.dispatcher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn handle_connection_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let mut epoch = 0;
        let current = self.transition_if(ConnectionEvent::ConnectionLost, || {
            epoch = *self.shutdown_epoch.borrow();
            self.generation
                .compare_exchange(
                    generation,
                    generation + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        });
        if !current {
            debug!(generation, "Loss of superseded session ignored");
            return;
        }

        warn!(reason = %reason, "Broker connection lost");
        metrics().connection_lost();
        self.spawn_reconnect_loop(epoch);
    }

    fn spawn_reconnect_loop(self: &Arc<Self>, epoch: u64) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnection already in progress");
            return;
        }

        let manager = Arc::clone(self);
        let span = crate::connection_span!(broker = %self.broker_url, reconnect = true);
        tokio::spawn(
            async move {
                manager.reconnect_loop(epoch).await;
                manager.reconnecting.store(false, Ordering::SeqCst);

                // a loss reported while the flag was still set found no loop to start
                if manager.state() == ConnectionState::Reconnecting && manager.epoch_is(epoch) {
                    manager.spawn_reconnect_loop(epoch);
                }
            }
            .instrument(span),
        );
    }

    async fn reconnect_loop(self: &Arc<Self>, epoch: u64) {
        let mut shutdown_rx = self.shutdown_epoch.subscribe();

        loop {
            let decision = StateMachine::should_attempt_reconnection(
                self.retry_count.load(Ordering::SeqCst),
                &self.reconnect,
                !self.epoch_is(epoch),
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    self.retry_count.store(attempt, Ordering::SeqCst);
                    metrics().reconnect_attempt();
                    info!(attempt, delay_ms, "Scheduling reconnection attempt");

                    if !Self::interruptible_sleep(&mut shutdown_rx, epoch, delay_ms).await {
                        info!("Shutdown requested during reconnection delay, stopping");
                        return;
                    }

                    let client_id = self.resolve_client_id(None);
                    self.transition_if(ConnectionEvent::ConnectRequested, || {
                        self.epoch_is(epoch)
                    });
                    metrics().connection_attempt();

                    match self.open_session(&client_id).await {
                        Ok(generation) => {
                            if self.on_established(generation) {
                                return;
                            }
                            debug!(attempt, "Session superseded before confirmation");
                        }
                        Err(reason) => {
                            warn!(attempt, reason = %reason, "Reconnection attempt failed");
                            metrics().connection_failed();
                            self.transition_if(ConnectionEvent::AttemptFailed, || {
                                self.epoch_is(epoch)
                            });
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, stopping reconnection");
                    return;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!(
                        attempts = self.retry_count.load(Ordering::SeqCst),
                        "Reconnection attempts exhausted"
                    );
                    self.transition_if(ConnectionEvent::RetriesExhausted, || {
                        self.epoch_is(epoch)
                    });
                    return;
                }
            }
        }
    }

    /// `false` when shutdown interrupted the delay
    async fn interruptible_sleep(
        shutdown_rx: &mut watch::Receiver<u64>,
        epoch: u64,
        delay_ms: u64,
    ) -> bool {
        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() != epoch {
                        return false;
                    }
                }
            }
        }
    }

    /// Confirm session `generation` and hand it to the dispatcher. `false` if
    /// the session was superseded in the meantime.
    fn on_established(&self, generation: u64) -> bool {
        let current = self.transition_if(ConnectionEvent::AckReceived, || {
            self.generation.load(Ordering::SeqCst) == generation
        });
        if !current {
            return false;
        }

        self.retry_count.store(0, Ordering::SeqCst);
        metrics().connection_established();
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.on_session_established(generation);
        }
        true
    }

    async fn wait_for_connected(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return true,
                    ConnectionState::Disconnected => return false,
                    ConnectionState::Failed if !self.reconnecting.load(Ordering::SeqCst) => {
                        return false
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        outcome.unwrap_or(false)
    }

    fn resolve_client_id(&self, requested: Option<String>) -> String {
        let mut current = lock(&self.client_id);
        let client_id = requested
            .or_else(|| current.clone())
            .unwrap_or_else(|| format!("{}-{}", self.client_id_prefix, Uuid::new_v4().simple()));
        *current = Some(client_id.clone());
        client_id
    }

    fn epoch_is(&self, epoch: u64) -> bool {
        *self.shutdown_epoch.borrow() == epoch
    }

    fn transition(&self, event: ConnectionEvent) {
        self.transition_if(event, || true);
    }

    /// Apply `event` if `guard` holds; `guard` runs under the transition lock.
    /// Listeners are notified after the lock is released.
    fn transition_if(&self, event: ConnectionEvent, guard: impl FnOnce() -> bool) -> bool {
        let change = {
            let _lock = lock(&self.transition_lock);
            if !guard() {
                return false;
            }
            let current = self.state();
            let next = StateMachine::transition(current, event);
            if next == current {
                None
            } else {
                self.state_tx.send_replace(next);
                Some((current, next))
            }
        };

        if let Some((from, to)) = change {
            StateMachine::log_state_transition(from, to);
            metrics().set_connection_state(to.as_str());
            self.notify_listeners(&to);
        }
        true
    }

    fn notify_listeners(&self, state: &ConnectionState) {
        for callback in self.listeners.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
                error!(state = %state, "Connection listener panicked");
                metrics().listener_panicked();
            }
        }
    }
}

/// Keeps a connection listener registered
#[must_use = "dropping the handle removes the listener"]
pub struct ConnectionListenerHandle {
    id: ListenerId,
    manager: Weak<ConnectionManager>,
    disposed: AtomicBool,
}

impl ConnectionListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Idempotent; never closes the connection.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.listeners.remove(self.id);
            debug!(listener = %self.id, "Connection listener removed");
        }
    }
}

impl Drop for ConnectionListenerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
