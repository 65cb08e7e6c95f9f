//! Connection manager: sole owner of the transport session
//!
//! `ConnectionManager::connect` performs the initial connect and spawns a
//! supervisor task. The supervisor owns the live [`Session`], the link state and
//! the subscription set; everything else talks to it through a cloneable
//! [`ConnectionHandle`] backed by a command channel.
//!
//! While the link is down, publish and subscribe requests are parked inside the
//! supervisor and the caller stays suspended. On every up/down edge the
//! registered [`LinkObserver`]s run first, then the watch channel is updated,
//! and only then are parked callers resumed.

use super::health_monitor::{ConnectionEvent, ConnectionState, HealthMonitor, ReconnectConfig};
use super::reconnect::{ReconnectionHandler, SubscriptionSet};
use super::{Connector, InboundMessage, Qos, Session, SessionEvent, Ticket, TransportError};
use crate::mqtt_span;
use crate::observability::metrics::metrics;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};

const COMMAND_CAPACITY: usize = 32;

/// Process-wide view of transport connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
        }
    }
}

/// Initial connection failure
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Initial connection to broker failed")]
    Unreachable(#[source] TransportError),
}

/// Error seen by [`ConnectionHandle`] callers
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Connection manager closed")]
    Closed,
}

/// Link-state-changed callback, invoked synchronously on every edge
pub trait LinkObserver: Send {
    fn on_link_change(&mut self, state: LinkState);
}

impl<F> LinkObserver for F
where
    F: FnMut(LinkState) + Send,
{
    fn on_link_change(&mut self, state: LinkState) {
        self(state)
    }
}

/// Received-message callback
pub trait MessageSink: Send {
    fn on_message(&mut self, message: &InboundMessage);
}

impl<F> MessageSink for F
where
    F: FnMut(&InboundMessage) + Send,
{
    fn on_message(&mut self, message: &InboundMessage) {
        self(message)
    }
}

fn log_message(message: &InboundMessage) {
    info!(
        topic = %message.topic,
        payload = %String::from_utf8_lossy(&message.payload),
        retain = message.retain,
        "Message received"
    );
}

struct PendingPublish {
    topic: String,
    payload: Bytes,
    qos: Qos,
    attempts: u32,
    reply: oneshot::Sender<()>,
}

enum Command {
    Publish(PendingPublish),
    Subscribe {
        topic: String,
        qos: Qos,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for the supervisor; consumed by [`ConnectionManager::connect`]
pub struct ConnectionManager<C: Connector> {
    connector: C,
    reconnect: ReconnectConfig,
    handler: ReconnectionHandler,
    observers: Vec<Box<dyn LinkObserver>>,
    sink: Box<dyn MessageSink>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, reconnect: ReconnectConfig, subscriptions: SubscriptionSet) -> Self {
        Self {
            connector,
            reconnect,
            handler: ReconnectionHandler::new(subscriptions),
            observers: Vec::new(),
            sink: Box::new(log_message),
        }
    }

    /// Register a link-state observer
    pub fn observe(mut self, observer: impl LinkObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Replace the received-message callback (defaults to logging)
    pub fn on_message(mut self, sink: impl MessageSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Connect once, then wait for the link to come up
    ///
    /// Fails fast if the broker cannot be reached. Once the first session exists
    /// this only returns after the link is up with subscriptions applied.
    pub async fn connect(self) -> Result<ConnectionHandle, ConnectionError> {
        let handle = self.start().await?;
        handle
            .wait_for(LinkState::Up)
            .await
            .map_err(|_| ConnectionError::Unreachable(TransportError::Closed))?;
        Ok(handle)
    }

    /// Connect once and hand the session to the supervisor
    ///
    /// Returns as soon as the supervisor owns the first session, before
    /// subscriptions are applied. The link may still be down.
    pub async fn start(mut self) -> Result<ConnectionHandle, ConnectionError> {
        metrics().record_connection_attempt();
        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Initial connection to broker failed");
                return Err(ConnectionError::Unreachable(e));
            }
        };
        metrics().record_connection_established();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Down);

        let supervisor = Supervisor {
            connector: self.connector,
            reconnect: self.reconnect,
            handler: self.handler,
            observers: self.observers,
            sink: self.sink,
            commands: command_rx,
            state_tx,
            state: ConnectionState::Connecting,
            parked: VecDeque::new(),
            in_flight: HashMap::new(),
            subscribe_waiters: Vec::new(),
            close_reply: None,
            attempt: 0,
        };
        tokio::spawn(
            supervisor
                .run(session)
                .instrument(mqtt_span!(component = "connection_manager")),
        );

        Ok(ConnectionHandle {
            commands: command_tx,
            state: state_rx,
        })
    }
}

/// Cloneable access to the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LinkState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Publish(publish) => write!(f, "Publish({})", publish.topic),
            Command::Subscribe { topic, .. } => write!(f, "Subscribe({topic})"),
            Command::Close { .. } => write!(f, "Close"),
        }
    }
}

impl ConnectionHandle {
    /// Publish and wait for delivery
    ///
    /// Suspends for as long as the link is down; the only error is a closed
    /// manager.
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<(), LinkError> {
        let (reply, done) = oneshot::channel();
        let publish = PendingPublish {
            topic: topic.to_string(),
            payload,
            qos,
            attempts: 0,
            reply,
        };
        self.commands
            .send(Command::Publish(publish))
            .await
            .map_err(|_| LinkError::Closed)?;
        done.await.map_err(|_| LinkError::Closed)
    }

    /// Add a subscription and wait until the broker has it
    pub async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                topic: topic.to_string(),
                qos,
                reply,
            })
            .await
            .map_err(|_| LinkError::Closed)?;
        done.await.map_err(|_| LinkError::Closed)
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Receiver that observes every link state change
    pub fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Suspend until the link reaches `state`
    pub async fn wait_for(&self, state: LinkState) -> Result<(), LinkError> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::Closed)
    }

    /// Release the session and stop the supervisor
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

enum Exit {
    Dropped(String),
    Shutdown,
}

/// Why a fresh session did not reach the up state
enum Setback {
    Failed(ConnectionEvent),
    Shutdown,
}

struct Supervisor<C: Connector> {
    connector: C,
    reconnect: ReconnectConfig,
    handler: ReconnectionHandler,
    observers: Vec<Box<dyn LinkObserver>>,
    sink: Box<dyn MessageSink>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<LinkState>,
    state: ConnectionState,
    parked: VecDeque<PendingPublish>,
    in_flight: HashMap<Ticket, PendingPublish>,
    subscribe_waiters: Vec<oneshot::Sender<()>>,
    close_reply: Option<oneshot::Sender<()>>,
    /// Reconnect attempts since the link was last up
    attempt: u32,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self, first: C::Session) {
        let mut next = Some(first);
        loop {
            let mut session = match next.take() {
                Some(session) => session,
                None => match self.reconnect_loop().await {
                    Some(session) => session,
                    None => break,
                },
            };

            match self.establish(&mut session).await {
                Ok(()) => {}
                Err(Setback::Failed(event)) => {
                    self.apply(event);
                    self.requeue_in_flight();
                    session.close().await;
                    continue;
                }
                Err(Setback::Shutdown) => {
                    session.close().await;
                    break;
                }
            }

            match self.serve(&mut session).await {
                Exit::Shutdown => {
                    session.close().await;
                    break;
                }
                Exit::Dropped(reason) => {
                    metrics().record_link_drop();
                    self.apply(ConnectionEvent::LinkLost(reason));
                    self.requeue_in_flight();
                    session.close().await;
                }
            }
        }
        self.shutdown();
    }

    /// Bring a fresh session to the up state
    ///
    /// Close requests are honoured while subscriptions are re-applied; other
    /// commands are held until the resubscribe finishes.
    async fn establish(&mut self, session: &mut C::Session) -> Result<(), Setback> {
        // Fire-and-forget traffic does not depend on subscriptions
        self.release_parked(session, |publish| publish.qos == Qos::AtMostOnce)
            .map_err(|e| Setback::Failed(ConnectionEvent::LinkLost(e.to_string())))?;

        let mut held = Vec::new();
        let resubscribed = {
            let resubscribe = self.handler.on_connect(&mut *session);
            tokio::pin!(resubscribe);
            loop {
                tokio::select! {
                    result = &mut resubscribe => break result,
                    command = self.commands.recv() => match command {
                        None => return Err(Setback::Shutdown),
                        Some(Command::Close { reply }) => {
                            self.close_reply = Some(reply);
                            return Err(Setback::Shutdown);
                        }
                        Some(command) => held.push(command),
                    }
                }
            }
        };
        let mut added = Vec::new();
        for command in held {
            match command {
                Command::Publish(publish) => self.parked.push_back(publish),
                Command::Subscribe { topic, qos, reply } => {
                    self.subscribe_waiters.push(reply);
                    if self.handler.subscriptions_mut().insert(topic.clone(), qos) {
                        added.push((topic, qos));
                    }
                }
                Command::Close { .. } => {}
            }
        }

        resubscribed.map_err(|e| {
            warn!(topic = %e.topic, error = %e.source, "Re-subscription failed, restarting session");
            Setback::Failed(ConnectionEvent::SubscribeFailed(e.to_string()))
        })?;
        for (topic, qos) in added {
            session.subscribe(&topic, qos).await.map_err(|e| {
                Setback::Failed(ConnectionEvent::SubscribeFailed(format!("{topic}: {e}")))
            })?;
        }
        metrics().record_resubscription();

        self.apply(ConnectionEvent::Established);
        self.attempt = 0;
        for waiter in self.subscribe_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.release_parked(session, |_| true)
            .map_err(|e| Setback::Failed(ConnectionEvent::LinkLost(e.to_string())))
    }

    async fn serve(&mut self, session: &mut C::Session) -> Exit {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None => return Exit::Shutdown,
                        Some(Command::Close { reply }) => {
                            self.close_reply = Some(reply);
                            return Exit::Shutdown;
                        }
                        Some(Command::Publish(publish)) => {
                            if let Err(e) = self.submit(session, publish) {
                                return Exit::Dropped(e.to_string());
                            }
                        }
                        Some(Command::Subscribe { topic, qos, reply }) => {
                            if self.handler.subscriptions_mut().insert(topic.clone(), qos) {
                                if let Err(e) = session.subscribe(&topic, qos).await {
                                    self.subscribe_waiters.push(reply);
                                    return Exit::Dropped(e.to_string());
                                }
                                info!(topic = %topic, qos = ?qos, "Subscribed");
                            }
                            let _ = reply.send(());
                        }
                    }
                }
                event = session.poll() => {
                    match event {
                        Ok(SessionEvent::Delivered(ticket)) => self.complete(ticket),
                        Ok(SessionEvent::Message(message)) => {
                            metrics().record_message_received();
                            self.sink.on_message(&message);
                        }
                        Err(e) => return Exit::Dropped(e.to_string()),
                    }
                }
            }
        }
    }

    /// Unbounded reconnect attempts; `None` means shutdown was requested
    ///
    /// The attempt count carries over when a fresh session fails before Up, so
    /// the backoff keeps escalating.
    async fn reconnect_loop(&mut self) -> Option<C::Session> {
        loop {
            self.attempt = self.attempt.saturating_add(1);
            let attempt = self.attempt;
            self.apply(ConnectionEvent::ReconnectionStarted(attempt));

            let delay = self.reconnect.backoff_duration(attempt);
            if !self.wait_servicing_commands(delay).await {
                return None;
            }

            metrics().record_connection_attempt();
            match self.connector.connect().await {
                Ok(session) => {
                    metrics().record_connection_established();
                    info!(attempt, "Transport session re-established");
                    return Some(session);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Reconnection attempt failed");
                }
            }
        }
    }

    /// Sleep out a backoff delay while parking incoming requests
    async fn wait_servicing_commands(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    match command {
                        None => return false,
                        Some(Command::Close { reply }) => {
                            self.close_reply = Some(reply);
                            return false;
                        }
                        Some(Command::Publish(publish)) => {
                            debug!(topic = %publish.topic, "Link down, publish parked");
                            self.parked.push_back(publish);
                        }
                        Some(Command::Subscribe { topic, qos, reply }) => {
                            self.handler.subscriptions_mut().insert(topic, qos);
                            self.subscribe_waiters.push(reply);
                        }
                    }
                }
            }
        }
    }

    fn submit(
        &mut self,
        session: &mut C::Session,
        publish: PendingPublish,
    ) -> Result<(), TransportError> {
        match session.publish(&publish.topic, publish.payload.clone(), publish.qos) {
            Ok(ticket) => {
                if publish.attempts > 0 {
                    metrics().record_publish_retry();
                }
                self.in_flight.insert(ticket, publish);
                Ok(())
            }
            Err(e) => {
                self.parked.push_front(publish);
                Err(e)
            }
        }
    }

    /// Submit parked publishes matching `filter`, preserving order
    fn release_parked(
        &mut self,
        session: &mut C::Session,
        filter: impl Fn(&PendingPublish) -> bool,
    ) -> Result<(), TransportError> {
        let mut held = VecDeque::new();
        while let Some(publish) = self.parked.pop_front() {
            if publish.reply.is_closed() {
                continue;
            }
            if !filter(&publish) {
                held.push_back(publish);
                continue;
            }
            if let Err(e) = self.submit(session, publish) {
                while let Some(publish) = held.pop_back() {
                    self.parked.push_front(publish);
                }
                return Err(e);
            }
        }
        self.parked = held;
        Ok(())
    }

    fn complete(&mut self, ticket: Ticket) {
        if let Some(publish) = self.in_flight.remove(&ticket) {
            metrics().record_message_delivered();
            debug!(topic = %publish.topic, ticket = ticket.id(), "Publish delivered");
            let _ = publish.reply.send(());
        }
    }

    /// Move undelivered publishes back to the front of the parked queue
    fn requeue_in_flight(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let mut pending: Vec<(Ticket, PendingPublish)> = self.in_flight.drain().collect();
        pending.sort_by_key(|(ticket, _)| ticket.id());
        warn!(
            count = pending.len(),
            "Publishes in flight at link loss will be resent"
        );
        for (_, mut publish) in pending.into_iter().rev() {
            publish.attempts += 1;
            self.parked.push_front(publish);
        }
    }

    /// Apply a state event, notifying observers on up/down edges
    fn apply(&mut self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(&self.state, event);
        if next == self.state {
            return;
        }
        HealthMonitor::log_state_transition(&self.state, &next);

        let was_up = self.state.is_up();
        self.state = next;
        if was_up != self.state.is_up() {
            let link = if self.state.is_up() {
                LinkState::Up
            } else {
                LinkState::Down
            };
            for observer in &mut self.observers {
                observer.on_link_change(link);
            }
            self.state_tx.send_replace(link);
        }
    }

    fn shutdown(mut self) {
        self.apply(ConnectionEvent::Shutdown);

        let undelivered = self.parked.len() + self.in_flight.len();
        if undelivered > 0 {
            warn!(undelivered, "Discarding undelivered publishes on shutdown");
        }
        self.parked.clear();
        self.in_flight.clear();
        self.subscribe_waiters.clear();

        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(());
        }
        info!("Connection manager stopped");
    }
}
