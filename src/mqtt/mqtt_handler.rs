//! Connection manager for the single broker session.
//!
//! One tokio task owns the transport session and the [`ConnectionState`].
//! Everything that touches either goes through that task's queues, so
//! connect, publish, disconnect and reconnect never overlap.
//!
//! ```text
//! ConnectionHandle ──Command──►┐
//! open task ───────Opened─────►├──► ConnectionManager task ──► TransportSession
//! transport driver ──Lost─────►│            │
//! backoff timer ──RetryDue────►┘            ├──► watch<ConnectionState>
//!                                           └──► StatusReporter
//! ```
//!
//! Opening a session runs in its own task and reports back through the queue,
//! which keeps the manager responsive while Connecting: a second connect sees
//! the Connecting state and returns without opening anything. Every session
//! carries a generation number and results or loss signals from an older
//! generation are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ReconnectConfig;
use super::message::{PublishRequest, QosLevel};
use super::state::{ConnectionEvent, ConnectionState};
use super::topics::SessionTopicNamespace;
use super::transport::{LossNotifier, SessionSignal, Transport, TransportError, TransportSession};
use crate::status::StatusReporter;

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("MQTT connection failed: {cause}")]
    ConnectFailed { cause: String },

    #[error("MQTT not connected")]
    NotConnected,

    #[error("MQTT publish failed: {cause}")]
    PublishFailed { cause: String },

    #[error("MQTT disconnect failed: {cause}")]
    DisconnectFailed { cause: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// This call opened the session
    Connected,
    AlreadyConnected,
    /// Another connect or a reconnect is in flight, nothing was started
    InProgress,
}

/// Bounded exponential backoff between a loss and its reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            stable_after: Duration::from_secs(config.stable_after_secs),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect following the `streak`-th consecutive loss
    pub fn delay_for(&self, streak: u32) -> Duration {
        let exponent = streak.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
enum Command {
    Connect {
        reply: Option<oneshot::Sender<Result<ConnectOutcome, ConnectionError>>>,
    },
    Publish {
        request: PublishRequest,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

struct Opened<S> {
    generation: u64,
    result: Result<S, TransportError>,
}

pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    topics: Arc<SessionTopicNamespace>,
    status: Arc<StatusReporter>,
    client_prefix: String,
    policy: ReconnectPolicy,

    state: watch::Sender<ConnectionState>,
    session: Option<T::Session>,
    generation: u64,
    connected_at: Option<Instant>,
    loss_streak: u32,
    retry: Option<CancellationToken>,
    pending: Vec<oneshot::Sender<Result<ConnectOutcome, ConnectionError>>>,

    commands: mpsc::Receiver<Command>,
    opened_tx: mpsc::UnboundedSender<Opened<T::Session>>,
    opened_rx: mpsc::UnboundedReceiver<Opened<T::Session>>,
    signals_tx: mpsc::UnboundedSender<SessionSignal>,
    signals_rx: mpsc::UnboundedReceiver<SessionSignal>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Starts the manager task in the Disconnected state.
    pub fn spawn(
        transport: T,
        client_prefix: impl Into<String>,
        policy: ReconnectPolicy,
        topics: Arc<SessionTopicNamespace>,
        status: Arc<StatusReporter>,
    ) -> ConnectionHandle {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);

        let manager = Self {
            transport: Arc::new(transport),
            topics,
            status,
            client_prefix: client_prefix.into(),
            policy,
            state,
            session: None,
            generation: 0,
            connected_at: None,
            loss_streak: 0,
            retry: None,
            pending: Vec::new(),
            commands,
            opened_tx,
            opened_rx,
            signals_tx,
            signals_rx,
        };

        debug!("Spawning connection manager with {:?}", manager.policy);
        tokio::spawn(manager.run());

        ConnectionHandle {
            commands: command_tx,
            state: state_rx,
        }
    }

    async fn run(mut self) {
        info!("Connection manager started");
        loop {
            tokio::select! {
                biased;
                Some(opened) = self.opened_rx.recv() => self.on_opened(opened).await,
                Some(signal) = self.signals_rx.recv() => self.on_signal(signal),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
            }
        }

        info!("All connection handles dropped, shutting down connection manager");
        self.disconnect().await;
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn apply(&mut self, event: ConnectionEvent) -> ConnectionState {
        let current = self.current();
        let next = current.next(event);
        if next != current {
            info!("Connection state {} -> {} on {:?}", current, next, event);
            self.state.send_replace(next);
        } else {
            debug!("Connection state stays {} on {:?}", current, event);
        }
        next
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Publish { request, reply } => {
                let result = self.publish(request).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, reply: Option<oneshot::Sender<Result<ConnectOutcome, ConnectionError>>>) {
        let state = self.current();
        if state.is_active() {
            debug!("Connect ignored, connection is {}", state);
            let outcome = if state.is_connected() {
                ConnectOutcome::AlreadyConnected
            } else {
                ConnectOutcome::InProgress
            };
            if let Some(reply) = reply {
                let _ = reply.send(Ok(outcome));
            }
            return;
        }

        // Explicit connects start a fresh backoff sequence
        self.loss_streak = 0;
        if let Some(reply) = reply {
            self.pending.push(reply);
        }
        info!("Connecting to MQTT broker");
        self.begin_connect();
    }

    fn begin_connect(&mut self) {
        self.generation += 1;
        self.apply(ConnectionEvent::ConnectRequested);

        let generation = self.generation;
        let client_id = self.topics.client_id(&self.client_prefix, generation);
        let on_lost = LossNotifier::new(generation, self.signals_tx.clone());
        let transport = self.transport.clone();
        let opened = self.opened_tx.clone();

        tokio::spawn(async move {
            let result = transport.open(client_id, on_lost).await;
            let _ = opened.send(Opened { generation, result });
        });
    }

    async fn on_opened(&mut self, opened: Opened<T::Session>) {
        let Opened { generation, result } = opened;

        if generation != self.generation || self.current() != ConnectionState::Connecting {
            debug!("Discarding outcome of stale session {}", generation);
            if let Ok(session) = result {
                tokio::spawn(async move {
                    if let Err(e) = session.close().await {
                        debug!("Closing stale session {} failed: {}", generation, e);
                    }
                });
            }
            return;
        }

        match result {
            Ok(session) => {
                self.session = Some(session);
                self.connected_at = Some(Instant::now());
                self.apply(ConnectionEvent::SessionOpened);

                let hello = PublishRequest::text(self.topics.status(), "Connected");
                if let Err(e) = self.publish(hello).await {
                    warn!("Failed to publish connected status: {}", e);
                }
                self.status.set("MQTT connected");
                self.resolve_pending(Ok(ConnectOutcome::Connected));
            }
            Err(e) => {
                error!("Failed to open MQTT session {}: {}", generation, e);
                self.apply(ConnectionEvent::OpenFailed);
                let error = ConnectionError::ConnectFailed {
                    cause: e.to_string(),
                };
                self.status.set(format!("ERROR: {}", error));
                self.resolve_pending(Err(error));
            }
        }
    }

    fn resolve_pending(&mut self, result: Result<ConnectOutcome, ConnectionError>) {
        for reply in self.pending.drain(..) {
            let _ = reply.send(result.clone());
        }
    }

    fn on_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Lost { generation, cause } => self.on_lost(generation, cause),
            SessionSignal::RetryDue { generation } => {
                if generation == self.generation && self.current() == ConnectionState::Reconnecting
                {
                    self.retry = None;
                    info!(
                        "Reconnecting (attempt {} of {})",
                        self.loss_streak, self.policy.max_attempts
                    );
                    self.begin_connect();
                } else {
                    debug!("Ignoring retry for stale session {}", generation);
                }
            }
        }
    }

    fn on_lost(&mut self, generation: u64, cause: String) {
        if generation != self.generation || !self.current().is_connected() {
            debug!(
                "Ignoring loss of session {} while {} (current session {})",
                generation,
                self.current(),
                self.generation
            );
            return;
        }

        warn!("MQTT connection lost: {}", cause);
        // The transport gave up on this session, nothing left to close
        self.session = None;
        self.apply(ConnectionEvent::ConnectionLost);

        let lived = self
            .connected_at
            .take()
            .map(|since| since.elapsed())
            .unwrap_or_default();
        if lived >= self.policy.stable_after {
            self.loss_streak = 0;
        }
        self.loss_streak += 1;

        if self.loss_streak > self.policy.max_attempts {
            error!(
                "Giving up after {} consecutive connection losses",
                self.policy.max_attempts
            );
            self.apply(ConnectionEvent::DisconnectRequested);
            self.status.set(format!(
                "ERROR: MQTT connection lost, giving up after {} attempts",
                self.policy.max_attempts
            ));
            return;
        }

        let delay = self.policy.delay_for(self.loss_streak);
        self.status.set("MQTT connection lost, reconnecting...");
        debug!("Reconnect of session {} scheduled in {:?}", generation, delay);

        let token = CancellationToken::new();
        self.retry = Some(token.clone());
        let signals = self.signals_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Reconnect of session {} cancelled", generation),
                _ = tokio::time::sleep(delay) => {
                    let _ = signals.send(SessionSignal::RetryDue { generation });
                }
            }
        });
    }

    async fn publish(&self, request: PublishRequest) -> Result<(), ConnectionError> {
        let session = match (&self.session, self.current()) {
            (Some(session), ConnectionState::Connected) => session,
            _ => return Err(ConnectionError::NotConnected),
        };

        session
            .publish(request)
            .await
            .map_err(|e| ConnectionError::PublishFailed {
                cause: e.to_string(),
            })
    }

    async fn disconnect(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }

        match self.current() {
            ConnectionState::Disconnected => debug!("Disconnect ignored, already disconnected"),
            ConnectionState::Connected => {
                let bye = PublishRequest::text(self.topics.info(), "disconnecting");
                if let Err(e) = self.publish(bye).await {
                    warn!("Failed to announce disconnect: {}", e);
                }
                if let Some(session) = self.session.take() {
                    if let Err(e) = session.close().await {
                        let error = ConnectionError::DisconnectFailed {
                            cause: e.to_string(),
                        };
                        warn!("{}", error);
                    }
                }
                self.connected_at = None;
                self.apply(ConnectionEvent::DisconnectRequested);
                self.status.set("MQTT disconnected");
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                // Invalidates the open in flight, its session gets closed on arrival
                self.generation += 1;
                self.apply(ConnectionEvent::DisconnectRequested);
                self.resolve_pending(Err(ConnectionError::ConnectFailed {
                    cause: "disconnect requested".to_string(),
                }));
                self.status.set("MQTT disconnected");
            }
        }
    }
}

/// Cloneable access to the connection manager task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Opens a session unless one is open or opening, and waits for the outcome.
    pub async fn connect(&self) -> Result<ConnectOutcome, ConnectionError> {
        let (reply, response) = oneshot::channel();
        let stopped = || ConnectionError::ConnectFailed {
            cause: "connection manager stopped".to_string(),
        };

        self.commands
            .send(Command::Connect { reply: Some(reply) })
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }

    /// Same as `connect` without waiting for the session.
    pub async fn request_connect(&self) {
        if self
            .commands
            .send(Command::Connect { reply: None })
            .await
            .is_err()
        {
            warn!("Connect requested after connection manager stopped");
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> Result<(), ConnectionError> {
        self.publish_request(PublishRequest::new(topic, payload, qos))
            .await
    }

    /// Fails with `NotConnected` right away unless the session is up.
    pub async fn publish_request(&self, request: PublishRequest) -> Result<(), ConnectionError> {
        if !self.state().is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Publish { request, reply })
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        response.await.map_err(|_| ConnectionError::NotConnected)?
    }

    /// Best-effort shutdown, never fails.
    pub async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { reply })
            .await
            .is_err()
        {
            debug!("Connection manager already stopped");
            return;
        }
        let _ = response.await;
    }
}
