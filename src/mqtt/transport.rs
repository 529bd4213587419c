//! Broker transport seam.
//!
//! The connection manager only talks to [`Transport`] and [`TransportSession`].
//! [`MqttTransport`] implements them on top of rumqttc; tests swap in a fake.
//!
//! # Session driver
//!
//! ```text
//! open() ──► AsyncClient + EventLoop ──► poll until ConnAck
//!                                             │
//!                                             ▼
//!                               spawn driver: poll forever
//!                                 ├─ Outgoing::Publish(pkid) ─┐
//!                                 ├─ PubAck/PubComp(pkid) ────┴─► delivery channel ──► publish()
//!                                 ├─ Outgoing::Disconnect ──► stop
//!                                 └─ Err(e) ──► LossNotifier (unless closing)
//! ```
//!
//! Publishes run one at a time. Each waits for the packet id rumqttc assigned
//! to its own PUBLISH and only accepts the acknowledgement carrying that id.
//! A publish that is not acknowledged in time gives up on the whole session,
//! so a late acknowledgement can never be read by a later publish.

use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::BrokerConfig;
use super::message::PublishRequest;

/// Header allowance on top of the largest accepted payload
const PACKET_HEADROOM: usize = 64 * 1024;

/// How long close() waits for the driver to flush DISCONNECT
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Session closed before the broker acknowledged")]
    SessionClosed,
}

/// What the driver saw happen to a packet, in event loop order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// A PUBLISH was written with this packet id (0 for QoS 0)
    Sent(u16),
    /// PubAck (QoS 1) or PubComp (QoS 2) for this packet id
    Acked(u16),
}

/// Signals delivered into the connection manager's queue from outside its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    Lost { generation: u64, cause: String },
    RetryDue { generation: u64 },
}

/// Handed to the transport on open. The transport calls `notify` from its own
/// task when the session drops; the manager decides what to do with it.
#[derive(Debug, Clone)]
pub struct LossNotifier {
    generation: u64,
    signals: mpsc::UnboundedSender<SessionSignal>,
}

impl LossNotifier {
    pub fn new(generation: u64, signals: mpsc::UnboundedSender<SessionSignal>) -> Self {
        Self {
            generation,
            signals,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(&self, cause: impl Into<String>) {
        let signal = SessionSignal::Lost {
            generation: self.generation,
            cause: cause.into(),
        };
        if self.signals.send(signal).is_err() {
            debug!(
                "Connection manager gone, dropping loss of session {}",
                self.generation
            );
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    type Session: TransportSession;

    /// Opens a clean session under `client_id`. Resolves once the broker
    /// accepted the connection.
    fn open(
        &self,
        client_id: String,
        on_lost: LossNotifier,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

pub trait TransportSession: Send + Sync + 'static {
    /// Resolves when the broker acknowledged the message (QoS 1/2) or the
    /// message was handed to the network (QoS 0).
    fn publish(
        &self,
        request: PublishRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct MqttTransport {
    broker: BrokerConfig,
    max_packet_size: usize,
}

impl MqttTransport {
    pub fn new(broker: BrokerConfig, max_message_size: usize) -> Self {
        Self {
            broker,
            max_packet_size: max_message_size + PACKET_HEADROOM,
        }
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.broker.host.clone(), self.broker.port);
        options
            .set_keep_alive(self.broker.keep_alive())
            .set_clean_session(true)
            .set_max_packet_size(self.max_packet_size, self.max_packet_size);
        options
    }
}

impl Transport for MqttTransport {
    type Session = MqttSession;

    fn open(
        &self,
        client_id: String,
        on_lost: LossNotifier,
    ) -> impl Future<Output = Result<MqttSession, TransportError>> + Send {
        let options = self.options(&client_id);
        let capacity = self.broker.request_capacity;
        let connect_timeout = self.broker.connect_timeout();
        let publish_timeout = self.broker.publish_timeout();
        let address = self.broker.address();

        async move {
            info!("Opening MQTT session {} to {}", client_id, address);
            let (client, mut eventloop) = AsyncClient::new(options, capacity);

            match timeout(connect_timeout, wait_for_connack(&mut eventloop)).await {
                Ok(Ok(())) => info!("Broker accepted session {}", client_id),
                Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                Err(_) => return Err(TransportError::Timeout("connect", connect_timeout)),
            }

            let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
            let closing = CancellationToken::new();
            let driver = tokio::spawn(drive_event_loop(
                eventloop,
                delivery_tx,
                on_lost.clone(),
                closing.clone(),
            ));

            Ok(MqttSession {
                client,
                deliveries: Mutex::new(delivery_rx),
                on_lost,
                closing,
                driver,
                publish_timeout,
            })
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!("ConnAck received: {:?}", ack);
                return Ok(());
            }
            event => debug!("Event before ConnAck: {:?}", event),
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    deliveries: mpsc::UnboundedSender<Delivery>,
    on_lost: LossNotifier,
    closing: CancellationToken,
) {
    let generation = on_lost.generation();
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = deliveries.send(Delivery::Sent(pkid));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = deliveries.send(Delivery::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                let _ = deliveries.send(Delivery::Acked(comp.pkid));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Session {} sent DISCONNECT, driver stopping", generation);
                break;
            }
            Ok(event) => debug!("Session {} event: {:?}", generation, event),
            Err(e) => {
                if closing.is_cancelled() {
                    debug!("Session {} closed: {}", generation, e);
                } else {
                    warn!("Session {} lost: {}", generation, e);
                    on_lost.notify(e.to_string());
                }
                break;
            }
        }
    }
}

pub struct MqttSession {
    client: AsyncClient,
    deliveries: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    on_lost: LossNotifier,
    closing: CancellationToken,
    driver: JoinHandle<()>,
    publish_timeout: Duration,
}

impl MqttSession {
    /// Marks the session dead and reports it as lost. The driver sees the
    /// cancelled token and stays quiet when the socket goes away.
    fn abandon(&self, cause: String) {
        if self.closing.is_cancelled() {
            return;
        }
        warn!("Session {} abandoned: {}", self.on_lost.generation(), cause);
        self.closing.cancel();
        if let Err(e) = self.client.try_disconnect() {
            debug!("DISCONNECT not queued: {}", e);
        }
        self.on_lost.notify(cause);
    }
}

/// Reads deliveries until the acknowledgement for our own PUBLISH shows up.
/// `None` means the driver stopped first.
async fn wait_for_own_ack(deliveries: &mut mpsc::UnboundedReceiver<Delivery>) -> Option<u16> {
    let mut own = None;
    while let Some(delivery) = deliveries.recv().await {
        match (delivery, own) {
            // pkid 0 belongs to a QoS 0 publish that did not wait
            (Delivery::Sent(pkid), None) if pkid != 0 => own = Some(pkid),
            (Delivery::Acked(pkid), Some(expected)) if pkid == expected => return Some(pkid),
            (other, _) => debug!("Ignoring {:?} while waiting for {:?}", other, own),
        }
    }
    None
}

impl TransportSession for MqttSession {
    fn publish(
        &self,
        request: PublishRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            let mut deliveries = self.deliveries.lock().await;
            if self.closing.is_cancelled() {
                return Err(TransportError::SessionClosed);
            }
            while deliveries.try_recv().is_ok() {}

            let qos = request.qos;
            debug!("Publishing {}", request);
            self.client
                .publish(request.topic, qos.into(), request.retain, request.payload)
                .await?;

            if !qos.is_acknowledged() {
                return Ok(());
            }

            match timeout(self.publish_timeout, wait_for_own_ack(&mut deliveries)).await {
                Ok(Some(pkid)) => {
                    debug!("Broker acknowledged packet {}", pkid);
                    Ok(())
                }
                Ok(None) => Err(TransportError::SessionClosed),
                Err(_) => {
                    self.abandon(format!(
                        "publish not acknowledged within {:?}",
                        self.publish_timeout
                    ));
                    Err(TransportError::Timeout("publish", self.publish_timeout))
                }
            }
        }
    }

    fn close(self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            self.closing.cancel();
            let result = self
                .client
                .disconnect()
                .await
                .map_err(TransportError::from);

            let mut driver = self.driver;
            if timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                warn!("Session driver did not stop within {:?}, aborting", CLOSE_GRACE);
                driver.abort();
            }
            result
        }
    }
}
