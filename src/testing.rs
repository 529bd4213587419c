//! In-memory stand-ins for the broker, the camera and the reachability probe.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::capture::{Camera, CaptureError, PhotoArtifact};
use crate::mqtt::message::PublishRequest;
use crate::mqtt::mqtt_handler::{ConnectionHandle, ConnectionManager, ReconnectPolicy};
use crate::mqtt::state::ConnectionState;
use crate::mqtt::topics::SessionTopicNamespace;
use crate::mqtt::transport::{LossNotifier, Transport, TransportError, TransportSession};
use crate::network::Reachability;
use crate::status::StatusReporter;

const WAIT_LIMIT: Duration = Duration::from_secs(3);

pub fn spawn_manager(
    broker: &FakeBroker,
    policy: ReconnectPolicy,
) -> (
    ConnectionHandle,
    Arc<StatusReporter>,
    Arc<SessionTopicNamespace>,
) {
    let status = Arc::new(StatusReporter::new("Starting..."));
    let topics = Arc::new(SessionTopicNamespace::from_seed("camera", 1_700_000_000_000));
    let connection = ConnectionManager::spawn(
        broker.clone(),
        "photolink",
        policy,
        topics.clone(),
        status.clone(),
    );
    (connection, status, topics)
}

pub async fn wait_for_state(connection: &ConnectionHandle, target: ConnectionState) {
    let mut state = connection.subscribe_state();
    tokio::time::timeout(WAIT_LIMIT, state.wait_for(|current| *current == target))
        .await
        .unwrap_or_else(|_| panic!("connection never reached {}", target))
        .expect("connection manager stopped");
}

struct BrokerState {
    open_attempts: AtomicUsize,
    closed_sessions: AtomicUsize,
    fail_opens: AtomicBool,
    fail_publishes: AtomicBool,
    drop_during_publish: AtomicBool,
    fail_closes: AtomicBool,
    gate: Semaphore,
    published: Mutex<Vec<PublishRequest>>,
    status_at_publish: Mutex<Vec<String>>,
    observed_status: Mutex<Option<Arc<StatusReporter>>>,
    notifiers: Mutex<Vec<LossNotifier>>,
    client_ids: Mutex<Vec<String>>,
}

/// Fake broker transport. Clones share state, so tests keep one clone for
/// assertions and hand another to the connection manager.
#[derive(Clone)]
pub struct FakeBroker {
    inner: Arc<BrokerState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    /// Every open blocks until `allow_opens` hands out a permit
    pub fn gated() -> Self {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            inner: Arc::new(BrokerState {
                open_attempts: AtomicUsize::new(0),
                closed_sessions: AtomicUsize::new(0),
                fail_opens: AtomicBool::new(false),
                fail_publishes: AtomicBool::new(false),
                drop_during_publish: AtomicBool::new(false),
                fail_closes: AtomicBool::new(false),
                gate: Semaphore::new(permits),
                published: Mutex::new(Vec::new()),
                status_at_publish: Mutex::new(Vec::new()),
                observed_status: Mutex::new(None),
                notifiers: Mutex::new(Vec::new()),
                client_ids: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn allow_opens(&self, count: usize) {
        self.inner.gate.add_permits(count);
    }

    pub fn fail_opens(&self, fail: bool) {
        self.inner.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Publishes stall briefly, then the socket breaks under them: the
    /// session reports its loss and the pending publish fails
    pub fn drop_during_publish(&self, drop: bool) {
        self.inner.drop_during_publish.store(drop, Ordering::SeqCst);
    }

    pub fn fail_closes(&self, fail: bool) {
        self.inner.fail_closes.store(fail, Ordering::SeqCst);
    }

    /// Records the status line current at each publish
    pub fn observe_status(&self, status: Arc<StatusReporter>) {
        *self.inner.observed_status.lock().unwrap() = Some(status);
    }

    pub fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    pub async fn wait_for_attempts(&self, count: usize) {
        tokio::time::timeout(WAIT_LIMIT, async {
            while self.open_attempts() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never saw {} open attempts", count));
    }

    pub fn closed_sessions(&self) -> usize {
        self.inner.closed_sessions.load(Ordering::SeqCst)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.inner.client_ids.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.inner.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishRequest> {
        self.published()
            .into_iter()
            .filter(|request| request.topic == topic)
            .collect()
    }

    pub fn status_at_publish(&self) -> Vec<String> {
        self.inner.status_at_publish.lock().unwrap().clone()
    }

    /// Drops the newest session the way a broken socket would
    pub fn fire_loss(&self) {
        let notifier = self.inner.notifiers.lock().unwrap().last().cloned();
        if let Some(notifier) = notifier {
            notifier.notify("connection reset by peer");
        }
    }
}

impl Transport for FakeBroker {
    type Session = FakeSession;

    fn open(
        &self,
        client_id: String,
        on_lost: LossNotifier,
    ) -> impl Future<Output = Result<FakeSession, TransportError>> + Send {
        let inner = self.inner.clone();
        async move {
            inner.open_attempts.fetch_add(1, Ordering::SeqCst);
            inner
                .gate
                .acquire()
                .await
                .expect("gate closed")
                .forget();

            if inner.fail_opens.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("connection refused".to_string()));
            }

            inner.client_ids.lock().unwrap().push(client_id);
            inner.notifiers.lock().unwrap().push(on_lost.clone());
            Ok(FakeSession { inner, on_lost })
        }
    }
}

pub struct FakeSession {
    inner: Arc<BrokerState>,
    on_lost: LossNotifier,
}

impl TransportSession for FakeSession {
    fn publish(
        &self,
        request: PublishRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let inner = self.inner.clone();
        let on_lost = self.on_lost.clone();
        async move {
            if inner.fail_publishes.load(Ordering::SeqCst) {
                return Err(TransportError::SessionClosed);
            }
            if inner.drop_during_publish.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(20)).await;
                on_lost.notify("connection reset by peer");
                return Err(TransportError::SessionClosed);
            }
            let observed = inner.observed_status.lock().unwrap().clone();
            if let Some(status) = observed {
                inner
                    .status_at_publish
                    .lock()
                    .unwrap()
                    .push(status.current().message);
            }
            inner.published.lock().unwrap().push(request);
            Ok(())
        }
    }

    fn close(self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            self.inner.closed_sessions.fetch_add(1, Ordering::SeqCst);
            if self.inner.fail_closes.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("socket already closed".to_string()));
            }
            Ok(())
        }
    }
}

struct CameraState {
    photo_size: AtomicUsize,
    failure: Mutex<Option<String>>,
    panics: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    observed_status: Mutex<Option<Arc<StatusReporter>>>,
    status_at_capture: Mutex<Vec<String>>,
}

#[derive(Clone)]
pub struct FakeCamera {
    inner: Arc<CameraState>,
}

impl FakeCamera {
    pub fn returning(photo_size: usize) -> Self {
        Self {
            inner: Arc::new(CameraState {
                photo_size: AtomicUsize::new(photo_size),
                failure: Mutex::new(None),
                panics: AtomicBool::new(false),
                delay: Mutex::new(Duration::ZERO),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                observed_status: Mutex::new(None),
                status_at_capture: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn failing(cause: &str) -> Self {
        let camera = Self::returning(0);
        *camera.inner.failure.lock().unwrap() = Some(cause.to_string());
        camera
    }

    pub fn panicking() -> Self {
        let camera = Self::returning(0);
        camera.inner.panics.store(true, Ordering::SeqCst);
        camera
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock().unwrap() = delay;
        self
    }

    pub fn observe_status(&self, status: Arc<StatusReporter>) {
        *self.inner.observed_status.lock().unwrap() = Some(status);
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn status_at_capture(&self) -> Vec<String> {
        self.inner.status_at_capture.lock().unwrap().clone()
    }
}

impl Camera for FakeCamera {
    fn capture(&self) -> impl Future<Output = Result<PhotoArtifact, CaptureError>> + Send {
        let inner = self.inner.clone();
        async move {
            let call = inner.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_in_flight.fetch_max(running, Ordering::SeqCst);

            let observed = inner.observed_status.lock().unwrap().clone();
            if let Some(status) = observed {
                inner
                    .status_at_capture
                    .lock()
                    .unwrap()
                    .push(status.current().message);
            }

            let delay = *inner.delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);

            if inner.panics.load(Ordering::SeqCst) {
                panic!("camera driver crashed");
            }
            let failure = inner.failure.lock().unwrap().clone();
            if let Some(cause) = failure {
                return Err(CaptureError::Device(cause));
            }

            let size = inner.photo_size.load(Ordering::SeqCst);
            Ok(PhotoArtifact::new(
                vec![0xD8; size],
                PathBuf::from(format!("/tmp/photolink/IMG_{:04}.jpg", call)),
            ))
        }
    }
}

#[derive(Clone)]
pub struct FakeReachability {
    reachable: Arc<AtomicBool>,
}

impl FakeReachability {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: Arc::new(AtomicBool::new(reachable)),
        }
    }
}

impl Reachability for FakeReachability {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
