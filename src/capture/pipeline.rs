//! Capture-then-publish workflow for a single trigger.
//!
//! Each trigger builds a fresh [`PipelineRun`] and walks it through its
//! stages. A stage either hands the run to the next stage or fails with a
//! [`PipelineError`]; [`CapturePipeline::capture_and_publish`] is the only
//! place where those errors become `"ERROR: "` status lines.
//!
//! ```text
//! Preflight ──check()──► Ready ──capture()──► Captured ──upload()──► done
//!     │                    │                     │
//!     └── no network       └── camera failed     ├── too large (warning sent)
//!     └── not connected                          └── publish failed
//! ```

use std::sync::Arc;

use statum::{machine, state};
use tracing::{debug, error, info, warn};

use super::{Camera, PhotoArtifact};
use crate::mqtt::message::{PublishRequest, QosLevel};
use crate::mqtt::mqtt_handler::{ConnectionError, ConnectionHandle};
use crate::mqtt::topics::SessionTopicNamespace;
use crate::network::Reachability;
use crate::status::StatusReporter;

/// Largest photo payload sent to the broker (10 MiB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Optional pipeline steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePolicy {
    pub check_reachability: bool,
    pub enforce_size_limit: bool,
    pub max_message_size: usize,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            check_reachability: true,
            enforce_size_limit: true,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("No network connection")]
    ReachabilityUnavailable,

    #[error("MQTT not connected, reconnecting...")]
    NotConnected,

    #[error("MQTT connection failed: {cause}")]
    ConnectFailed { cause: String },

    #[error("Photo upload failed: {cause}")]
    PublishFailed { cause: String },

    #[error("Photo capture failed: {cause}")]
    CaptureFailed { cause: String },

    #[error("Photo too large for MQTT: {size} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("MQTT disconnect failed: {cause}")]
    DisconnectFailed { cause: String },

    #[error("Capture already in progress")]
    Busy,

    #[error("Capture task failed: {cause}")]
    Unexpected { cause: String },
}

impl PipelineError {
    /// Status line shown to the user
    pub fn status_message(&self) -> String {
        format!("ERROR: {}", self)
    }
}

impl From<ConnectionError> for PipelineError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::NotConnected => PipelineError::NotConnected,
            ConnectionError::ConnectFailed { cause } => PipelineError::ConnectFailed { cause },
            ConnectionError::PublishFailed { cause } => PipelineError::PublishFailed { cause },
            ConnectionError::DisconnectFailed { cause } => {
                PipelineError::DisconnectFailed { cause }
            }
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum RunStage {
    Preflight,
    Ready,
    Captured,
}

/// One trigger's walk through the pipeline. The stage parameter makes
/// skipping a precondition or uploading without a photo a compile error.
#[machine]
pub struct PipelineRun<S: RunStage> {
    connection: ConnectionHandle,
    status: Arc<StatusReporter>,
    topics: Arc<SessionTopicNamespace>,
    policy: PipelinePolicy,
    artifact: Option<PhotoArtifact>,
}

impl PipelineRun<Preflight> {
    pub fn start(
        connection: ConnectionHandle,
        status: Arc<StatusReporter>,
        topics: Arc<SessionTopicNamespace>,
        policy: PipelinePolicy,
    ) -> Self {
        Self::new(connection, status, topics, policy, None)
    }

    /// Network reachability, then connection readiness. A missing session
    /// triggers one background connect and fails this run without waiting.
    pub async fn check<R: Reachability>(
        self,
        reachability: &R,
    ) -> Result<PipelineRun<Ready>, PipelineError> {
        if self.policy.check_reachability && !reachability.is_reachable() {
            warn!("Network unreachable, capture aborted");
            return Err(PipelineError::ReachabilityUnavailable);
        }

        let state = self.connection.state();
        if !state.is_connected() {
            warn!("Capture requested while MQTT is {}, requesting connect", state);
            self.connection.request_connect().await;
            return Err(PipelineError::NotConnected);
        }

        debug!("Preconditions met");
        Ok(self.transition())
    }
}

impl PipelineRun<Ready> {
    pub async fn capture<C: Camera>(
        mut self,
        camera: &C,
    ) -> Result<PipelineRun<Captured>, PipelineError> {
        self.status.set("Taking photo...");

        let artifact = camera.capture().await.map_err(|e| {
            error!("Camera failed: {}", e);
            PipelineError::CaptureFailed {
                cause: e.to_string(),
            }
        })?;

        info!("Photo captured: {:?}", artifact);
        self.artifact = Some(artifact);
        Ok(self.transition())
    }
}

impl PipelineRun<Captured> {
    /// Announces the photo, applies the size policy and publishes the bytes.
    /// Returns the number of bytes published.
    pub async fn upload(mut self) -> Result<usize, PipelineError> {
        let artifact = self.artifact.take().ok_or_else(|| PipelineError::Unexpected {
            cause: "no photo in captured stage".to_string(),
        })?;

        self.status.set("Uploading photo...");
        self.send_text(
            self.topics.info(),
            &format!("Photo captured: {}", artifact.name()),
        )
        .await;

        let size = artifact.size_bytes;
        let limit = self.policy.max_message_size;
        if self.policy.enforce_size_limit && size > limit {
            warn!("Photo of {} bytes exceeds limit of {} bytes", size, limit);
            self.send_text(
                self.topics.warning(),
                &format!(
                    "Photo {} too large for MQTT: {} bytes exceeds the {} byte limit by {} bytes",
                    artifact.name(),
                    size,
                    limit,
                    size - limit
                ),
            )
            .await;
            return Err(PipelineError::PayloadTooLarge { size, limit });
        }

        let request =
            PublishRequest::new(self.topics.photo(), artifact.bytes, QosLevel::ExactlyOnce);
        self.connection
            .publish_request(request)
            .await
            .map_err(|e| PipelineError::PublishFailed {
                cause: e.to_string(),
            })?;

        info!("Published {} bytes to {}", size, self.topics.photo());
        Ok(size)
    }

    // Info and warning messages never fail the run
    async fn send_text(&self, topic: &str, body: &str) {
        if let Err(e) = self
            .connection
            .publish_request(PublishRequest::text(topic, body))
            .await
        {
            warn!("Failed to publish to {}: {}", topic, e);
        }
    }
}

/// Everything a run needs, kept for the lifetime of the process.
pub struct CapturePipeline<C, R> {
    camera: C,
    reachability: R,
    connection: ConnectionHandle,
    status: Arc<StatusReporter>,
    topics: Arc<SessionTopicNamespace>,
    policy: PipelinePolicy,
}

impl<C: Camera, R: Reachability> CapturePipeline<C, R> {
    pub fn new(
        camera: C,
        reachability: R,
        connection: ConnectionHandle,
        status: Arc<StatusReporter>,
        topics: Arc<SessionTopicNamespace>,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            camera,
            reachability,
            connection,
            status,
            topics,
            policy,
        }
    }

    pub fn status(&self) -> &Arc<StatusReporter> {
        &self.status
    }

    /// Runs one capture and reports the outcome. Callers must not run two
    /// of these at the same time, see `CaptureHandle`.
    pub async fn capture_and_publish(&self) -> Result<(), PipelineError> {
        match self.run().await {
            Ok(size) => {
                info!("Capture run finished, {} bytes uploaded", size);
                self.status.set("SUCCESS: Photo uploaded successfully");
                Ok(())
            }
            Err(e) => {
                warn!("Capture run failed: {}", e);
                self.status.set(e.status_message());
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<usize, PipelineError> {
        let run = PipelineRun::<Preflight>::start(
            self.connection.clone(),
            self.status.clone(),
            self.topics.clone(),
            self.policy.clone(),
        );
        run.check(&self.reachability)
            .await?
            .capture(&self.camera)
            .await?
            .upload()
            .await
    }
}
