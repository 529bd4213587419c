use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::pipeline::{CapturePipeline, PipelineError};
use super::Camera;
use crate::network::Reachability;
use crate::status::StatusReporter;

/// Entry point for capture triggers. Runs are executed one at a time by a
/// single worker task; a trigger that arrives while a run is in flight is
/// rejected instead of queued.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    triggers: mpsc::Sender<()>,
    busy: Arc<AtomicBool>,
    status: Arc<StatusReporter>,
}

impl CaptureHandle {
    pub fn spawn<C: Camera, R: Reachability>(pipeline: CapturePipeline<C, R>) -> Self {
        let (triggers, trigger_rx) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let status = pipeline.status().clone();

        tokio::spawn(run_worker(
            Arc::new(pipeline),
            trigger_rx,
            busy.clone(),
            status.clone(),
        ));
        info!("Capture worker started");

        Self {
            triggers,
            busy,
            status,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Non-blocking, callable from the UI thread.
    pub fn on_trigger_capture(&self) -> Result<(), PipelineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let rejected = PipelineError::Busy;
            warn!("Capture trigger rejected: {}", rejected);
            self.status.set(rejected.status_message());
            return Err(rejected);
        }

        if let Err(e) = self.triggers.try_send(()) {
            self.busy.store(false, Ordering::SeqCst);
            let failed = PipelineError::Unexpected {
                cause: format!("capture worker unavailable: {}", e),
            };
            error!("{}", failed);
            self.status.set(failed.status_message());
            return Err(failed);
        }

        debug!("Capture triggered");
        Ok(())
    }
}

async fn run_worker<C: Camera, R: Reachability>(
    pipeline: Arc<CapturePipeline<C, R>>,
    mut triggers: mpsc::Receiver<()>,
    busy: Arc<AtomicBool>,
    status: Arc<StatusReporter>,
) {
    while triggers.recv().await.is_some() {
        let run = pipeline.clone();
        // A panic inside the run surfaces here as a JoinError
        let outcome = tokio::spawn(async move { run.capture_and_publish().await }).await;

        if let Err(join_error) = outcome {
            let failed = PipelineError::Unexpected {
                cause: join_error.to_string(),
            };
            error!("{}", failed);
            status.set(failed.status_message());
        }
        busy.store(false, Ordering::SeqCst);
    }
    info!("All capture handles dropped, capture worker stopping");
}
