//! Photo capture: the camera seam, the capture-upload pipeline and the
//! single worker that runs it.
//!
//! ```text
//! UI button ──► CaptureHandle::on_trigger_capture()
//!                    │ (rejected while busy)
//!                    ▼
//!              capture worker ──► PipelineRun<Preflight>
//!                                   │ check()   reachability + connection
//!                                   ▼
//!                               PipelineRun<Ready>
//!                                   │ capture() Camera
//!                                   ▼
//!                               PipelineRun<Captured>
//!                                   │ upload()  info, size policy, photo
//!                                   ▼
//!                               StatusReporter
//! ```

pub mod camera;
pub mod capture_handle;
pub mod pipeline;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, Local};

pub use camera::CommandCamera;
pub use capture_handle::CaptureHandle;
pub use pipeline::{CapturePipeline, PipelineError, PipelinePolicy};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Device(String),
}

/// One captured image. Owned by the pipeline run that produced it and
/// dropped once that run finishes.
#[derive(Clone)]
pub struct PhotoArtifact {
    pub bytes: Vec<u8>,
    pub size_bytes: usize,
    pub captured_at: DateTime<Local>,
    pub local_path: PathBuf,
}

impl PhotoArtifact {
    pub fn new(bytes: Vec<u8>, local_path: PathBuf) -> Self {
        Self {
            size_bytes: bytes.len(),
            bytes,
            captured_at: Local::now(),
            local_path,
        }
    }

    /// File name shown in the info message
    pub fn name(&self) -> String {
        self.local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.local_path.display().to_string())
    }
}

impl fmt::Debug for PhotoArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhotoArtifact")
            .field("size_bytes", &self.size_bytes)
            .field("captured_at", &self.captured_at)
            .field("local_path", &self.local_path)
            .finish()
    }
}

/// Produces one image per call. Callers never run two captures at once,
/// but a new capture may start right after the previous one returned.
pub trait Camera: Send + Sync + 'static {
    fn capture(&self) -> impl Future<Output = Result<PhotoArtifact, CaptureError>> + Send;
}
