use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use chrono::Local;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Camera, CaptureError, PhotoArtifact};
use crate::config::CaptureConfig;

const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Takes photos by running a still-capture program that writes a JPEG to
/// the path substituted for `{output}`. The file is deleted once its bytes
/// are in memory unless `keep_files` is set.
#[derive(Debug, Clone)]
pub struct CommandCamera {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
    keep_files: bool,
}

impl CommandCamera {
    pub fn new(program: impl Into<String>, args: Vec<String>, output_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            output_dir,
            keep_files: false,
        }
    }

    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            config.output_dir.clone(),
        )
        .keep_files(config.keep_files)
    }

    fn next_output_path(&self) -> PathBuf {
        let name = Local::now().format("IMG_%Y%m%d_%H%M%S_%3f.jpg").to_string();
        self.output_dir.join(name)
    }

    fn args_for(&self, output: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, output))
            .collect()
    }
}

impl Camera for CommandCamera {
    fn capture(&self) -> impl Future<Output = Result<PhotoArtifact, CaptureError>> + Send {
        let output_path = self.next_output_path();
        let args = self.args_for(&output_path.to_string_lossy());
        let program = self.program.clone();
        let output_dir = self.output_dir.clone();
        let keep_files = self.keep_files;

        async move {
            tokio::fs::create_dir_all(&output_dir)
                .await
                .map_err(|source| CaptureError::Io {
                    path: output_dir.clone(),
                    source,
                })?;

            debug!("Running {} {:?}", program, args);
            let output = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|source| CaptureError::Spawn {
                    program: program.clone(),
                    source,
                })?;

            if !output.status.success() {
                return Err(CaptureError::Failed {
                    program,
                    status: output.status,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }

            let bytes = tokio::fs::read(&output_path)
                .await
                .map_err(|source| CaptureError::Io {
                    path: output_path.clone(),
                    source,
                })?;

            info!("Captured {} ({} bytes)", output_path.display(), bytes.len());

            if !keep_files {
                if let Err(e) = tokio::fs::remove_file(&output_path).await {
                    warn!("Failed to delete {}: {}", output_path.display(), e);
                }
            }
            Ok(PhotoArtifact::new(bytes, output_path))
        }
    }
}
