use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::pipeline::{PipelinePolicy, MAX_MESSAGE_SIZE};
use crate::mqtt::config::{BrokerConfig, ReconnectConfig};

const CONFIG_DIR: &str = "photolink";
const CONFIG_FILE: &str = "config.toml";

/// Public DNS resolver, answers TCP on most networks with internet access
pub const DEFAULT_PROBE_TARGET: &str = "1.1.1.1:53";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub reconnect: ReconnectConfig,
    pub capture: CaptureConfig,
    pub probe: ProbeConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    /// First topic level, the session seed follows it
    pub root: String,
    pub client_prefix: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            root: "camera".to_string(),
            client_prefix: "photolink".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub program: String,
    /// `{output}` is replaced with the path the photo has to be written to
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    /// Leave captured JPEGs in `output_dir` instead of deleting them once read
    pub keep_files: bool,
    pub check_reachability: bool,
    pub enforce_size_limit: bool,
    pub max_message_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "libcamera-still".to_string(),
            args: vec!["-n".to_string(), "-o".to_string(), "{output}".to_string()],
            output_dir: default_output_dir(),
            keep_files: false,
            check_reachability: true,
            enforce_size_limit: true,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// host:port that answers while the device has a network. Point it at
    /// a LAN host for networks without internet access.
    pub target: String,
    pub interval_secs: u64,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_PROBE_TARGET.to_string(),
            interval_secs: 5,
            timeout_ms: 1500,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    pub fn pipeline_policy(&self) -> PipelinePolicy {
        PipelinePolicy {
            check_reachability: self.capture.check_reachability,
            enforce_size_limit: self.capture.enforce_size_limit,
            max_message_size: self.capture.max_message_size,
        }
    }

    pub async fn load_or_create() -> Result<Self> {
        Self::load_or_create_at(&config_path()).await
    }

    /// Reads the config at `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub async fn load_or_create_at(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

        if exists {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
            let config: AppConfig = toml::from_str(&content)
                .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
            info!("Loaded config from {}", path.display());
            debug!("{:?}", config);
            return Ok(config);
        }

        warn!(
            "Config file {} does not exist, writing defaults",
            path.display()
        );
        let config = AppConfig::default();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(&config)
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

pub fn config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn default_output_dir() -> PathBuf {
    let mut path = dirs::picture_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(test: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("photolink-config-{}-{}", test, std::process::id()))
            .join(CONFIG_FILE)
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [broker]
            host = "broker.lan"

            [capture]
            enforce_size_limit = false
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "broker.lan");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.keep_alive_secs, 20);
        assert_eq!(config.topics, TopicConfig::default());
        assert_eq!(config.capture.max_message_size, 10 * 1024 * 1024);
        assert!(!config.pipeline_policy().enforce_size_limit);
        assert!(config.pipeline_policy().check_reachability);
        assert!(!config.capture.keep_files);
    }

    #[test]
    fn probe_does_not_follow_the_broker() {
        let config: AppConfig = toml::from_str(
            r#"
            [broker]
            host = "broker.lan"
            "#,
        )
        .unwrap();
        assert_eq!(config.probe.target, DEFAULT_PROBE_TARGET);

        let config: AppConfig = toml::from_str(
            r#"
            [probe]
            target = "192.168.1.1:80"
            "#,
        )
        .unwrap();
        assert_eq!(config.probe.target, "192.168.1.1:80");
        assert_eq!(config.probe.interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let path = scratch_file("create");
        let _ = tokio::fs::remove_file(&path).await;

        let created = AppConfig::load_or_create_at(&path).await.unwrap();
        assert_eq!(created, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_or_create_at(&path).await.unwrap();
        assert_eq!(reloaded, created);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn broken_file_is_an_error() {
        let path = scratch_file("broken");
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, "[broker\nport = ").await.unwrap();

        assert!(AppConfig::load_or_create_at(&path).await.is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
