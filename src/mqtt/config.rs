use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings. Timeouts are transport configuration only,
/// the connection manager never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    /// Capacity of the rumqttc request channel
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 20,
            connect_timeout_secs: 10,
            publish_timeout_secs: 30,
            request_capacity: 16,
        }
    }
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        // rumqttc rejects keep-alive intervals below 5 seconds
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

/// Reconnect backoff applied after a connection-lost notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive short-lived sessions tolerated before giving up
    pub max_attempts: u32,
    /// A session that lived at least this long resets the loss streak
    pub stable_after_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            stable_after_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_is_clamped() {
        let config = BrokerConfig {
            keep_alive_secs: 1,
            ..BrokerConfig::default()
        };
        assert_eq!(config.keep_alive(), Duration::from_secs(5));
        assert_eq!(BrokerConfig::default().address(), "localhost:1883");
    }
}
