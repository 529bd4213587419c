//! Network reachability as a cheap yes/no answer.
//!
//! [`NetworkProbe`] keeps a background task that periodically opens a TCP
//! connection to the probe target and stores the outcome; reading it never
//! blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

pub trait Reachability: Send + Sync + 'static {
    /// Best effort, must not block
    fn is_reachable(&self) -> bool;
}

pub struct NetworkProbe {
    reachable: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl NetworkProbe {
    /// Starts probing `target` (host:port). Reports unreachable until the
    /// first probe succeeded.
    pub fn spawn(target: String, every: Duration, probe_timeout: Duration) -> Self {
        let reachable = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        info!("Probing {} every {:?}", target, every);
        tokio::spawn(probe_loop(
            target,
            every,
            probe_timeout,
            reachable.clone(),
            shutdown.clone(),
        ));

        Self {
            reachable,
            shutdown,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::spawn(
            config.probe.target.clone(),
            config.probe.interval(),
            config.probe.timeout(),
        )
    }
}

impl Reachability for NetworkProbe {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

impl Drop for NetworkProbe {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn probe_loop(
    target: String,
    every: Duration,
    probe_timeout: Duration,
    reachable: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Network probe for {} stopped", target);
                return;
            }
            _ = ticks.tick() => {
                let now = probe(&target, probe_timeout).await;
                let before = reachable.swap(now, Ordering::SeqCst);
                if before != now {
                    if now {
                        info!("{} is reachable", target);
                    } else {
                        warn!("{} is unreachable", target);
                    }
                }
            }
        }
    }
}

async fn probe(target: &str, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe of {} failed: {}", target, e);
            false
        }
        Err(_) => {
            debug!("Probe of {} timed out after {:?}", target, probe_timeout);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn wait_for(probe: &NetworkProbe, expected: bool) -> bool {
        timeout(Duration::from_secs(3), async {
            while probe.is_reachable() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn listening_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let probe = NetworkProbe::spawn(
            target,
            Duration::from_millis(50),
            Duration::from_millis(500),
        );
        assert!(wait_for(&probe, true).await);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = NetworkProbe::spawn(
            target,
            Duration::from_millis(50),
            Duration::from_millis(500),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!probe.is_reachable());
    }
}
