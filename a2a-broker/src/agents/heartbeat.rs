use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::AgentRegistry;
use crate::shutdown::wait_for_shutdown;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(300),
        }
    }
}

/// Periodically demotes agents whose heartbeat has gone stale.
pub struct HeartbeatMonitor {
    registry: Arc<AgentRegistry>,
    config: RegistryConfig,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<AgentRegistry>, config: RegistryConfig) -> Self {
        Self { registry, config }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let demoted = self.registry.mark_stale(now, timeout).await;
        for agent_id in &demoted {
            warn!(
                agent_id = %agent_id,
                timeout_secs = self.config.heartbeat_timeout.as_secs(),
                "Agent heartbeat timed out, marked inactive"
            );
        }
        demoted
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Utc::now()).await;
                    }
                    _ = wait_for_shutdown(shutdown.clone()) => break,
                }
            }
            debug!("Heartbeat monitor stopped");
        })
    }
}
