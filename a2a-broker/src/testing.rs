//! Shared fixtures for unit tests.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{handler_fn, BrokerConfig, DeliveryError, MessageHandler};
use crate::models::Message;
use crate::transport::Transport;

pub fn fast_broker_config() -> BrokerConfig {
    BrokerConfig {
        worker_threads: 2,
        queue_capacity: 64,
        retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(40),
        message_timeout: Duration::from_millis(500),
        expiry_sweep_interval: Duration::from_millis(20),
        metrics_interval: Duration::from_millis(20),
        ..BrokerConfig::default()
    }
}

/// Polls `check` for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

pub fn counting_handler(hits: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
    handler_fn(move |_| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok::<(), DeliveryError>(())
        }
    })
}

pub fn failing_handler(hits: Arc<AtomicUsize>, reason: &'static str) -> Arc<dyn MessageHandler> {
    handler_fn(move |_| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Err::<(), DeliveryError>(DeliveryError::Handler(reason.to_string()))
        }
    })
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Message)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, endpoint: &str, message: &Message) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((endpoint.to_string(), message.clone()));
        Ok(())
    }
}
