//! Delivery to agents living outside this process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::agents::AgentRegistry;
use crate::broker::{DeliveryError, MessageHandler};
use crate::models::Message;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &str, message: &Message) -> Result<(), DeliveryError>;
}

/// POSTs the message JSON to the agent's endpoint.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, message: &Message) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(endpoint, message_id = %message.id, "Delivered over HTTP");
            Ok(())
        } else {
            Err(DeliveryError::Transport(format!(
                "{} responded with {}",
                endpoint, status
            )))
        }
    }
}

/// Broker handler bound to one registered agent's endpoint.
pub struct TransportHandler {
    agent_id: String,
    endpoint: String,
    transport: Arc<dyn Transport>,
    registry: Arc<AgentRegistry>,
}

impl TransportHandler {
    pub fn new(
        agent_id: impl Into<String>,
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            endpoint: endpoint.into(),
            transport,
            registry,
        }
    }
}

#[async_trait]
impl MessageHandler for TransportHandler {
    async fn handle(&self, message: &Message) -> Result<(), DeliveryError> {
        if !self.registry.is_active(&self.agent_id).await {
            return Err(DeliveryError::AgentInactive(self.agent_id.clone()));
        }
        self.transport.send(&self.endpoint, message).await
    }
}
