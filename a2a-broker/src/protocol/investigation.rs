//! Investigation dispatch bookkeeping, keyed by correlation id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::broker::{DeliveryError, MessageHandler};
use crate::models::{Message, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationState {
    Submitted,
    RoutedToCoordinator,
    AwaitingResponse,
    FailedNoCoordinator,
    Failed,
    Completed,
}

impl InvestigationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvestigationState::Completed
                | InvestigationState::Failed
                | InvestigationState::FailedNoCoordinator
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvestigationRecord {
    pub request_id: String,
    pub address: String,
    pub analysis_type: String,
    pub state: InvestigationState,
    pub coordinator_id: Option<String>,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upper bound on tracked investigations; the least recently updated go first.
pub const MAX_TRACKED_INVESTIGATIONS: usize = 10_000;

pub struct InvestigationTracker {
    records: RwLock<HashMap<String, InvestigationRecord>>,
    retention: chrono::Duration,
    capacity: usize,
}

impl InvestigationTracker {
    /// Records untouched for longer than `retention` are dropped on the next submit.
    pub fn new(retention: Duration) -> Self {
        Self::with_capacity(retention, MAX_TRACKED_INVESTIGATIONS)
    }

    pub fn with_capacity(retention: Duration, capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            capacity: capacity.max(1),
        }
    }

    pub async fn submit(&self, request_id: &str, address: &str, analysis_type: &str) {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let cutoff = now - self.retention;
        records.retain(|_, record| record.updated_at > cutoff);
        while records.len() >= self.capacity {
            let oldest = records
                .values()
                .min_by_key(|record| record.updated_at)
                .map(|record| record.request_id.clone());
            match oldest {
                Some(id) => {
                    records.remove(&id);
                }
                None => break,
            }
        }
        records.insert(
            request_id.to_string(),
            InvestigationRecord {
                request_id: request_id.to_string(),
                address: address.to_string(),
                analysis_type: analysis_type.to_string(),
                state: InvestigationState::Submitted,
                coordinator_id: None,
                response: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub async fn routed(&self, request_id: &str, coordinator_id: &str) -> bool {
        self.update(request_id, |record| {
            if record.state != InvestigationState::Submitted {
                return false;
            }
            record.state = InvestigationState::RoutedToCoordinator;
            record.coordinator_id = Some(coordinator_id.to_string());
            true
        })
        .await
    }

    /// Only a freshly routed request moves on; a response that already
    /// completed it is left alone.
    pub async fn awaiting_response(&self, request_id: &str) -> bool {
        self.update(request_id, |record| {
            if record.state != InvestigationState::RoutedToCoordinator {
                return false;
            }
            record.state = InvestigationState::AwaitingResponse;
            true
        })
        .await
    }

    pub async fn failed(&self, request_id: &str, state: InvestigationState, error: &str) -> bool {
        self.update(request_id, |record| {
            if record.state.is_terminal() {
                return false;
            }
            record.state = state;
            record.error = Some(error.to_string());
            true
        })
        .await
    }

    /// Matches a coordinator response; returns false for unknown or finished requests.
    pub async fn complete(&self, request_id: &str, response: serde_json::Value) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(request_id) {
            Some(record)
                if matches!(
                    record.state,
                    InvestigationState::AwaitingResponse | InvestigationState::RoutedToCoordinator
                ) =>
            {
                record.state = InvestigationState::Completed;
                record.response = Some(response);
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, request_id: &str) -> Option<InvestigationRecord> {
        self.records.read().await.get(request_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    async fn update(
        &self,
        request_id: &str,
        apply: impl FnOnce(&mut InvestigationRecord) -> bool,
    ) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(request_id) else {
            return false;
        };
        let changed = apply(record);
        if changed {
            record.updated_at = Utc::now();
        }
        changed
    }
}

/// Handler subscribed under the server's own id; folds coordinator
/// responses back into the tracker.
pub struct ResponseCollector {
    tracker: Arc<InvestigationTracker>,
}

impl ResponseCollector {
    pub fn new(tracker: Arc<InvestigationTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl MessageHandler for ResponseCollector {
    async fn handle(&self, message: &Message) -> Result<(), DeliveryError> {
        if message.message_type != MessageType::InvestigationResponse {
            debug!(message_type = %message.message_type, "Ignoring message addressed to server");
            return Ok(());
        }
        let Some(request_id) = message.correlation_id.as_deref() else {
            debug!(message_id = %message.id, "Investigation response without correlation id");
            return Ok(());
        };
        if self.tracker.complete(request_id, message.payload.clone()).await {
            info!(request_id, coordinator = %message.sender, "Investigation completed");
        } else {
            debug!(request_id, "Unmatched investigation response");
        }
        Ok(())
    }
}
