//! Append-only record of messages that could not be delivered.
//!
//! Entries live for the dead-letter TTL and the log holds at most
//! `capacity` of them, oldest dropped first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use crate::models::{DeadLetterEntry, Delivery, Message};
use crate::store::{dead_letter_key, KvStore, DEAD_LETTER_INDEX_KEY};

const UNKNOWN_REASON: &str = "unknown failure";
pub const MAX_DEAD_LETTERS: usize = 10_000;

struct Recorded {
    at: Instant,
    entry: DeadLetterEntry,
}

pub struct DeadLetterLog {
    entries: RwLock<VecDeque<Recorded>>,
    store: Option<Arc<dyn KvStore>>,
    ttl: Duration,
    capacity: usize,
}

impl DeadLetterLog {
    pub fn new(store: Option<Arc<dyn KvStore>>, ttl: Duration) -> Self {
        Self::with_capacity(store, ttl, MAX_DEAD_LETTERS)
    }

    pub fn with_capacity(store: Option<Arc<dyn KvStore>>, ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            store,
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub async fn append(
        &self,
        message: &Message,
        delivery: Delivery,
        reason: impl Into<String>,
        first_failed_at: DateTime<Utc>,
    ) {
        let mut reason = reason.into();
        if reason.trim().is_empty() {
            reason = UNKNOWN_REASON.to_string();
        }

        warn!(
            message_id = %message.id,
            subscription_id = %delivery.subscription_id,
            attempt = delivery.attempt,
            reason = %reason,
            "Message dead-lettered"
        );

        let entry = DeadLetterEntry {
            message: message.clone(),
            delivery,
            reason,
            first_failed_at,
        };

        if let Some(store) = &self.store {
            self.persist(store.as_ref(), &entry).await;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        self.drop_expired(&mut entries, now);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Recorded { at: now, entry });
    }

    /// Drops entries older than the TTL; returns how many went.
    pub async fn prune(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        self.drop_expired(&mut entries, Instant::now());
        before - entries.len()
    }

    fn drop_expired(&self, entries: &mut VecDeque<Recorded>, now: Instant) {
        while entries
            .front()
            .is_some_and(|recorded| now.duration_since(recorded.at) >= self.ttl)
        {
            entries.pop_front();
        }
    }

    fn is_live(&self, recorded: &Recorded, now: Instant) -> bool {
        now.duration_since(recorded.at) < self.ttl
    }

    async fn persist(&self, store: &dyn KvStore, entry: &DeadLetterEntry) {
        let key = dead_letter_key(&entry.message.id, &entry.delivery.subscription_id);
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize dead-letter entry");
                return;
            }
        };
        if let Err(e) = store.set_with_expiry(&key, &json, self.ttl).await {
            warn!(error = %e, key = %key, "Failed to persist dead-letter entry");
            return;
        }
        if let Err(e) = store.list_push(DEAD_LETTER_INDEX_KEY, &key).await {
            warn!(error = %e, key = %key, "Failed to index dead-letter entry");
        }
    }

    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| self.is_live(r, now))
            .map(|r| r.entry.clone())
            .collect()
    }

    pub async fn for_message(&self, message_id: &str) -> Vec<DeadLetterEntry> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| self.is_live(r, now) && r.entry.message.id == message_id)
            .map(|r| r.entry.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| self.is_live(r, now))
            .count()
    }
}
