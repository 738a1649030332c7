//! Message broker: admission, routing, the worker pool, retries and
//! dead-lettering.
//!
//! `publish` only validates and enqueues. Workers pull jobs from one shared
//! bounded queue; a job is either a freshly routed message (fanned out to
//! every subscriber snapshotted at publish time), a due retry, or an expiry
//! sweep. A failed delivery is parked until its backoff elapses and is owned
//! by exactly one job at a time, so no two workers ever run the same
//! (message, subscription) attempt.

pub mod dead_letter;
pub mod handler;
pub mod metrics;

pub use dead_letter::DeadLetterLog;
pub use handler::{handler_fn, DeliveryError, MessageHandler, Subscriber};
pub use metrics::{BrokerMetrics, MetricsExporter, MetricsSnapshot};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::models::{Delivery, Message, MAX_PRIORITY, UNROUTED};
use crate::shutdown::wait_for_shutdown;
use crate::store::{message_key, KvStore, MESSAGE_INDEX_KEY};

const MAX_CLOCK_SKEW_SECS: i64 = 5;
const SHUTDOWN_REASON: &str = "broker shutting down";
const EXPIRED_REASON: &str = "expired";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub worker_threads: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_message_size: usize,
    pub message_timeout: Duration,
    pub message_ttl: Duration,
    pub dead_letter_ttl: Duration,
    pub expiry_sweep_interval: Duration,
    pub enable_metrics: bool,
    pub metrics_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_capacity: 10_000,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            max_message_size: 1024 * 1024,
            message_timeout: Duration::from_secs(30),
            message_ttl: Duration::from_secs(3_600),
            dead_letter_ttl: Duration::from_secs(7 * 24 * 3_600),
            expiry_sweep_interval: Duration::from_secs(10),
            enable_metrics: true,
            metrics_interval: Duration::from_secs(30),
        }
    }
}

/// Synchronous rejection at publish time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("message is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("message expired before it could be routed")]
    Expired,

    #[error("broker queue is full")]
    QueueFull,

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("no route to {0}")]
    NoRoute(String),
}

impl PublishError {
    /// Rejections caused by the message itself rather than broker capacity.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PublishError::Invalid(_) | PublishError::TooLarge { .. } | PublishError::Expired
        )
    }
}

type DeliveryKey = (String, String);

struct DeliveryTask {
    message: Arc<Message>,
    subscriber: Subscriber,
    delivery: Delivery,
    enqueued_at: Instant,
    first_failed_at: Option<DateTime<Utc>>,
}

impl DeliveryTask {
    fn key(&self) -> DeliveryKey {
        (self.message.id.clone(), self.subscriber.id.clone())
    }
}

enum Job {
    Route {
        message: Arc<Message>,
        subscribers: Vec<Subscriber>,
        enqueued_at: Instant,
    },
    Retry(DeliveryKey),
    Sweep,
}

pub struct Broker {
    config: BrokerConfig,
    registry: Arc<AgentRegistry>,
    store: Option<Arc<dyn KvStore>>,
    subscriptions: RwLock<HashMap<String, Vec<Subscriber>>>,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: Mutex<mpsc::Receiver<Job>>,
    parked: StdMutex<HashMap<DeliveryKey, DeliveryTask>>,
    /// Ids admitted within the last `message_ttl`, with their release deadline.
    accepted_ids: StdMutex<HashMap<String, Instant>>,
    dead_letters: DeadLetterLog,
    metrics: BrokerMetrics,
    snapshot: RwLock<MetricsSnapshot>,
    exporter: MetricsExporter,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        registry: Arc<AgentRegistry>,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Arc<Self>, prometheus::Error> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let dead_letters = DeadLetterLog::new(store.clone(), config.dead_letter_ttl);

        Ok(Arc::new(Self {
            registry,
            store,
            subscriptions: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            parked: StdMutex::new(HashMap::new()),
            accepted_ids: StdMutex::new(HashMap::new()),
            dead_letters,
            metrics: BrokerMetrics::default(),
            snapshot: RwLock::new(MetricsSnapshot::default()),
            exporter: MetricsExporter::new()?,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Spawns the worker pool, the expiry sweeper and (if enabled) the metrics collector.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        for index in 0..self.config.worker_threads.max(1) {
            tasks.push(self.spawn_worker(index));
        }
        tasks.push(self.spawn_sweeper());
        if self.config.enable_metrics {
            tasks.push(self.spawn_metrics_collector());
        }
        info!(
            workers = self.config.worker_threads,
            queue_capacity = self.config.queue_capacity,
            persistence = self.store.is_some(),
            "Broker started"
        );
    }

    /// Stops accepting publishes, drains queued jobs and dead-letters parked retries.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Broker shutting down");

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        if tokio::time::timeout(DRAIN_TIMEOUT, join_all(handles))
            .await
            .is_err()
        {
            warn!("Broker tasks did not stop within the drain timeout");
        }

        let abandoned: Vec<DeliveryTask> = self.parked().drain().map(|(_, task)| task).collect();
        for task in abandoned {
            self.abandon_task(task).await;
        }
        info!("Broker stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.dead_letters
    }

    pub async fn publish(&self, message: Message) -> bool {
        self.try_publish(message).await.is_ok()
    }

    pub async fn try_publish(&self, message: Message) -> Result<(), PublishError> {
        if self.is_shutting_down() {
            return Err(PublishError::ShuttingDown);
        }

        let now = Utc::now();
        validate(&message, now)?;

        let size = serde_json::to_vec(&message)
            .map_err(|e| PublishError::Invalid(e.to_string()))?
            .len();
        if size > self.config.max_message_size {
            return Err(PublishError::TooLarge {
                size,
                limit: self.config.max_message_size,
            });
        }

        if message.is_expired_at(now) {
            let mut delivery = Delivery::first(&message.id, UNROUTED);
            delivery.mark_failed(EXPIRED_REASON);
            self.dead_letter(&message, delivery, EXPIRED_REASON, now)
                .await;
            return Err(PublishError::Expired);
        }

        self.admit_id(&message.id)?;

        let subscribers = self.resolve(&message).await;
        if subscribers.is_empty() {
            if !message.is_broadcast() {
                let target = message.route_key().to_string();
                let reason = format!("no route to {}", target);
                let mut delivery = Delivery::first(&message.id, UNROUTED);
                delivery.mark_failed(&reason);
                self.dead_letter(&message, delivery, reason, now).await;
                return Err(PublishError::NoRoute(target));
            }
            self.metrics.record_sent();
            self.persist(&message).await;
            debug!(
                message_id = %message.id,
                topic = %message.route_key(),
                "Broadcast has no subscribers"
            );
            return Ok(());
        }

        let message = Arc::new(message);
        let fan_out = subscribers.len();
        if let Err(e) = self.queue_tx.try_send(Job::Route {
            message: Arc::clone(&message),
            subscribers,
            enqueued_at: Instant::now(),
        }) {
            self.release_id(&message.id);
            return Err(match e {
                TrySendError::Full(_) => PublishError::QueueFull,
                TrySendError::Closed(_) => PublishError::ShuttingDown,
            });
        }

        self.metrics.record_sent();
        self.persist(&message).await;
        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            key = %message.route_key(),
            fan_out,
            "Message enqueued"
        );
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> String {
        self.add_subscriber(topic, None, handler).await
    }

    /// Subscribes a handler that delivers to `agent_id`.
    pub async fn subscribe_agent(
        &self,
        topic: &str,
        agent_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> String {
        self.add_subscriber(topic, Some(agent_id.to_string()), handler)
            .await
    }

    async fn add_subscriber(
        &self,
        topic: &str,
        owner: Option<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.subscriptions
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                topic: topic.to_string(),
                owner,
                handler,
            });
        debug!(topic, subscription_id = %id, "Subscribed");
        id
    }

    pub async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(list) = subscriptions.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != subscription_id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(topic);
        }
        removed
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Subscriptions not owned by an inactive agent.
    pub async fn active_subscriber_count(&self) -> usize {
        let subscribers: Vec<Subscriber> = self
            .subscriptions
            .read()
            .await
            .values()
            .flatten()
            .cloned()
            .collect();
        let mut count = 0;
        for subscriber in &subscribers {
            match &subscriber.owner {
                Some(owner) if !self.registry.is_active(owner).await => {}
                _ => count += 1,
            }
        }
        count
    }

    pub fn queue_depth(&self) -> usize {
        self.config
            .queue_capacity
            .max(1)
            .saturating_sub(self.queue_tx.capacity())
    }

    pub fn parked_count(&self) -> usize {
        self.parked().len()
    }

    pub async fn refresh_metrics(&self) -> MetricsSnapshot {
        let snapshot = self.metrics.snapshot(
            self.active_subscriber_count().await,
            self.registry.active_count().await,
            self.queue_depth(),
        );
        self.exporter.update(&snapshot);
        *self.snapshot.write().await = snapshot.clone();
        snapshot
    }

    /// Last snapshot computed by the collector.
    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.snapshot.read().await.clone()
    }

    pub fn render_metrics(&self) -> Result<String, prometheus::Error> {
        self.exporter.render()
    }

    /// Dead-letters every parked retry whose message has expired.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<DeliveryTask> = {
            let mut parked = self.parked();
            let keys: Vec<DeliveryKey> = parked
                .iter()
                .filter(|(_, task)| task.message.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| parked.remove(key)).collect()
        };

        let count = expired.len();
        for mut task in expired {
            task.delivery.mark_failed(EXPIRED_REASON);
            let first_failed_at = task.first_failed_at.unwrap_or(now);
            self.dead_letter(&task.message, task.delivery, EXPIRED_REASON, first_failed_at)
                .await;
        }
        if count > 0 {
            debug!(count, "Expiry sweep dead-lettered parked deliveries");
        }
        count
    }

    /// Forgets accepted ids whose `message_ttl` window has passed.
    pub fn prune_accepted_ids(&self) -> usize {
        let now = Instant::now();
        let mut accepted = self.accepted_ids();
        let before = accepted.len();
        accepted.retain(|_, deadline| *deadline > now);
        before - accepted.len()
    }

    fn admit_id(&self, id: &str) -> Result<(), PublishError> {
        let now = Instant::now();
        let mut accepted = self.accepted_ids();
        if accepted.get(id).is_some_and(|deadline| *deadline > now) {
            return Err(PublishError::Invalid("duplicate message id".into()));
        }
        accepted.insert(id.to_string(), now + self.config.message_ttl);
        Ok(())
    }

    fn release_id(&self, id: &str) {
        self.accepted_ids().remove(id);
    }

    async fn resolve(&self, message: &Message) -> Vec<Subscriber> {
        let candidates = self
            .subscriptions
            .read()
            .await
            .get(message.route_key())
            .cloned()
            .unwrap_or_default();
        if !message.is_broadcast() {
            return candidates;
        }

        let mut live = Vec::with_capacity(candidates.len());
        for subscriber in candidates {
            match &subscriber.owner {
                Some(owner) if !self.registry.is_active(owner).await => {
                    debug!(agent_id = %owner, "Skipping inactive agent for broadcast");
                }
                _ => live.push(subscriber),
            }
        }
        live
    }

    fn spawn_worker(self: &Arc<Self>, index: usize) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            debug!(worker = index, "Broker worker started");
            while let Some(job) = broker.next_job().await {
                broker.process(job).await;
            }
            debug!(worker = index, "Broker worker stopped");
        })
    }

    async fn next_job(&self) -> Option<Job> {
        let mut queue = self.queue_rx.lock().await;
        if !self.is_shutting_down() {
            tokio::select! {
                job = queue.recv() => return job,
                _ = wait_for_shutdown(self.shutdown_tx.subscribe()) => {}
            }
        }
        // Closing keeps already queued jobs receivable.
        queue.close();
        queue.try_recv().ok()
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.expiry_sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(TrySendError::Full(_)) = broker.queue_tx.try_send(Job::Sweep) {
                            debug!("Queue full, skipping expiry sweep");
                        }
                    }
                    _ = wait_for_shutdown(broker.shutdown_signal()) => break,
                }
            }
        })
    }

    fn spawn_metrics_collector(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.metrics_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        broker.refresh_metrics().await;
                    }
                    _ = wait_for_shutdown(broker.shutdown_signal()) => break,
                }
            }
        })
    }

    async fn process(self: &Arc<Self>, job: Job) {
        match job {
            Job::Route {
                message,
                subscribers,
                enqueued_at,
            } => {
                let attempts = subscribers.into_iter().map(|subscriber| {
                    self.attempt(DeliveryTask {
                        delivery: Delivery::first(&message.id, &subscriber.id),
                        message: Arc::clone(&message),
                        subscriber,
                        enqueued_at,
                        first_failed_at: None,
                    })
                });
                join_all(attempts).await;
            }
            Job::Retry(key) => {
                let task = self.parked().remove(&key);
                match task {
                    Some(task) => self.attempt(task).await,
                    None => debug!(message_id = %key.0, "Retry already resolved"),
                }
            }
            Job::Sweep => {
                self.sweep_expired(Utc::now()).await;
                self.prune_accepted_ids();
                self.dead_letters.prune().await;
            }
        }
    }

    async fn attempt(self: &Arc<Self>, mut task: DeliveryTask) {
        let now = Utc::now();
        if task.message.is_expired_at(now) {
            task.delivery.mark_failed(EXPIRED_REASON);
            let first_failed_at = task.first_failed_at.unwrap_or(now);
            self.dead_letter(&task.message, task.delivery, EXPIRED_REASON, first_failed_at)
                .await;
            return;
        }

        task.delivery.attempted_at = now;
        let handler = Arc::clone(&task.subscriber.handler);
        let outcome = tokio::time::timeout(
            self.config.message_timeout,
            AssertUnwindSafe(handler.handle(&task.message)).catch_unwind(),
        )
        .await;

        let error = match outcome {
            Ok(Ok(Ok(()))) => {
                task.delivery.mark_delivered();
                self.metrics.record_delivered(task.enqueued_at.elapsed());
                debug!(
                    message_id = %task.message.id,
                    subscription_id = %task.subscriber.id,
                    attempt = task.delivery.attempt,
                    "Delivered"
                );
                return;
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => DeliveryError::Panicked,
            Err(_) => DeliveryError::Timeout(self.config.message_timeout),
        };
        self.fail(task, error).await;
    }

    async fn fail(self: &Arc<Self>, mut task: DeliveryTask, error: DeliveryError) {
        self.metrics.record_failed();
        let reason = error.to_string();
        let first_failed_at = *task.first_failed_at.get_or_insert_with(Utc::now);
        task.delivery.mark_failed(&reason);

        if task.delivery.attempt > self.config.max_retries {
            let reason = format!(
                "max retries exceeded after {} attempts: {}",
                task.delivery.attempt, reason
            );
            self.dead_letter(&task.message, task.delivery, reason, first_failed_at)
                .await;
            return;
        }

        let delay = self.retry_delay(task.delivery.attempt);
        debug!(
            message_id = %task.message.id,
            subscription_id = %task.subscriber.id,
            attempt = task.delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Delivery failed, retry scheduled"
        );
        task.delivery = task.delivery.next_attempt();
        self.schedule_retry(task, delay);
    }

    fn schedule_retry(self: &Arc<Self>, task: DeliveryTask, delay: Duration) {
        let key = task.key();
        self.parked().insert(key.clone(), task);

        let broker = Arc::clone(self);
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if broker.queue_tx.send(Job::Retry(key.clone())).await.is_ok() {
                        return;
                    }
                }
                _ = wait_for_shutdown(shutdown) => {}
            }
            let task = broker.parked().remove(&key);
            if let Some(task) = task {
                broker.abandon_task(task).await;
            }
        });
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config
            .retry_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_retry_delay)
    }

    async fn abandon_task(&self, mut task: DeliveryTask) {
        task.delivery.mark_failed(SHUTDOWN_REASON);
        let first_failed_at = task.first_failed_at.unwrap_or_else(Utc::now);
        self.dead_letter(&task.message, task.delivery, SHUTDOWN_REASON, first_failed_at)
            .await;
    }

    async fn dead_letter(
        &self,
        message: &Message,
        delivery: Delivery,
        reason: impl Into<String>,
        first_failed_at: DateTime<Utc>,
    ) {
        self.metrics.record_dead_letter();
        self.dead_letters
            .append(message, delivery, reason, first_failed_at)
            .await;
    }

    async fn persist(&self, message: &Message) {
        let Some(store) = &self.store else {
            return;
        };
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, message_id = %message.id, "Failed to serialize message");
                return;
            }
        };
        if let Err(e) = store
            .set_with_expiry(&message_key(&message.id), &json, self.config.message_ttl)
            .await
        {
            warn!(error = %e, message_id = %message.id, "Failed to persist message");
            return;
        }
        if let Err(e) = store.list_push(MESSAGE_INDEX_KEY, &message.id).await {
            warn!(error = %e, message_id = %message.id, "Failed to index message");
        }
    }

    fn parked(&self) -> MutexGuard<'_, HashMap<DeliveryKey, DeliveryTask>> {
        self.parked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accepted_ids(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.accepted_ids.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate(message: &Message, now: DateTime<Utc>) -> Result<(), PublishError> {
    if message.id.trim().is_empty() {
        return Err(PublishError::Invalid("message id is empty".into()));
    }
    if message.sender.trim().is_empty() {
        return Err(PublishError::Invalid("sender is empty".into()));
    }
    if message
        .target
        .as_deref()
        .is_some_and(|target| target.trim().is_empty())
    {
        return Err(PublishError::Invalid("target is empty".into()));
    }
    if message.created_at > now + chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(PublishError::Invalid("created_at is in the future".into()));
    }
    if message.priority > MAX_PRIORITY {
        return Err(PublishError::Invalid(format!(
            "priority {} outside 0..={}",
            message.priority, MAX_PRIORITY
        )));
    }
    Ok(())
}
