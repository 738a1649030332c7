//! Broker counters and the periodically recomputed snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};
use serde::Serialize;

/// Latency samples kept for the rolling average.
const LATENCY_WINDOW: usize = 1_000;

#[derive(Default)]
pub struct BrokerMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    latencies_ms: Mutex<VecDeque<f64>>,
}

impl BrokerMetrics {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, latency: Duration) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let mut latencies = self.latencies_ms.lock().unwrap_or_else(|e| e.into_inner());
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency.as_secs_f64() * 1_000.0);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        active_subscribers: usize,
        active_agents: usize,
        queue_depth: usize,
    ) -> MetricsSnapshot {
        let latencies = self.latencies_ms.lock().unwrap_or_else(|e| e.into_inner());
        let average_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        MetricsSnapshot {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            messages_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            active_subscribers,
            active_agents,
            queue_depth,
            average_latency_ms,
            updated_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub messages_dead_lettered: u64,
    pub active_subscribers: usize,
    pub active_agents: usize,
    pub queue_depth: usize,
    pub average_latency_ms: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Mirrors snapshots into a private prometheus registry.
pub struct MetricsExporter {
    registry: Registry,
    sent: IntGauge,
    received: IntGauge,
    failed: IntGauge,
    dead_lettered: IntGauge,
    active_subscribers: IntGauge,
    active_agents: IntGauge,
    queue_depth: IntGauge,
    average_latency_ms: Gauge,
}

impl MetricsExporter {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let int_gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let sent = int_gauge("a2a_messages_sent", "Messages accepted for routing")?;
        let received = int_gauge("a2a_messages_received", "Successful handler deliveries")?;
        let failed = int_gauge("a2a_messages_failed", "Failed delivery attempts")?;
        let dead_lettered = int_gauge("a2a_messages_dead_lettered", "Dead-letter entries")?;
        let active_subscribers = int_gauge("a2a_active_subscribers", "Live subscriptions")?;
        let active_agents = int_gauge("a2a_active_agents", "Agents with a fresh heartbeat")?;
        let queue_depth = int_gauge("a2a_queue_depth", "Jobs waiting in the broker queue")?;

        let average_latency_ms = Gauge::new(
            "a2a_average_latency_ms",
            "Rolling average publish-to-delivery latency",
        )?;
        registry.register(Box::new(average_latency_ms.clone()))?;

        Ok(Self {
            registry,
            sent,
            received,
            failed,
            dead_lettered,
            active_subscribers,
            active_agents,
            queue_depth,
            average_latency_ms,
        })
    }

    pub fn update(&self, snapshot: &MetricsSnapshot) {
        self.sent.set(clamp(snapshot.messages_sent));
        self.received.set(clamp(snapshot.messages_received));
        self.failed.set(clamp(snapshot.messages_failed));
        self.dead_lettered.set(clamp(snapshot.messages_dead_lettered));
        self.active_subscribers.set(clamp(snapshot.active_subscribers as u64));
        self.active_agents.set(clamp(snapshot.active_agents as u64));
        self.queue_depth.set(clamp(snapshot.queue_depth as u64));
        self.average_latency_ms.set(snapshot.average_latency_ms);
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
