//! Capability-tagged agent registry.
//!
//! Entries are never removed; liveness is a status flag driven by
//! heartbeats and the [`HeartbeatMonitor`](super::HeartbeatMonitor).

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{AgentDescriptor, AgentStatus, Capability};

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentDescriptor>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        name: impl Into<String>,
        capabilities: BTreeSet<Capability>,
        endpoint: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> AgentDescriptor {
        let now = Utc::now();
        let agent = AgentDescriptor {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            capabilities,
            endpoint,
            last_heartbeat: now,
            status: AgentStatus::Active,
            registered_at: now,
            metadata,
        };

        info!(agent_id = %agent.id, name = %agent.name, "Agent registered");
        self.agents
            .write()
            .await
            .insert(agent.id.clone(), agent.clone());
        agent
    }

    /// Refreshes the heartbeat. Unknown ids are ignored; returns whether the id was known.
    pub async fn heartbeat(&self, agent_id: &str) -> bool {
        self.heartbeat_at(agent_id, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            debug!(agent_id, "Heartbeat from unknown agent ignored");
            return false;
        };

        agent.last_heartbeat = now;
        if agent.status == AgentStatus::Inactive {
            agent.status = AgentStatus::Active;
            info!(agent_id, "Agent reactivated by heartbeat");
        }
        true
    }

    /// Active agents holding `capability`, ordered by id.
    pub async fn find_by_capability(&self, capability: Capability) -> Vec<AgentDescriptor> {
        let agents = self.agents.read().await;
        let mut found: Vec<AgentDescriptor> = agents
            .values()
            .filter(|a| a.is_active() && a.has_capability(capability))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Returns true only on an active -> inactive transition.
    pub async fn mark_inactive(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(agent) if agent.status == AgentStatus::Active => {
                agent.status = AgentStatus::Inactive;
                true
            }
            _ => false,
        }
    }

    /// Marks every active agent whose last heartbeat is at least `timeout` old.
    pub async fn mark_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<String> {
        let mut agents = self.agents.write().await;
        let mut demoted: Vec<String> = agents
            .values_mut()
            .filter(|a| a.is_active() && now - a.last_heartbeat >= timeout)
            .map(|a| {
                a.status = AgentStatus::Inactive;
                a.id.clone()
            })
            .collect();
        demoted.sort();
        demoted
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn is_active(&self, agent_id: &str) -> bool {
        self.agents
            .read()
            .await
            .get(agent_id)
            .is_some_and(AgentDescriptor::is_active)
    }

    /// All agents, oldest registration first.
    pub async fn list(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> = self.agents.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub async fn active_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_active())
            .count()
    }
}
