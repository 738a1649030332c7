use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "A2A v1.0";

/// Id the server itself uses as sender and reply address.
pub const SERVER_AGENT_ID: &str = "a2a-server";

pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Subscription id recorded on deliveries that never reached a handler.
pub const UNROUTED: &str = "unrouted";

pub const SERVER_CAPABILITIES: [&str; 6] = [
    "handshake",
    "direct_routing",
    "topic_broadcast",
    "investigation_dispatch",
    "swarm_coordination",
    "dead_letter_queue",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('-', "_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Heartbeat,
    InvestigationRequest,
    InvestigationResponse,
    SwarmCoordination,
    ConsensusRequest,
    ConsensusResponse,
    Error,
    Shutdown,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::Handshake,
        MessageType::Heartbeat,
        MessageType::InvestigationRequest,
        MessageType::InvestigationResponse,
        MessageType::SwarmCoordination,
        MessageType::ConsensusRequest,
        MessageType::ConsensusResponse,
        MessageType::Error,
        MessageType::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Heartbeat => "heartbeat",
            MessageType::InvestigationRequest => "investigation_request",
            MessageType::InvestigationResponse => "investigation_response",
            MessageType::SwarmCoordination => "swarm_coordination",
            MessageType::ConsensusRequest => "consensus_request",
            MessageType::ConsensusResponse => "consensus_response",
            MessageType::Error => "error",
            MessageType::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = normalize(s);
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == key)
            .ok_or_else(|| UnknownVariant {
                kind: "message type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BlockchainAnalysis,
    WalletInvestigation,
    TransactionAnalysis,
    RiskAssessment,
    PatternDetection,
    ComplianceCheck,
    SwarmCoordination,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::BlockchainAnalysis,
        Capability::WalletInvestigation,
        Capability::TransactionAnalysis,
        Capability::RiskAssessment,
        Capability::PatternDetection,
        Capability::ComplianceCheck,
        Capability::SwarmCoordination,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::BlockchainAnalysis => "blockchain_analysis",
            Capability::WalletInvestigation => "wallet_investigation",
            Capability::TransactionAnalysis => "transaction_analysis",
            Capability::RiskAssessment => "risk_assessment",
            Capability::PatternDetection => "pattern_detection",
            Capability::ComplianceCheck => "compliance_check",
            Capability::SwarmCoordination => "swarm_coordination",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = normalize(s);
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == key)
            .ok_or_else(|| UnknownVariant {
                kind: "capability",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub endpoint: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentDescriptor {
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// A routed unit of communication. Never mutated after publish; retries
/// create new [`Delivery`] attempts that point back at `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: String,
    pub target: Option<String>,
    /// When set, `target` names a topic rather than an agent.
    #[serde(default)]
    pub broadcast: bool,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender: sender.into(),
            target: None,
            broadcast: false,
            payload,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            expires_at: None,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self.broadcast = false;
        self
    }

    pub fn on_topic(mut self, topic: impl Into<String>) -> Self {
        self.target = Some(topic.into());
        self.broadcast = true;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast || self.target.is_none()
    }

    /// Subscription key: the target agent, the named topic, or for an
    /// untargeted broadcast the message type's wire name.
    pub fn route_key(&self) -> &str {
        match &self.target {
            Some(target) => target,
            None => self.message_type.as_str(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub message_id: String,
    pub subscription_id: String,
    pub attempt: u32,
    pub state: DeliveryState,
    pub attempted_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Delivery {
    pub fn first(message_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.into(),
            subscription_id: subscription_id.into(),
            attempt: 1,
            state: DeliveryState::Pending,
            attempted_at: Utc::now(),
            delivered_at: None,
            failure_reason: None,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: self.message_id.clone(),
            subscription_id: self.subscription_id.clone(),
            attempt: self.attempt + 1,
            state: DeliveryState::Pending,
            attempted_at: Utc::now(),
            delivered_at: None,
            failure_reason: None,
        }
    }

    pub fn mark_delivered(&mut self) {
        self.state = DeliveryState::Delivered;
        self.delivered_at = Some(Utc::now());
        self.failure_reason = None;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = DeliveryState::Failed;
        self.failure_reason = Some(reason.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: Message,
    pub delivery: Delivery,
    pub reason: String,
    pub first_failed_at: DateTime<Utc>,
}

// API Request/Response models
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeRequest {
    pub agent_name: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct HandshakeResponse {
    pub agent_id: String,
    pub protocol_version: String,
    pub server_capabilities: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageRequest {
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub source_agent: Option<String>,
    pub target_agent: Option<String>,
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub broadcast: bool,
    pub priority: Option<u8>,
    pub ttl_seconds: Option<i64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvestigationRequest {
    pub address: Option<String>,
    pub analysis_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Processing,
    Error,
}

#[derive(Debug, Serialize)]
pub struct InvestigationDispatch {
    pub status: DispatchStatus,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SwarmResponse {
    pub status: String,
    pub coordination_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub protocol_version: String,
    pub server_name: String,
    pub message_type_count: usize,
    pub capability_count: usize,
}

#[derive(Debug, Serialize)]
pub struct AgentList {
    pub agents: Vec<AgentDescriptor>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterList {
    pub entries: Vec<DeadLetterEntry>,
    pub count: usize,
}
