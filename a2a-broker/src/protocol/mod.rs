//! Protocol server: the verbs agents and operators call, wrapping the
//! registry and the broker.

pub mod investigation;

pub use investigation::{InvestigationRecord, InvestigationState, InvestigationTracker};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{AgentRegistry, HeartbeatMonitor, RegistryConfig};
use crate::broker::{Broker, BrokerConfig, MessageHandler, MetricsSnapshot, PublishError};
use crate::models::{
    AgentDescriptor, AgentList, Capability, DeadLetterList, DispatchStatus, HandshakeRequest,
    HandshakeResponse, HealthReport, InvestigationDispatch, Message, MessageRequest, MessageType,
    SwarmResponse, UnknownVariant, PROTOCOL_VERSION, SERVER_AGENT_ID, SERVER_CAPABILITIES,
};
use crate::store::KvStore;
use crate::transport::{Transport, TransportHandler};
use investigation::ResponseCollector;

const DEFAULT_ANALYSIS_TYPE: &str = "comprehensive";
const NO_COORDINATOR: &str = "no active swarm coordinator available";
const NO_REACHABLE_COORDINATOR: &str = "no reachable swarm coordinator available";
/// Caller-supplied TTLs are clamped to a century.
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 3_600;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Unknown(#[from] UnknownVariant),

    #[error("message rejected: {0}")]
    Rejected(#[from] PublishError),
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub server_name: String,
    pub broker: BrokerConfig,
    pub registry: RegistryConfig,
}

pub struct ProtocolServer {
    server_name: String,
    registry: Arc<AgentRegistry>,
    broker: Arc<Broker>,
    transport: Option<Arc<dyn Transport>>,
    investigations: Arc<InvestigationTracker>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolServer {
    /// Builds the registry and broker and spawns every background task.
    pub async fn start(
        settings: ServerSettings,
        store: Option<Arc<dyn KvStore>>,
        transport: Option<Arc<dyn Transport>>,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = Arc::new(AgentRegistry::new());
        let investigations = Arc::new(InvestigationTracker::new(settings.broker.dead_letter_ttl));
        let broker = Broker::new(settings.broker, Arc::clone(&registry), store)?;

        let collector: Arc<dyn MessageHandler> =
            Arc::new(ResponseCollector::new(Arc::clone(&investigations)));
        broker.subscribe(SERVER_AGENT_ID, collector).await;
        broker.start().await;

        let monitor = HeartbeatMonitor::new(Arc::clone(&registry), settings.registry)
            .spawn(broker.shutdown_signal());

        info!(server_name = %settings.server_name, version = PROTOCOL_VERSION, "Protocol server started");
        Ok(Arc::new(Self {
            server_name: settings.server_name,
            registry,
            broker,
            transport,
            investigations,
            monitor: Mutex::new(Some(monitor)),
        }))
    }

    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
        if let Some(monitor) = self.monitor.lock().await.take() {
            if let Err(e) = monitor.await {
                warn!(error = %e, "Heartbeat monitor ended abnormally");
            }
        }
        info!("Protocol server stopped");
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub async fn handshake(
        &self,
        request: HandshakeRequest,
    ) -> Result<HandshakeResponse, ProtocolError> {
        let name = required(request.agent_name.as_deref(), "agent_name")?;
        let raw = request
            .capabilities
            .as_deref()
            .filter(|caps| !caps.is_empty())
            .ok_or(ProtocolError::MissingField("capabilities"))?;
        let capabilities = raw
            .iter()
            .map(|c| c.parse::<Capability>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        let endpoint = request
            .endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());

        let agent = self
            .registry
            .register(name, capabilities, endpoint, request.metadata)
            .await;

        let transport = match (&agent.endpoint, &self.transport) {
            (Some(endpoint), Some(transport)) => {
                let handler: Arc<dyn MessageHandler> = Arc::new(TransportHandler::new(
                    &agent.id,
                    endpoint,
                    Arc::clone(transport),
                    Arc::clone(&self.registry),
                ));
                self.broker
                    .subscribe_agent(&agent.id, &agent.id, Arc::clone(&handler))
                    .await;
                Some(handler)
            }
            _ => None,
        };

        self.announce(&agent).await;

        // Subscribed after the announcement so an agent never greets itself.
        if let Some(handler) = transport {
            self.broker
                .subscribe_agent(MessageType::Handshake.as_str(), &agent.id, handler)
                .await;
        }

        Ok(HandshakeResponse {
            agent_id: agent.id,
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_capabilities: SERVER_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Best effort: a rejected announcement never fails the handshake.
    async fn announce(&self, agent: &AgentDescriptor) {
        let announcement = Message::new(
            MessageType::Handshake,
            SERVER_AGENT_ID,
            json!({
                "agent_id": agent.id,
                "agent_name": agent.name,
                "capabilities": agent.capabilities,
                "endpoint": agent.endpoint,
            }),
        );
        if let Err(e) = self.broker.try_publish(announcement).await {
            debug!(agent_id = %agent.id, error = %e, "Handshake announcement not published");
        }
    }

    pub async fn heartbeat(&self, agent_id: &str) -> bool {
        self.registry.heartbeat(agent_id).await
    }

    /// Accepted means enqueued; delivery outcomes only show up in metrics
    /// and the dead-letter log.
    pub async fn submit_message(&self, request: MessageRequest) -> Result<(), ProtocolError> {
        let message_type = required(request.message_type.as_deref(), "type")?
            .parse::<MessageType>()?;
        let sender = required(request.source_agent.as_deref(), "source_agent")?;
        let payload = request
            .payload
            .ok_or(ProtocolError::MissingField("payload"))?;
        let target = request
            .target_agent
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let mut message = Message::new(message_type, sender, payload);
        message = match (target, request.broadcast) {
            (Some(topic), true) => message.on_topic(topic),
            (Some(target), false) => message.to(target),
            (None, _) => message,
        };
        if let Some(priority) = request.priority {
            message = message.with_priority(priority);
        }
        if let Some(ttl) = request.ttl_seconds {
            message = message.with_ttl(chrono::Duration::seconds(ttl.clamp(-MAX_TTL_SECS, MAX_TTL_SECS)));
        }
        if let Some(correlation_id) = request.correlation_id {
            message = message.with_correlation_id(correlation_id);
        }
        if let Some(reply_to) = request.reply_to {
            message = message.with_reply_to(reply_to);
        }

        let sender = message.sender.clone();
        self.broker.try_publish(message).await?;
        if message_type == MessageType::Heartbeat {
            self.registry.heartbeat(&sender).await;
        }
        Ok(())
    }

    pub async fn dispatch_investigation(
        &self,
        address: &str,
        analysis_type: Option<&str>,
    ) -> Result<InvestigationDispatch, ProtocolError> {
        let address = required(Some(address), "address")?;
        let analysis_type = analysis_type
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_ANALYSIS_TYPE);

        let request_id = Uuid::new_v4().to_string();
        self.investigations
            .submit(&request_id, address, analysis_type)
            .await;

        let coordinators = self
            .registry
            .find_by_capability(Capability::SwarmCoordination)
            .await;
        let any_coordinator = !coordinators.is_empty();
        let mut coordinator = None;
        for candidate in coordinators {
            if self.broker.subscriber_count(&candidate.id).await > 0 {
                coordinator = Some(candidate);
                break;
            }
            debug!(agent_id = %candidate.id, "Skipping coordinator without a delivery route");
        }
        let Some(coordinator) = coordinator else {
            let reason = if any_coordinator {
                NO_REACHABLE_COORDINATOR
            } else {
                NO_COORDINATOR
            };
            warn!(
                request_id = %request_id,
                address,
                reason,
                "No swarm coordinator for investigation"
            );
            self.investigations
                .failed(&request_id, InvestigationState::FailedNoCoordinator, reason)
                .await;
            return Ok(InvestigationDispatch {
                status: DispatchStatus::Error,
                request_id,
                coordinator_id: None,
                error: Some(reason.to_string()),
            });
        };

        let message = Message::new(
            MessageType::InvestigationRequest,
            SERVER_AGENT_ID,
            json!({
                "request_id": request_id,
                "address": address,
                "analysis_type": analysis_type,
                "require_consensus": true,
            }),
        )
        .to(&coordinator.id)
        .with_correlation_id(&request_id)
        .with_reply_to(SERVER_AGENT_ID);

        self.investigations
            .routed(&request_id, &coordinator.id)
            .await;
        // Marked before publishing so a fast response is never overwritten.
        self.investigations.awaiting_response(&request_id).await;
        if let Err(e) = self.broker.try_publish(message).await {
            warn!(request_id = %request_id, error = %e, "Investigation request rejected");
            self.investigations
                .failed(&request_id, InvestigationState::Failed, &e.to_string())
                .await;
            return Ok(InvestigationDispatch {
                status: DispatchStatus::Error,
                request_id,
                coordinator_id: Some(coordinator.id),
                error: Some(e.to_string()),
            });
        }

        info!(
            request_id = %request_id,
            coordinator = %coordinator.id,
            address,
            analysis_type,
            "Investigation dispatched"
        );
        Ok(InvestigationDispatch {
            status: DispatchStatus::Processing,
            request_id,
            coordinator_id: Some(coordinator.id),
            error: None,
        })
    }

    pub async fn coordinate_swarm(&self, request: Value) -> Result<SwarmResponse, ProtocolError> {
        let coordination_id = Uuid::new_v4().to_string();
        let message = Message::new(
            MessageType::SwarmCoordination,
            SERVER_AGENT_ID,
            json!({
                "coordination_id": coordination_id,
                "request": request,
            }),
        )
        .with_correlation_id(&coordination_id);
        self.broker.try_publish(message).await?;

        info!(coordination_id = %coordination_id, "Swarm coordination broadcast");
        Ok(SwarmResponse {
            status: "success".to_string(),
            coordination_id,
        })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "operational".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_name: self.server_name.clone(),
            message_type_count: MessageType::ALL.len(),
            capability_count: Capability::ALL.len(),
        }
    }

    pub async fn agents(&self, capability: Option<Capability>) -> AgentList {
        let agents = match capability {
            Some(capability) => self.registry.find_by_capability(capability).await,
            None => self.registry.list().await,
        };
        AgentList {
            count: agents.len(),
            agents,
        }
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.registry.get(agent_id).await
    }

    pub async fn investigation(&self, request_id: &str) -> Option<InvestigationRecord> {
        self.investigations.get(request_id).await
    }

    pub async fn dead_letters(&self) -> DeadLetterList {
        let entries = self.broker.dead_letters().entries().await;
        DeadLetterList {
            count: entries.len(),
            entries,
        }
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.broker.metrics_snapshot().await
    }

    pub fn metrics_text(&self) -> Result<String, prometheus::Error> {
        self.broker.render_metrics()
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, ProtocolError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ProtocolError::MissingField(field))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::testing::{counting_handler, eventually, fast_broker_config, RecordingTransport};

    async fn server() -> (Arc<ProtocolServer>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let settings = ServerSettings {
            server_name: "test-broker".to_string(),
            broker: fast_broker_config(),
            registry: RegistryConfig::default(),
        };
        let shared: Arc<dyn Transport> = transport.clone();
        let server = ProtocolServer::start(settings, None, Some(shared))
            .await
            .unwrap();
        (server, transport)
    }

    fn handshake_request(name: &str, caps: &[&str], endpoint: Option<&str>) -> HandshakeRequest {
        HandshakeRequest {
            agent_name: Some(name.to_string()),
            capabilities: Some(caps.iter().map(|c| c.to_string()).collect()),
            endpoint: endpoint.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn handshake_registers_and_reports_protocol() {
        let (server, _) = server().await;
        let response = server
            .handshake(handshake_request("scanner", &["blockchain_analysis"], None))
            .await
            .unwrap();

        assert_eq!(response.protocol_version, PROTOCOL_VERSION);
        assert!(response
            .server_capabilities
            .contains(&"investigation_dispatch".to_string()));
        let agent = server.agent(&response.agent_id).await.unwrap();
        assert_eq!(agent.name, "scanner");
        assert!(agent.is_active());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn handshake_fails_closed_on_bad_capabilities() {
        let (server, _) = server().await;

        let missing_name = HandshakeRequest {
            capabilities: Some(vec!["risk_assessment".into()]),
            ..Default::default()
        };
        assert!(matches!(
            server.handshake(missing_name).await,
            Err(ProtocolError::MissingField("agent_name"))
        ));
        assert!(matches!(
            server.handshake(handshake_request("a", &[], None)).await,
            Err(ProtocolError::MissingField("capabilities"))
        ));
        assert!(matches!(
            server
                .handshake(handshake_request("a", &["risk_assessment", "telepathy"], None))
                .await,
            Err(ProtocolError::Unknown(_))
        ));
        assert_eq!(server.agents(None).await.count, 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn handshake_is_announced_to_existing_agents_only() {
        let (server, transport) = server().await;
        let first = server
            .handshake(handshake_request(
                "first",
                &["pattern_detection"],
                Some("http://first.local/a2a"),
            ))
            .await
            .unwrap();
        let second = server
            .handshake(handshake_request(
                "second",
                &["risk_assessment"],
                Some("http://second.local/a2a"),
            ))
            .await
            .unwrap();

        eventually(|| async {
            transport
                .sent()
                .iter()
                .any(|(_, m)| m.payload["agent_id"] == second.agent_id.as_str())
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = transport.sent();
        assert!(sent
            .iter()
            .all(|(endpoint, _)| endpoint == "http://first.local/a2a"));
        assert!(sent
            .iter()
            .all(|(_, m)| m.message_type == MessageType::Handshake));
        assert!(!sent
            .iter()
            .any(|(_, m)| m.payload["agent_id"] == first.agent_id.as_str()));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn investigation_goes_to_the_coordinator() {
        let (server, transport) = server().await;
        let coordinator = server
            .handshake(handshake_request(
                "coord-1",
                &["swarm_coordination"],
                Some("http://coord.local/a2a"),
            ))
            .await
            .unwrap();

        let dispatch = server
            .dispatch_investigation("Addr123", None)
            .await
            .unwrap();
        assert_eq!(dispatch.status, DispatchStatus::Processing);
        assert_eq!(dispatch.coordinator_id.as_deref(), Some(coordinator.agent_id.as_str()));

        eventually(|| async {
            transport
                .sent()
                .iter()
                .any(|(_, m)| m.message_type == MessageType::InvestigationRequest)
        })
        .await;
        let (endpoint, request) = transport
            .sent()
            .into_iter()
            .find(|(_, m)| m.message_type == MessageType::InvestigationRequest)
            .unwrap();
        assert_eq!(endpoint, "http://coord.local/a2a");
        assert_eq!(request.target.as_deref(), Some(coordinator.agent_id.as_str()));
        assert_eq!(request.payload["require_consensus"], true);
        assert_eq!(request.payload["address"], "Addr123");
        assert_eq!(request.payload["analysis_type"], DEFAULT_ANALYSIS_TYPE);
        assert_eq!(request.correlation_id.as_deref(), Some(dispatch.request_id.as_str()));
        assert_eq!(request.reply_to.as_deref(), Some(SERVER_AGENT_ID));

        let record = server.investigation(&dispatch.request_id).await.unwrap();
        assert_eq!(record.state, InvestigationState::AwaitingResponse);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn investigation_without_coordinator_errors_immediately() {
        let (server, _) = server().await;
        server
            .handshake(handshake_request("scanner", &["blockchain_analysis"], None))
            .await
            .unwrap();
        let sent_before = server.broker().refresh_metrics().await.messages_sent;

        let dispatch = server
            .dispatch_investigation("Addr123", Some("quick"))
            .await
            .unwrap();
        assert_eq!(dispatch.status, DispatchStatus::Error);
        assert!(dispatch.coordinator_id.is_none());

        let snapshot = server.broker().refresh_metrics().await;
        assert_eq!(snapshot.messages_sent, sent_before);
        assert_eq!(server.broker().queue_depth(), 0);
        let record = server.investigation(&dispatch.request_id).await.unwrap();
        assert_eq!(record.state, InvestigationState::FailedNoCoordinator);
        assert_eq!(record.analysis_type, "quick");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn investigation_skips_coordinator_without_endpoint() {
        let (server, transport) = server().await;
        let unreachable = server
            .handshake(handshake_request("coord-0", &["swarm_coordination"], None))
            .await
            .unwrap();

        let dispatch = server
            .dispatch_investigation("Addr123", None)
            .await
            .unwrap();
        assert_eq!(dispatch.status, DispatchStatus::Error);
        assert_eq!(dispatch.error.as_deref(), Some(NO_REACHABLE_COORDINATOR));
        let record = server.investigation(&dispatch.request_id).await.unwrap();
        assert_eq!(record.state, InvestigationState::FailedNoCoordinator);
        assert!(server
            .broker()
            .dead_letters()
            .entries()
            .await
            .iter()
            .all(|e| e.message.target.as_deref() != Some(unreachable.agent_id.as_str())));

        let reachable = server
            .handshake(handshake_request(
                "coord-1",
                &["swarm_coordination"],
                Some("http://coord.local/a2a"),
            ))
            .await
            .unwrap();
        let dispatch = server
            .dispatch_investigation("Addr123", None)
            .await
            .unwrap();
        assert_eq!(dispatch.status, DispatchStatus::Processing);
        assert_eq!(dispatch.coordinator_id.as_deref(), Some(reachable.agent_id.as_str()));
        eventually(|| async {
            transport
                .sent()
                .iter()
                .any(|(_, m)| m.message_type == MessageType::InvestigationRequest)
        })
        .await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn investigation_without_transport_is_not_left_processing() {
        let server = ProtocolServer::start(
            ServerSettings {
                server_name: "test-broker".to_string(),
                broker: fast_broker_config(),
                registry: RegistryConfig::default(),
            },
            None,
            None,
        )
        .await
        .unwrap();
        server
            .handshake(handshake_request(
                "coord-1",
                &["swarm_coordination"],
                Some("http://coord.local/a2a"),
            ))
            .await
            .unwrap();

        let dispatch = server
            .dispatch_investigation("Addr123", None)
            .await
            .unwrap();
        assert_eq!(dispatch.status, DispatchStatus::Error);
        let record = server.investigation(&dispatch.request_id).await.unwrap();
        assert_ne!(record.state, InvestigationState::AwaitingResponse);
        assert!(record.state.is_terminal());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn investigation_requires_address() {
        let (server, _) = server().await;
        assert!(matches!(
            server.dispatch_investigation("  ", None).await,
            Err(ProtocolError::MissingField("address"))
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn coordinator_response_completes_investigation() {
        let (server, _) = server().await;
        server
            .handshake(handshake_request(
                "coord-1",
                &["swarm_coordination"],
                Some("http://coord.local/a2a"),
            ))
            .await
            .unwrap();
        let dispatch = server
            .dispatch_investigation("Addr123", None)
            .await
            .unwrap();

        server
            .submit_message(MessageRequest {
                message_type: Some("investigation_response".into()),
                source_agent: Some("coord-1".into()),
                target_agent: Some(SERVER_AGENT_ID.into()),
                payload: Some(json!({"risk_score": 12})),
                correlation_id: Some(dispatch.request_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        let request_id = dispatch.request_id.clone();
        eventually(|| async {
            server
                .investigation(&request_id)
                .await
                .is_some_and(|r| r.state == InvestigationState::Completed)
        })
        .await;
        let record = server.investigation(&request_id).await.unwrap();
        assert_eq!(record.response, Some(json!({"risk_score": 12})));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn submit_message_validates_shape() {
        let (server, _) = server().await;
        let missing_sender = MessageRequest {
            message_type: Some("heartbeat".into()),
            payload: Some(json!({})),
            ..Default::default()
        };
        assert!(matches!(
            server.submit_message(missing_sender).await,
            Err(ProtocolError::MissingField("source_agent"))
        ));

        let unknown_type = MessageRequest {
            message_type: Some("gossip".into()),
            source_agent: Some("a".into()),
            payload: Some(json!({})),
            ..Default::default()
        };
        assert!(matches!(
            server.submit_message(unknown_type).await,
            Err(ProtocolError::Unknown(_))
        ));

        let bad_priority = MessageRequest {
            message_type: Some("error".into()),
            source_agent: Some("a".into()),
            payload: Some(json!({})),
            priority: Some(42),
            ..Default::default()
        };
        let err = server.submit_message(bad_priority).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected(ref e) if e.is_client_error()));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_message_reactivates_sender() {
        let (server, _) = server().await;
        let agent = server
            .handshake(handshake_request("scanner", &["blockchain_analysis"], None))
            .await
            .unwrap();
        server.registry().mark_inactive(&agent.agent_id).await;

        server
            .submit_message(MessageRequest {
                message_type: Some("heartbeat".into()),
                source_agent: Some(agent.agent_id.clone()),
                payload: Some(json!({})),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(server.registry().is_active(&agent.agent_id).await);
        assert!(!server.heartbeat("nobody").await);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_heartbeat_message_leaves_sender_inactive() {
        let (server, _) = server().await;
        let agent = server
            .handshake(handshake_request("scanner", &["blockchain_analysis"], None))
            .await
            .unwrap();
        server.registry().mark_inactive(&agent.agent_id).await;

        let err = server
            .submit_message(MessageRequest {
                message_type: Some("heartbeat".into()),
                source_agent: Some(agent.agent_id.clone()),
                payload: Some(json!({})),
                priority: Some(42),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected(ref e) if e.is_client_error()));
        assert!(!server.registry().is_active(&agent.agent_id).await);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn explicit_topic_broadcast_reaches_topic_subscribers() {
        let (server, _) = server().await;
        let hits = Arc::new(AtomicUsize::new(0));
        server
            .broker()
            .subscribe("alerts", counting_handler(hits.clone()))
            .await;
        server
            .broker()
            .subscribe("alerts", counting_handler(hits.clone()))
            .await;

        server
            .submit_message(MessageRequest {
                message_type: Some("error".into()),
                source_agent: Some("watcher".into()),
                target_agent: Some("alerts".into()),
                broadcast: true,
                payload: Some(json!({"level": "high"})),
                ..Default::default()
            })
            .await
            .unwrap();
        eventually(|| async { hits.load(Ordering::SeqCst) == 2 }).await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn swarm_broadcast_carries_coordination_id() {
        let (server, _) = server().await;
        let hits = Arc::new(AtomicUsize::new(0));
        server
            .broker()
            .subscribe(
                MessageType::SwarmCoordination.as_str(),
                counting_handler(hits.clone()),
            )
            .await;

        let response = server
            .coordinate_swarm(json!({"task": "cluster"}))
            .await
            .unwrap();
        assert_eq!(response.status, "success");
        assert!(!response.coordination_id.is_empty());
        eventually(|| async { hits.load(Ordering::SeqCst) == 1 }).await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn stale_agents_drop_out_of_capability_lookups() {
        let settings = ServerSettings {
            server_name: "test-broker".to_string(),
            broker: fast_broker_config(),
            registry: RegistryConfig {
                heartbeat_interval: Duration::from_millis(10),
                heartbeat_timeout: Duration::from_millis(30),
            },
        };
        let server = ProtocolServer::start(settings, None, None)
            .await
            .unwrap();
        server
            .handshake(handshake_request("coord", &["swarm_coordination"], None))
            .await
            .unwrap();
        assert_eq!(
            server.agents(Some(Capability::SwarmCoordination)).await.count,
            1
        );

        eventually(|| async {
            server
                .agents(Some(Capability::SwarmCoordination))
                .await
                .count
                == 0
        })
        .await;
        assert_eq!(server.agents(None).await.count, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn health_is_static() {
        let (server, _) = server().await;
        let health = server.health();
        assert_eq!(health.status, "operational");
        assert_eq!(health.server_name, "test-broker");
        assert_eq!(health.message_type_count, 9);
        assert_eq!(health.capability_count, 7);
        server.shutdown().await;
    }
}
