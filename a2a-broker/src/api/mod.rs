use std::convert::Infallible;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use warp::{Filter, Rejection, Reply};

use crate::protocol::ProtocolServer;

mod agents;
mod handshake;
mod investigation;
mod message;
mod monitoring;
mod swarm;

/// Request bodies above this are refused before deserialization.
const MAX_BODY_BYTES: u64 = 2 * 1024 * 1024;

pub fn routes(
    server: Arc<ProtocolServer>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let a2a = warp::path("a2a");

    let handshake_route = a2a
        .and(warp::path("handshake"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(handshake::handle_handshake);

    let message_route = a2a
        .and(warp::path("message"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(message::handle_message);

    let heartbeat_route = a2a
        .and(warp::path("heartbeat"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(message::handle_heartbeat);

    let agents_route = a2a
        .and(warp::path("agents"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query())
        .and(with_server(server.clone()))
        .and_then(agents::handle_list_agents);

    let agent_route = a2a
        .and(warp::path("agents"))
        .and(warp::path::param())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(agents::handle_get_agent);

    let investigation_route = a2a
        .and(warp::path("investigation"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(investigation::handle_dispatch);

    let investigation_status_route = a2a
        .and(warp::path("investigation"))
        .and(warp::path::param())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(investigation::handle_get_investigation);

    let swarm_route = a2a
        .and(warp::path("swarm"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(swarm::handle_swarm);

    let health_route = a2a
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(monitoring::handle_health);

    let dead_letters_route = a2a
        .and(warp::path("dead-letters"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(monitoring::handle_dead_letters);

    let metrics_json_route = a2a
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(monitoring::handle_metrics_json);

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server))
        .and_then(monitoring::handle_metrics_text);

    handshake_route
        .or(message_route)
        .or(heartbeat_route)
        .or(agents_route)
        .or(agent_route)
        .or(investigation_route)
        .or(investigation_status_route)
        .or(swarm_route)
        .or(health_route)
        .or(dead_letters_route)
        .or(metrics_json_route)
        .or(metrics_route)
}

fn with_server(
    server: Arc<ProtocolServer>,
) -> impl Filter<Extract = (Arc<ProtocolServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{json, Value};
    use warp::http::StatusCode;

    use super::*;
    use crate::agents::RegistryConfig;
    use crate::broker::{handler_fn, DeliveryError};
    use crate::error::handle_rejection;
    use crate::protocol::ServerSettings;
    use crate::testing::{counting_handler, eventually, fast_broker_config};

    async fn server() -> Arc<ProtocolServer> {
        let settings = ServerSettings {
            server_name: "api-test".to_string(),
            broker: fast_broker_config(),
            registry: RegistryConfig::default(),
        };
        ProtocolServer::start(settings, None, None).await.unwrap()
    }

    fn body<B: AsRef<[u8]>>(response: &warp::http::Response<B>) -> Value {
        serde_json::from_slice(response.body().as_ref()).unwrap()
    }

    #[tokio::test]
    async fn handshake_then_list_agents() {
        let server = server().await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/handshake")
            .json(&json!({
                "agent_name": "coord-1",
                "capabilities": ["swarm_coordination", "risk_assessment"],
            }))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let handshake = body(&response);
        assert_eq!(handshake["protocol_version"], "A2A v1.0");
        let agent_id = handshake["agent_id"].as_str().unwrap().to_string();

        let response = warp::test::request()
            .path("/a2a/agents")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let listing = body(&response);
        assert_eq!(listing["count"], 1);
        assert_eq!(listing["agents"][0]["id"], agent_id.as_str());

        let response = warp::test::request()
            .path("/a2a/agents?capability=blockchain_analysis")
            .reply(&api)
            .await;
        assert_eq!(body(&response)["count"], 0);

        let response = warp::test::request()
            .path(&format!("/a2a/agents/{}", agent_id))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["name"], "coord-1");

        let response = warp::test::request()
            .path("/a2a/agents/ghost")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn handshake_rejects_missing_and_unknown_fields() {
        let server = server().await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/handshake")
            .json(&json!({"capabilities": ["risk_assessment"]}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/handshake")
            .json(&json!({"agent_name": "x", "capabilities": ["astrology"]}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body(&response)["details"]
            .as_str()
            .unwrap()
            .contains("astrology"));

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/handshake")
            .header("content-type", "application/json")
            .body("{not json")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = warp::test::request()
            .path("/a2a/agents?capability=astrology")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn message_is_accepted_and_delivered() {
        let server = server().await;
        let hits = Arc::new(AtomicUsize::new(0));
        server
            .broker()
            .subscribe("agent-7", counting_handler(hits.clone()))
            .await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/message")
            .json(&json!({
                "type": "consensus_request",
                "source_agent": "agent-1",
                "target_agent": "agent-7",
                "payload": {"question": "is Addr123 a mixer?"},
            }))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["status"], "success");
        eventually(|| async { hits.load(Ordering::SeqCst) == 1 }).await;

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/message")
            .json(&json!({"type": "consensus_request", "source_agent": "agent-1"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn message_to_unknown_agent_is_not_found() {
        let server = server().await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/message")
            .json(&json!({
                "type": "consensus_request",
                "source_agent": "agent-1",
                "target_agent": "agent-404",
                "payload": {},
            }))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body(&response)["details"]
            .as_str()
            .unwrap()
            .contains("no route to agent-404"));
        assert_eq!(server.dead_letters().await.count, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn message_after_shutdown_is_unavailable() {
        let server = server().await;
        let api = routes(server.clone()).recover(handle_rejection);
        server.shutdown().await;

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/message")
            .json(&json!({
                "type": "error",
                "source_agent": "agent-1",
                "payload": {},
            }))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn heartbeat_reports_whether_agent_is_known() {
        let server = server().await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/heartbeat")
            .json(&json!({"agent_id": "nobody"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response), json!({"status": "success", "known": false}));

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/heartbeat")
            .json(&json!({}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn investigation_dispatch_and_lookup() {
        let server = server().await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/investigation")
            .json(&json!({"address": "Addr123"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let dispatch = body(&response);
        assert_eq!(dispatch["status"], "error");
        let request_id = dispatch["request_id"].as_str().unwrap().to_string();

        let response = warp::test::request()
            .path(&format!("/a2a/investigation/{}", request_id))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response)["state"], "failed_no_coordinator");

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/investigation")
            .json(&json!({"analysis_type": "quick"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = warp::test::request()
            .path("/a2a/investigation/unknown")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn swarm_health_and_dead_letters() {
        let server = server().await;
        server
            .broker()
            .subscribe(
                "swarm_coordination",
                handler_fn(|_| async {
                    Err::<(), DeliveryError>(DeliveryError::Handler("busy".into()))
                }),
            )
            .await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .method("POST")
            .path("/a2a/swarm")
            .json(&json!({"task": "trace funds"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let swarm = body(&response);
        assert_eq!(swarm["status"], "success");
        assert!(swarm["coordination_id"].as_str().is_some());

        eventually(|| async { server.dead_letters().await.count == 1 }).await;
        let response = warp::test::request()
            .path("/a2a/dead-letters")
            .reply(&api)
            .await;
        let listing = body(&response);
        assert_eq!(listing["count"], 1);
        assert!(listing["entries"][0]["reason"]
            .as_str()
            .unwrap()
            .contains("busy"));

        let response = warp::test::request()
            .path("/a2a/health")
            .reply(&api)
            .await;
        let health = body(&response);
        assert_eq!(health["status"], "operational");
        assert_eq!(health["server_name"], "api-test");
        assert_eq!(health["message_type_count"], 9);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_in_both_formats() {
        let server = server().await;
        server.broker().refresh_metrics().await;
        let api = routes(server.clone()).recover(handle_rejection);

        let response = warp::test::request()
            .path("/a2a/metrics")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body(&response)["messages_sent"].is_u64());

        let response = warp::test::request().path("/metrics").reply(&api).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8_lossy(response.body()).into_owned();
        assert!(text.contains("a2a_queue_depth"));
        server.shutdown().await;
    }
}
