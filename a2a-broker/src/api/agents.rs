use std::sync::Arc;

use serde::Deserialize;
use warp::{Rejection, Reply};

use crate::error::ApiError;
use crate::models::Capability;
use crate::protocol::ProtocolServer;

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub capability: Option<String>,
}

pub async fn handle_list_agents(
    query: AgentQuery,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    let capability = query
        .capability
        .as_deref()
        .map(str::parse::<Capability>)
        .transpose()
        .map_err(|e| warp::reject::custom(ApiError::BadRequest(e.to_string())))?;

    Ok(warp::reply::json(&server.agents(capability).await))
}

pub async fn handle_get_agent(
    agent_id: String,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    match server.agent(&agent_id).await {
        Some(agent) => Ok(warp::reply::json(&agent)),
        None => Err(warp::reject::custom(ApiError::NotFound(format!(
            "agent {}",
            agent_id
        )))),
    }
}
