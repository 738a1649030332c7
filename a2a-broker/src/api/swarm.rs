use std::sync::Arc;

use serde_json::Value;
use warp::{Rejection, Reply};

use crate::protocol::ProtocolServer;

pub async fn handle_swarm(
    request: Value,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    let response = server.coordinate_swarm(request).await?;
    Ok(warp::reply::json(&response))
}
