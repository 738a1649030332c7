use std::sync::Arc;

use warp::{Rejection, Reply};

use crate::error::ApiError;
use crate::models::InvestigationRequest;
use crate::protocol::ProtocolServer;

/// A missing coordinator is still a 200 with `status: "error"`.
pub async fn handle_dispatch(
    request: InvestigationRequest,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    let dispatch = server
        .dispatch_investigation(
            request.address.as_deref().unwrap_or_default(),
            request.analysis_type.as_deref(),
        )
        .await?;
    Ok(warp::reply::json(&dispatch))
}

pub async fn handle_get_investigation(
    request_id: String,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    server
        .investigation(&request_id)
        .await
        .map(|record| warp::reply::json(&record))
        .ok_or_else(|| {
            warp::reject::custom(ApiError::NotFound(format!("investigation {}", request_id)))
        })
}
