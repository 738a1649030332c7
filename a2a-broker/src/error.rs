use std::convert::Infallible;

use thiserror::Error;
use warp::http::StatusCode;
use warp::{reject::Reject, Rejection, Reply};

use crate::broker::PublishError;
use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl Reject for ApiError {}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        match &err {
            ProtocolError::Rejected(PublishError::NoRoute(_)) => {
                ApiError::NotFound(err.to_string())
            }
            ProtocolError::Rejected(rejection) if !rejection.is_client_error() => {
                ApiError::Unavailable(err.to_string())
            }
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<ProtocolError> for Rejection {
    fn from(err: ProtocolError) -> Self {
        warp::reject::custom(ApiError::from(err))
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message, details) = if let Some(api_err) = err.find::<ApiError>() {
        let (code, message) = match api_err {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Resource not found"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable"),
            ApiError::InternalError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        (code, message, api_err.to_string())
    } else if let Some(body_err) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "Bad request", body_err.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Payload too large",
            "request body exceeds the size limit".to_string(),
        )
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Resource not found", "no such route".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            format!("{:?}", err),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            format!("{:?}", err),
        )
    };

    let json = warp::reply::json(&serde_json::json!({
        "error": message,
        "details": details,
    }));
    Ok(warp::reply::with_status(json, code))
}
