// Health check route handlers

use chrono::Utc;
use hyper::{Body, Response, StatusCode};
use serde_json::json;
use std::convert::Infallible;

use crate::web::response_helpers::json_response;

const SERVICE_NAME: &str = "fitness-predict";

pub async fn handle() -> Result<Response<Body>, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "status": "OK",
            "timestamp": Utc::now().to_rfc3339(),
            "service": SERVICE_NAME,
        }),
    ))
}

pub async fn handle_root() -> Result<Response<Body>, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "message": "API is running",
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ))
}
