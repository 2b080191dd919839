// HTTP response helper functions shared by the route handlers

use fitness_predict_types::{ErrorBody, JobFailure, LaunchError};
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

/// Standard CORS headers
const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn builder(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder()
        .status(status)
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"error":"Serialization failed","status":"error"}"#.to_string());
    builder(status)
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

/// Build a `{"error": ..., "status": "error"}` response
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &ErrorBody::new(message))
}

/// 400 for input rejected before any worker is started
pub fn invalid_input(err: &LaunchError) -> Response<Body> {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    json_error(status, &err.to_string())
}

/// 500 (or whatever the failure maps to) with the truncated diagnostic
pub fn job_failure(failure: &JobFailure) -> Response<Body> {
    let status = StatusCode::from_u16(failure.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody::new(failure.message.clone()).with_detail(failure.detail.clone());
    json_response(status, &body)
}

/// 404 for unknown routes
pub fn endpoint_not_found(path: &str) -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({
            "message": "Endpoint not found",
            "path": path,
        }),
    )
}

/// Build an empty response with CORS headers
pub fn empty_response(status: StatusCode) -> Response<Body> {
    builder(status).body(Body::empty()).unwrap()
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    empty_response(StatusCode::OK)
}
