// Prediction route handlers

use fitness_predict_types::TabularRequest;
use hyper::{Body, Request, Response};
use std::convert::Infallible;

use crate::web::request_parsing::{parse_json_body, read_image_upload};
use crate::web::worker::worker_bridge::SharedPredictionBridge;

pub async fn handle_post_tabular(
    req: Request<Body>,
    bridge: SharedPredictionBridge,
    max_body_bytes: usize,
) -> Result<Response<Body>, Infallible> {
    let request: TabularRequest = match parse_json_body(req.into_body(), max_body_bytes).await {
        Ok(request) => request,
        Err(error_response) => return Ok(error_response),
    };

    Ok(bridge.predict_tabular(request.features.as_ref()).await)
}

pub async fn handle_post_image(
    req: Request<Body>,
    bridge: SharedPredictionBridge,
    max_body_bytes: usize,
) -> Result<Response<Body>, Infallible> {
    let image = match read_image_upload(req, max_body_bytes).await {
        Ok(image) => image,
        Err(error_response) => return Ok(error_response),
    };

    Ok(bridge.predict_image(image).await)
}
