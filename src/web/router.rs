// Request dispatch for the prediction server

use hyper::{Body, Method, Request, Response};
use log::debug;
use std::convert::Infallible;

use crate::web::response_helpers::{cors_preflight, endpoint_not_found};
use crate::web::routes;
use crate::web::worker::worker_bridge::SharedPredictionBridge;

pub async fn handle_request(
    req: Request<Body>,
    bridge: SharedPredictionBridge,
    max_body_bytes: usize,
) -> Result<Response<Body>, Infallible> {
    debug!("[HTTP] {} {}", req.method(), req.uri().path());

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => routes::health::handle_root().await,
        (&Method::GET, "/health") => routes::health::handle().await,
        (&Method::POST, "/predict") => {
            routes::predict::handle_post_tabular(req, bridge, max_body_bytes).await
        }
        (&Method::POST, "/predict/image") => {
            routes::predict::handle_post_image(req, bridge, max_body_bytes).await
        }
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (_, path) => Ok(endpoint_not_found(path)),
    }
}
