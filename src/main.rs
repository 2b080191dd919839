// HTTP server for the fitness prediction proxy

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::{error, info};

use fitness_predict::web::logger::setup_logging;
use fitness_predict::web::{handle_request, PredictionBridge, ServerConfig, SharedPredictionBridge};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    let log_path = setup_logging(&config.log_dir, &config.log_level)?;
    info!("Logging to {log_path}");

    let bridge: SharedPredictionBridge = Arc::new(PredictionBridge::new(config.worker.clone()));
    let max_body_bytes = config.max_body_bytes;

    let make_svc = make_service_fn({
        let bridge = bridge.clone();
        move |_conn| {
            let bridge = bridge.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, bridge.clone(), max_body_bytes)
                }))
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let server = Server::try_bind(&addr)?.serve(make_svc);

    let worker = bridge.config();
    info!("Fitness prediction server starting on http://{addr}");
    info!(
        "Worker: {} {} (timeout {}s, kill grace {}ms, image delivery {:?})",
        worker.interpreter,
        worker.script.display(),
        worker.timeout.as_secs(),
        worker.kill_grace.as_millis(),
        worker.image_delivery
    );
    info!("Available endpoints:");
    info!("  GET  /               - API status");
    info!("  GET  /health         - Health check");
    info!("  POST /predict        - Predict from a feature vector");
    info!("  POST /predict/image  - Predict from an uploaded image");

    let graceful = server.with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    });

    if let Err(e) = graceful.await {
        error!("Server error: {e}");
        return Err(e.into());
    }
    Ok(())
}
