// Web server modules for the fitness prediction proxy

pub mod config;
pub mod logger;
pub mod request_parsing;
pub mod response_helpers;
pub mod router;
pub mod routes;
pub mod worker;

// Re-export commonly used types
pub use config::*;
pub use router::handle_request;
pub use worker::worker_bridge::{PredictionBridge, SharedPredictionBridge};
