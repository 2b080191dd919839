//! Fitness prediction proxy.
//!
//! An HTTP front end that answers each prediction request by running the
//! inference script in a child process and arbitrating its outcome into a
//! single response.

pub mod web;

pub use fitness_predict_types as types;
