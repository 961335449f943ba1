//! HTTP server and shared state

pub mod http;

pub use http::{handle_request, run, AppState, BoxBody};
