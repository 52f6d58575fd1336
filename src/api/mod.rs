//! HTTP API Module
//!
//! Introspection endpoints for operators plus the manual sync trigger.

mod http;

pub use http::{AppState, ErrorResponse, HttpServer};
