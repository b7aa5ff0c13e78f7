//! HTTP server providing the status and control API.
//!
//! - [`api`]: Response types and route handlers

pub mod api;

pub use api::{build_router, AppState};
