//! HTTP adapter (axum).
//!
//! Exposes the pairing service as `GET /pair` plus a `GET /health` probe.

pub mod handlers;
pub mod router;

pub use router::{build_router, serve, AppState};
