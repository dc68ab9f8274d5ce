//! HTTP handlers.
//!
//! Each handler is a thin adapter: parse the request, call into the
//! `wpb-core` service, map the outcome to a status code and JSON body.

mod health;
mod pair;

pub use health::health;
pub use pair::{error_response, pair};
