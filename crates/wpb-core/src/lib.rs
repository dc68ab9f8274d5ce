//! Core domain + application logic for the WhatsApp pairing service.
//!
//! This crate is framework-agnostic. The WhatsApp protocol client and the HTTP
//! surface live behind ports (traits) implemented in adapter crates.

pub mod anti_delete;
pub mod bot;
pub mod commands;
pub mod config;
pub mod creds;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod pairing;
pub mod phone;
pub mod registry;
pub mod retry;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod throttle;

pub use errors::{Error, Result};
