#![forbid(unsafe_code)]

//! Build-then-serve process harness for production-mode end-to-end tests.
//!
//! Runs a web framework's build CLI to completion, then launches its
//! production server, relays all child output, and resolves once the server
//! prints the URL it listens on.

pub mod config;
pub mod errors;
pub mod harness;
pub mod models;

pub use config::HarnessConfig;
pub use errors::{AppError, Result};
pub use harness::Harness;
