// src/utils/mod.rs
//! Shared utilities: error taxonomy, configuration, retry backoff

pub mod backoff;
pub mod config;
pub mod errors;

pub use backoff::Backoff;
pub use config::EngineConfig;
pub use errors::{EngineError, ErrorClass, ErrorCode, Result};
