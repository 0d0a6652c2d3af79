//! # Bullion Config
//!
//! Configuration management for Bullion queues and workers.
//! Supports layered configuration from files and environment variables,
//! with validation before anything connects to Redis.

mod error;
mod loader;
mod settings;
mod validation;

pub use error::*;
pub use loader::*;
pub use settings::*;
pub use validation::*;
