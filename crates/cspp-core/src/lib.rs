//! CSPP Core Library
//!
//! Shared functionality for CSPP components:
//! - Mix client configuration resolution and hierarchy
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::MixConfig;
pub use error::{Error, Result};
