//! # Wablast Core
//!
//! Shared domain types, collaborator traits, error type and configuration
//! for the campaign execution engine.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::WablastConfig;
pub use error::{Result, WablastError};
