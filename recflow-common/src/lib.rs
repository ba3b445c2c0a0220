//! # recflow Common Library
//!
//! Shared code for the recflow crates:
//! - Error type
//! - TOML bootstrap configuration
//! - Logging initialization
//! - Pipeline event types and EventBus

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
