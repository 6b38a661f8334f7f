//! # quarry-core
//!
//! Core types shared by every quarry crate: the error taxonomy, settings,
//! and tracing-based logging. This crate has no database dependencies.
//!
//! ## Modules
//!
//! - [`error`] - Error types and result aliases
//! - [`settings`] - Settings and configuration file loading
//! - [`logging`] - Tracing subscriber setup and query spans

pub mod error;
pub mod logging;
pub mod settings;

// Re-export the most commonly used types at the crate root.
pub use error::{QuarryError, QuarryResult};
pub use settings::Settings;
