//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `DaqError`, used by every layer of
//! the crate. Using the `thiserror` crate, it provides a single place where the
//! failure modes of the trigger-buffer engine are named.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading or extracting the
//!   configuration (missing keys, wrong types, malformed TOML).
//! - **`Configuration`**: Semantic configuration problems that survive parsing, an
//!   unknown adapter name or one with no driver in this build, or `run()` called
//!   before `reconfigure()`. Fatal to the call and never retried.
//! - **`Device`**: An acquisition backend failed irrecoverably during an ingest
//!   cycle. The engine stops itself and surfaces the message exactly once.
//! - **`State`**: Invalid call sequencing, e.g. reconfiguring while running or
//!   opening a second capture file.
//! - **`Io`**: File I/O failures, in practice the capture sink.
//!
//! Algorithmic edge cases (no channels connected, zero-length sweep) are not
//! errors: the affected calls simply deliver zero rows.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration could not be loaded or extracted.
    #[error("Configuration load error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration is invalid or the engine is not configured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The acquisition backend reported an unrecoverable failure.
    #[error("Device error: {0}")]
    Device(String),

    /// An operation was called in the wrong lifecycle state.
    #[error("Invalid state: {0}")]
    State(String),

    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
