//! Core library for the scope_daq acquisition engine.
//!
//! This library contains the trigger buffer that sits between a multichannel
//! data source and its consumers: a scan ring with absolute counters, a
//! hysteretic threshold trigger with auto-trigger fallback, windowed reads
//! around each trigger and an optional disk capture of everything delivered.
//! It is used by the `scope_daq` command-line acquisition tool.
//!
//! ```no_run
//! use scope_daq::{config::Settings, data::TriggerBuffer};
//!
//! # fn main() -> scope_daq::error::AppResult<()> {
//! let mut buffer = TriggerBuffer::new(Settings::load()?)?;
//! buffer.reconfigure()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod logging;
pub mod source;
pub mod sweep;
