//! Scan storage, trigger detection and capture.

pub mod capture;
pub mod ring_buffer;
pub mod trigger;
pub mod trigger_buffer;

pub use trigger_buffer::{BufferEvent, TriggerBuffer};
