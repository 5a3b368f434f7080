//! Consumer-side assembly of whole sweeps.
//!
//! A [`SweepAssembler`] owns one sweep's worth of row-major scans and fills it
//! by repeated reads from the trigger buffer. A trigger notification restarts
//! the fill; in continuous mode sweeps simply roll over once full.

use crate::data::{BufferEvent, TriggerBuffer};
use crate::engine::SharedTriggerBuffer;
use crate::error::AppResult;

/// Result of one [`SweepAssembler::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepProgress {
    /// Nothing was read
    Idle,
    /// The first scans of sweep number `sweep` arrived
    Started {
        /// 1-based sweep number
        sweep: u64,
    },
    /// More scans of the current sweep arrived
    Partial,
    /// The current sweep is full
    Complete {
        /// 1-based sweep number
        sweep: u64,
    },
}

/// Accumulates scans into one sweep.
#[derive(Debug, Clone)]
pub struct SweepAssembler {
    per_scans: usize,
    channels: usize,
    data: Vec<f64>,
    filled: usize,
    sweeps: u64,
}

impl SweepAssembler {
    /// Assembler for sweeps of `per_scans` scans of `channels` samples.
    pub fn new(per_scans: usize, channels: usize) -> Self {
        Self {
            per_scans,
            channels,
            data: vec![0.0; per_scans * channels],
            filled: 0,
            sweeps: 0,
        }
    }

    /// Assembler sized for the buffer's current configuration.
    pub fn for_buffer(buffer: &TriggerBuffer) -> Self {
        Self::new(buffer.per_scans(), buffer.channel_count())
    }

    /// React to a buffer notification; a trigger restarts the sweep.
    pub fn handle_event(&mut self, event: &BufferEvent) {
        if matches!(event, BufferEvent::TriggerAvailable { .. }) {
            self.filled = 0;
        }
    }

    /// Read once into the unfilled part of the sweep.
    pub fn feed<F>(&mut self, read: F) -> AppResult<SweepProgress>
    where
        F: FnOnce(&mut [f64]) -> AppResult<usize>,
    {
        if self.is_complete() {
            self.filled = 0;
        }
        let start = self.filled * self.channels;
        let rows = read(&mut self.data[start..])?.min(self.per_scans - self.filled);
        if rows == 0 {
            return Ok(SweepProgress::Idle);
        }
        let started = self.filled == 0;
        if started {
            self.sweeps += 1;
        }
        self.filled += rows;

        Ok(if self.is_complete() {
            SweepProgress::Complete { sweep: self.sweeps }
        } else if started {
            SweepProgress::Started { sweep: self.sweeps }
        } else {
            SweepProgress::Partial
        })
    }

    /// Read from a shared buffer until it has nothing more or the sweep is full.
    pub fn drain(&mut self, shared: &SharedTriggerBuffer) -> AppResult<Option<u64>> {
        loop {
            match self.feed(|dst| shared.get_data(dst))? {
                SweepProgress::Idle => return Ok(None),
                SweepProgress::Complete { sweep } => return Ok(Some(sweep)),
                SweepProgress::Started { .. } | SweepProgress::Partial => {}
            }
        }
    }

    /// Whether the current sweep is full.
    pub fn is_complete(&self) -> bool {
        self.per_scans > 0 && self.filled == self.per_scans
    }

    /// Scans of the current sweep received so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Sweeps started so far.
    pub fn sweep_count(&self) -> u64 {
        self.sweeps
    }

    /// Row-major scans of the current sweep received so far.
    pub fn scans(&self) -> &[f64] {
        &self.data[..self.filled * self.channels]
    }

    /// Mean of one channel over the scans received so far.
    pub fn channel_mean(&self, channel: usize) -> Option<f64> {
        if channel >= self.channels || self.filled == 0 {
            return None;
        }
        let sum: f64 = self
            .scans()
            .chunks_exact(self.channels)
            .map(|scan| scan[channel])
            .sum();
        Some(sum / self.filled as f64)
    }
}
