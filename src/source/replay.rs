//! In-memory scan playback.
//!
//! Scans come either from a capture file, paced at the configured acquisition
//! rate, or from [`ReplaySource::push_rows`], served as soon as they are
//! pushed. The latter makes the engine drivable by external producers and by
//! tests without any timing.

use super::{spawn_ticker, DataSource};
use crate::config::Settings;
use crate::data::capture::read_capture;
use crate::error::{AppResult, DaqError};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Playback backend.
#[derive(Debug)]
pub struct ReplaySource {
    channels: usize,
    samples: Vec<f64>,
    cursor: usize,
    running: bool,
    paced: bool,
    rate_hz: f64,
    period: std::time::Duration,
    started: Option<(Instant, usize)>,
    ticker: Option<JoinHandle<()>>,
    refuse_start: bool,
    fail_next: Option<String>,
    notify: Arc<Notify>,
}

impl ReplaySource {
    /// Empty, unpaced source of `channels`-sample scans.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            samples: Vec::new(),
            cursor: 0,
            running: false,
            paced: false,
            rate_hz: 0.0,
            period: super::simulated::delivery_period(0.0),
            started: None,
            ticker: None,
            refuse_start: false,
            fail_next: None,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Source replaying a capture file at the acquisition rate.
    pub fn from_capture(path: &Path, channels: usize) -> AppResult<Self> {
        let samples = read_capture(path, channels)?;
        let mut source = Self::new(channels);
        source.samples = samples.into_iter().map(f64::from).collect();
        source.paced = true;
        info!(
            path = %path.display(),
            scans = source.remaining(),
            "replay source loaded"
        );
        Ok(source)
    }

    /// Queue row-major scans and raise "data available" if running.
    pub fn push_rows(&mut self, samples: &[f64]) {
        self.samples.extend_from_slice(samples);
        if self.running {
            self.notify.notify_one();
        }
    }

    /// Make the next `run` report that the backend could not start.
    pub fn refuse_start(&mut self, refuse: bool) {
        self.refuse_start = refuse;
    }

    /// Make the next `get_data` fail with a device error.
    pub fn fail_next(&mut self, message: impl Into<String>) {
        self.fail_next = Some(message.into());
        if self.running {
            self.notify.notify_one();
        }
    }

    /// Scans queued but not yet delivered.
    pub fn remaining(&self) -> usize {
        match self.channels {
            0 => 0,
            ch => (self.samples.len() - self.cursor) / ch,
        }
    }

    /// Restart playback from the first scan.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn due_rows(&self) -> usize {
        match self.started {
            Some((at, first_row)) if self.paced => {
                let due = (at.elapsed().as_secs_f64() * self.rate_hz) as usize;
                let delivered = self.cursor / self.channels.max(1) - first_row;
                due.saturating_sub(delivered)
            }
            _ => usize::MAX,
        }
    }
}

impl DataSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    fn reconfigure(&mut self, settings: &Settings) -> AppResult<()> {
        self.stop();
        let expected = settings.channel_count();
        if expected != self.channels {
            return Err(DaqError::Configuration(format!(
                "Replay data has {} channels but {expected} are connected",
                self.channels
            )));
        }
        self.rate_hz = settings.hardware.acq_rate_hz;
        self.period = super::simulated::delivery_period(settings.sweep_seconds());
        Ok(())
    }

    fn run(&mut self) -> AppResult<bool> {
        self.stop();
        if self.refuse_start {
            warn!("replay source refused to start");
            return Ok(false);
        }
        if self.paced {
            let Some(ticker) = spawn_ticker(self.period, self.notify.clone()) else {
                warn!("paced replay needs a tokio runtime");
                return Ok(false);
            };
            self.ticker = Some(ticker);
        }
        self.started = Some((Instant::now(), self.cursor / self.channels.max(1)));
        self.running = true;
        self.notify.notify_one();
        Ok(true)
    }

    fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.started = None;
        self.running = false;
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn get_data(&mut self, dst: &mut [f64]) -> AppResult<usize> {
        if let Some(message) = self.fail_next.take() {
            return Err(DaqError::Device(message));
        }
        if !self.running || self.channels == 0 {
            return Ok(0);
        }
        let rows = self
            .remaining()
            .min(dst.len() / self.channels)
            .min(self.due_rows());
        let n = rows * self.channels;
        dst[..n].copy_from_slice(&self.samples[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(rows)
    }

    fn data_ready(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.stop();
    }
}
