//! The trigger buffer: ingest, trigger dispatch, windowed reads and capture.
//!
//! [`TriggerBuffer`] owns the scan ring, the trigger detector and the optional
//! capture sink, and drives an injected [`DataSource`]. It is a plain
//! synchronous state machine; every method runs to completion without
//! blocking. Concurrent use goes through [`crate::engine::SharedTriggerBuffer`].
//!
//! # Data flow
//!
//! ```text
//! source --import_data--> ScanRing --column--> TriggerDetector
//!                            |                      |
//!                            |<----seek_read--------+ (trigger at T: read = T - pre)
//!                            v
//!                       get_data ----> consumer
//!                            \-------> CaptureSink
//! ```
//!
//! With triggering enabled the reader only sees the window `[T - pre, T + post)`
//! of the trigger in flight; without it every ingested scan streams through.
//!
//! # Fetch limits
//!
//! Each ingest step fetches at most up to the physical end of storage. While a
//! sweep is in flight, or in continuous mode, it is further limited to the free
//! space so unread scans are never overwritten. While hunting it is limited to
//! `capacity - pretrig_scans` so the pre-trigger history of any trigger in the
//! block is still resident; history older than one capacity is discarded.

use super::capture::{capture_path, CaptureSink};
use super::ring_buffer::ScanRing;
use super::trigger::{SweepWindow, TriggerDetector, TriggerKind, TriggerPhase};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::source::{Backend, DataSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, trace, warn};

/// Ring capacity in sweeps.
pub const CAPACITY_SWEEPS: usize = 3;

/// Buffered notifications per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// Notifications raised by the trigger buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    /// New scans can be read
    DataAvailable,
    /// A sweep starts; its first scan is `index - pretrig_scans`
    TriggerAvailable {
        /// Absolute scan index of the trigger
        index: u64,
        /// Natural or auto trigger
        kind: TriggerKind,
    },
    /// The backend failed; the run has been stopped
    DeviceError(String),
}

#[derive(Debug)]
struct Prepared {
    ring: ScanRing,
    per_scans: usize,
    detector: Option<TriggerDetector>,
    trigger_column: usize,
}

/// Trigger-aligned scan buffer over a [`DataSource`].
pub struct TriggerBuffer {
    settings: Settings,
    source: Box<dyn DataSource>,
    prepared: Option<Prepared>,
    running: bool,
    capture: Option<CaptureSink>,
    events: broadcast::Sender<BufferEvent>,
    // ingest stopped at a full ring with the source possibly holding more
    backlog: bool,
}

impl std::fmt::Debug for TriggerBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerBuffer")
            .field("source", &self.source.name())
            .field("prepared", &self.prepared)
            .field("running", &self.running)
            .field("capture", &self.capture.as_ref().map(CaptureSink::path))
            .finish()
    }
}

impl TriggerBuffer {
    /// Buffer over the backend named in `settings`.
    pub fn new(settings: Settings) -> AppResult<Self> {
        let backend = Backend::open(&settings)?;
        Ok(Self::with_source(settings, Box::new(backend)))
    }

    /// Buffer over an externally constructed source.
    pub fn with_source(settings: Settings, source: Box<dyn DataSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            source,
            prepared: None,
            running: false,
            capture: None,
            events,
            backlog: false,
        }
    }

    /// Receive notifications raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.events.subscribe()
    }

    /// Current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable settings; changes take effect on the next
    /// [`reconfigure`](Self::reconfigure) or [`rethreshold`](Self::rethreshold).
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// The "data available" hint of the underlying source.
    pub fn data_ready(&self) -> Arc<Notify> {
        self.source.data_ready()
    }

    /// Name of the underlying source.
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Apply the current settings: reconfigure the source, reallocate the ring
    /// and reset the trigger state.
    pub fn reconfigure(&mut self) -> AppResult<()> {
        if self.running {
            return Err(DaqError::State(
                "cannot reconfigure while running".to_string(),
            ));
        }
        self.settings.validate()?;
        self.source.reconfigure(&self.settings)?;

        let channels = self.source.channel_count();
        let per_scans = self.settings.per_scans();
        let ring = ScanRing::new(CAPACITY_SWEEPS * per_scans, channels);

        let (detector, trigger_column) = if self.settings.trigger.enabled {
            let column = self.settings.trigger_column().ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Trigger source {} is not connected",
                    self.settings.trigger.source
                ))
            })?;
            (TriggerDetector::from_settings(&self.settings, 0), column)
        } else {
            (None, 0)
        };

        info!(
            source = self.source.name(),
            channels,
            per_scans,
            capacity = ring.capacity(),
            triggered = detector.is_some(),
            "trigger buffer reconfigured"
        );
        self.backlog = false;
        self.prepared = Some(Prepared {
            ring,
            per_scans,
            detector,
            trigger_column,
        });
        Ok(())
    }

    /// Pick up a changed trigger level, direction, delay or auto mode without
    /// a full reconfigure. A no-op when triggering was disabled at reconfigure.
    pub fn rethreshold(&mut self) -> AppResult<()> {
        let Some(prep) = self.prepared.as_mut() else {
            return Ok(());
        };
        let Some(detector) = prep.detector.as_mut() else {
            return Ok(());
        };
        let column = self.settings.trigger_column().ok_or_else(|| {
            DaqError::Configuration(format!(
                "Trigger source {} is not connected",
                self.settings.trigger.source
            ))
        })?;
        detector.rethreshold(&self.settings, prep.ring.write_idx());
        prep.trigger_column = column;
        debug!(
            trig_volt = detector.levels().trig_volt,
            trig_revert = detector.levels().trig_revert,
            pretrig_scans = detector.window().pretrig_scans,
            "trigger rethresholded"
        );
        Ok(())
    }

    /// Start the source.
    ///
    /// Returns `Ok(false)` when the backend could not start.
    pub fn run(&mut self) -> AppResult<bool> {
        if self.prepared.is_none() {
            return Err(DaqError::Configuration(
                "run() called before reconfigure()".to_string(),
            ));
        }
        if self.running {
            return Err(DaqError::State("already running".to_string()));
        }
        if !self.source.run()? {
            warn!(source = self.source.name(), "source did not start");
            return Ok(false);
        }
        self.running = true;
        info!(source = self.source.name(), "acquisition running");
        Ok(true)
    }

    /// Stop the source and close any capture file. Idempotent.
    pub fn stop(&mut self) {
        self.source.stop();
        if self.running {
            info!(source = self.source.name(), "acquisition stopped");
        }
        self.running = false;
        self.backlog = false;
        if let Err(err) = self.stop_capture() {
            error!(%err, "failed to close capture file");
        }
    }

    // ========================================================================
    // Capture
    // ========================================================================

    /// Open `<capture.directory>/<name>.dat` and mirror delivered scans to it.
    pub fn start_capture(&mut self, name: &str) -> AppResult<PathBuf> {
        if self.capture.is_some() {
            return Err(DaqError::State("capture already active".to_string()));
        }
        if self.running {
            return Err(DaqError::State(
                "capture must be started before the run".to_string(),
            ));
        }
        let channels = match &self.prepared {
            Some(prep) => prep.ring.channel_count(),
            None => self.settings.channel_count(),
        };
        let path = capture_path(&self.settings.capture.directory, name);
        let sink = CaptureSink::create(&path, channels)?;
        self.capture = Some(sink);
        Ok(path)
    }

    /// Close the capture file, returning the scans written, if one was open.
    pub fn stop_capture(&mut self) -> AppResult<Option<u64>> {
        match self.capture.take() {
            Some(sink) => sink.finish().map(Some),
            None => Ok(None),
        }
    }

    /// Path of the open capture file.
    pub fn capture_path(&self) -> Option<&Path> {
        self.capture.as_ref().map(CaptureSink::path)
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Pull everything the source has into the ring.
    ///
    /// Repeats until the source yields no scans or the ring cannot take more.
    /// In the latter case the source's "data available" hint is raised again
    /// once a read frees space, so a pump waiting on it resumes ingesting.
    /// A source failure stops the run, raises [`BufferEvent::DeviceError`] and
    /// is returned as [`DaqError::Device`].
    pub fn import_data(&mut self) -> AppResult<usize> {
        if !self.running {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            match self.ingest_block() {
                Ok(0) => break,
                Ok(rows) => total += rows,
                Err(err) => return Err(self.fail(err)),
            }
        }
        Ok(total)
    }

    fn ingest_block(&mut self) -> AppResult<usize> {
        let Some(Prepared {
            ring,
            detector,
            trigger_column,
            ..
        }) = self.prepared.as_mut()
        else {
            return Ok(0);
        };

        let hunting = detector.as_ref().filter(|d| d.trig_idx().is_none());
        let limit = match hunting {
            Some(d) => ring.capacity().saturating_sub(d.window().pretrig_scans),
            None => ring.free(),
        };
        if limit == 0 {
            self.backlog = true;
            return Ok(0);
        }
        let origin = ring.write_idx();
        let source = &mut self.source;
        let rows = ring.fill_with(limit, |dst| source.get_data(dst))?;
        if rows == 0 {
            return Ok(0);
        }
        trace!(origin, rows, "ingested scans");

        let Some(detector) = detector.as_mut() else {
            let _ = self.events.send(BufferEvent::DataAvailable);
            return Ok(rows);
        };
        if detector.trig_idx().is_some() {
            let _ = self.events.send(BufferEvent::DataAvailable);
            return Ok(rows);
        }

        let dropped = ring.discard_overwritten();
        if dropped > 0 {
            trace!(dropped, "discarded idle history");
        }
        let history_start = ring.read_idx();
        let samples = ring.column(origin, rows, *trigger_column);
        if let Some(event) = detector.scan(origin, rows, samples, history_start) {
            let pretrig = detector.window().pretrig_scans as u64;
            ring.seek_read(event.index.saturating_sub(pretrig));
            debug!(index = event.index, kind = ?event.kind, "trigger");
            let _ = self.events.send(BufferEvent::TriggerAvailable {
                index: event.index,
                kind: event.kind,
            });
        }
        Ok(rows)
    }

    fn fail(&mut self, err: DaqError) -> DaqError {
        let message = match err {
            DaqError::Device(message) => message,
            other => other.to_string(),
        };
        error!(source = self.source.name(), %message, "acquisition failed");
        let _ = self.events.send(BufferEvent::DeviceError(message.clone()));
        self.stop();
        DaqError::Device(message)
    }

    // ========================================================================
    // Reader
    // ========================================================================

    /// Copy deliverable scans into `dst` (row-major), mirroring them to the
    /// capture file.
    ///
    /// Triggered: only scans of the sweep in flight, none otherwise.
    /// Continuous: everything unread that fits.
    ///
    /// A failed capture write ends the capture; the scans are still delivered.
    pub fn get_data(&mut self, dst: &mut [f64]) -> AppResult<usize> {
        let Some(prep) = self.prepared.as_mut() else {
            return Ok(0);
        };
        let channels = prep.ring.channel_count();
        if channels == 0 {
            return Ok(0);
        }
        let fits = dst.len() / channels;

        let rows = match prep.detector.as_mut() {
            None => prep.ring.read_into(dst, fits),
            Some(detector) => {
                let Some(trig) = detector.trig_idx() else {
                    return Ok(0);
                };
                let end = detector.sweep_end().unwrap_or(trig);
                let want = end.saturating_sub(prep.ring.read_idx()) as usize;
                let rows = prep.ring.read_into(dst, want.min(fits));
                if prep.ring.read_idx() >= end {
                    detector.complete_sweep();
                    debug!(trig, "sweep delivered");
                }
                rows
            }
        };

        if rows == 0 {
            return Ok(0);
        }
        if std::mem::take(&mut self.backlog) {
            self.source.data_ready().notify_one();
        }
        if let Some(sink) = self.capture.as_mut() {
            if let Err(err) = sink.write_rows(&dst[..rows * channels]) {
                error!(%err, path = %sink.path().display(), "capture write failed, capture stopped");
                if let Some(sink) = self.capture.take() {
                    if let Err(close_err) = sink.finish() {
                        warn!(%close_err, "failed to close capture file");
                    }
                }
            }
        }
        Ok(rows)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Whether the source is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether [`reconfigure`](Self::reconfigure) has succeeded.
    pub fn is_configured(&self) -> bool {
        self.prepared.is_some()
    }

    /// Whether triggering is active for this configuration.
    pub fn is_triggered(&self) -> bool {
        self.prepared.as_ref().is_some_and(|p| p.detector.is_some())
    }

    /// Samples per scan.
    pub fn channel_count(&self) -> usize {
        self.prepared
            .as_ref()
            .map_or(0, |p| p.ring.channel_count())
    }

    /// Scans per sweep.
    pub fn per_scans(&self) -> usize {
        self.prepared.as_ref().map_or(0, |p| p.per_scans)
    }

    /// Pre/post-trigger split; all post-trigger in continuous mode.
    pub fn window(&self) -> SweepWindow {
        match &self.prepared {
            Some(Prepared {
                detector: Some(d), ..
            }) => d.window(),
            Some(p) => SweepWindow::new(0, p.per_scans),
            None => SweepWindow::default(),
        }
    }

    /// Scans ingested since reconfigure.
    pub fn write_idx(&self) -> u64 {
        self.prepared.as_ref().map_or(0, |p| p.ring.write_idx())
    }

    /// Scans consumed or discarded since reconfigure.
    pub fn read_idx(&self) -> u64 {
        self.prepared.as_ref().map_or(0, |p| p.ring.read_idx())
    }

    /// Trigger of the sweep in flight.
    pub fn trig_idx(&self) -> Option<u64> {
        self.prepared
            .as_ref()
            .and_then(|p| p.detector.as_ref())
            .and_then(TriggerDetector::trig_idx)
    }

    /// Trigger phase, `None` in continuous mode.
    pub fn phase(&self) -> Option<TriggerPhase> {
        let prep = self.prepared.as_ref()?;
        prep.detector
            .as_ref()
            .map(|d| d.phase(prep.ring.write_idx()))
    }
}

impl Drop for TriggerBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}
