//! Concurrent acquisition engine.
//!
//! [`SharedTriggerBuffer`] puts a [`TriggerBuffer`] behind a single mutex; every
//! operation, producer or consumer, is one short critical section entered
//! through [`SharedTriggerBuffer::with_lock`]. This is the only place the ring
//! counters and trigger state are touched concurrently.
//!
//! [`Acquisition`] runs the producer side: a tokio task that waits for the
//! source's "data available" hint and imports under the lock. Consumers
//! subscribe to [`BufferEvent`]s and call [`SharedTriggerBuffer::get_data`].

use crate::data::{BufferEvent, TriggerBuffer};
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long [`Acquisition::stop`] waits for the ingest task.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Trigger buffer shared between the ingest task and consumers.
#[derive(Debug, Clone)]
pub struct SharedTriggerBuffer {
    inner: Arc<Mutex<TriggerBuffer>>,
}

impl SharedTriggerBuffer {
    /// Share `buffer`.
    pub fn new(buffer: TriggerBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    /// Run `f` with exclusive access to the buffer.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut TriggerBuffer) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Receive buffer notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.with_lock(|buf| buf.subscribe())
    }

    /// Consumer read, see [`TriggerBuffer::get_data`].
    pub fn get_data(&self, dst: &mut [f64]) -> AppResult<usize> {
        self.with_lock(|buf| buf.get_data(dst))
    }
}

/// A running acquisition.
///
/// Dropping it stops the run as well; [`Acquisition::stop`] additionally waits
/// for the ingest task and reports the capture size.
#[derive(Debug)]
pub struct Acquisition {
    shared: SharedTriggerBuffer,
    pump: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    capture: Option<PathBuf>,
}

impl Acquisition {
    /// Open the capture file if `capture_name` is given, start the buffer and
    /// spawn the ingest task on the current tokio runtime.
    ///
    /// A source that does not start is reported as [`DaqError::Device`]; the
    /// capture file is closed again in that case.
    pub fn start(shared: SharedTriggerBuffer, capture_name: Option<&str>) -> AppResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| DaqError::State("acquisition needs a tokio runtime".to_string()))?;

        let (notify, capture) = shared.with_lock(|buf| -> AppResult<_> {
            let capture = match capture_name {
                Some(name) => Some(buf.start_capture(name)?),
                None => None,
            };
            let started = buf.run().and_then(|running| {
                if running {
                    Ok(())
                } else {
                    Err(DaqError::Device(format!(
                        "source '{}' could not start",
                        buf.source_name()
                    )))
                }
            });
            if let Err(err) = started {
                if let Err(close_err) = buf.stop_capture() {
                    warn!(%close_err, "failed to close capture after failed start");
                }
                return Err(err);
            }
            Ok((buf.data_ready(), capture))
        })?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let pump_shared = shared.clone();
        let pump = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {
                        if let Err(err) = pump_shared.with_lock(TriggerBuffer::import_data) {
                            debug!(%err, "ingest task ended by source failure");
                            break;
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("ingest task received shutdown signal");
                        break;
                    }
                }
            }
        });

        info!(capture = ?capture, "acquisition started");
        Ok(Self {
            shared,
            pump: Some(pump),
            shutdown_tx: Some(shutdown_tx),
            capture,
        })
    }

    /// Buffer this acquisition feeds.
    pub fn shared(&self) -> &SharedTriggerBuffer {
        &self.shared
    }

    /// Capture file of this run.
    pub fn capture_path(&self) -> Option<&Path> {
        self.capture.as_deref()
    }

    /// Whether the ingest task is still alive.
    pub fn is_active(&self) -> bool {
        self.pump.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// End the ingest task, stop the buffer and close the capture file.
    ///
    /// Returns the number of scans captured, if capturing.
    pub async fn stop(mut self) -> AppResult<Option<u64>> {
        if let Some(pump) = self.pump.take() {
            let signalled = self
                .shutdown_tx
                .take()
                .is_some_and(|tx| tx.send(()).is_ok());
            if signalled {
                match tokio::time::timeout(STOP_TIMEOUT, pump).await {
                    Ok(Ok(())) => debug!("ingest task stopped"),
                    Ok(Err(e)) => warn!("ingest task failed during shutdown: {}", e),
                    Err(_) => warn!("ingest task did not stop within {:?}", STOP_TIMEOUT),
                }
            } else {
                // already finished, e.g. after a device error
                pump.abort();
            }
        }

        let captured = self.shared.with_lock(|buf| {
            let captured = buf.stop_capture();
            buf.stop();
            captured
        });
        if let Err(err) = &captured {
            error!(%err, "failed to close capture file");
        }
        info!("acquisition stopped");
        captured
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            self.shared.with_lock(TriggerBuffer::stop);
        }
    }
}
