//! Acquisition backends.
//!
//! A [`DataSource`] produces row-major scans of the connected channels and
//! signals through a [`Notify`] whenever new scans may be available. The
//! notification is only a hint: consumers call [`DataSource::get_data`] until it
//! returns zero.
//!
//! [`Backend`] selects the implementation from the configured adapter once, at
//! construction.

pub mod replay;
pub mod simulated;

pub use replay::ReplaySource;
pub use simulated::SimulatedSource;

use crate::config::{AdapterKind, Settings};
use crate::error::{AppResult, DaqError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Producer of multichannel scans.
pub trait DataSource: Send {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Recompute channel set and delivery cadence from `settings`.
    fn reconfigure(&mut self, settings: &Settings) -> AppResult<()>;

    /// Begin producing scans.
    ///
    /// `Ok(false)` means the backend could not start; that is not an error.
    fn run(&mut self) -> AppResult<bool>;

    /// Halt production. Idempotent.
    fn stop(&mut self);

    /// Samples per scan.
    fn channel_count(&self) -> usize;

    /// Copy available scans into `dst` (row-major, `dst.len() / channel_count()`
    /// rows at most) without blocking. Returns the number of scans written.
    fn get_data(&mut self, dst: &mut [f64]) -> AppResult<usize>;

    /// Notified when new scans may be available.
    fn data_ready(&self) -> Arc<Notify>;
}

/// Spawn a task notifying `notify` every `period` on the current runtime.
///
/// Returns `None` outside a tokio runtime.
pub(crate) fn spawn_ticker(period: Duration, notify: Arc<Notify>) -> Option<JoinHandle<()>> {
    let handle = Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            notify.notify_one();
        }
    }))
}

/// Configured backend.
#[derive(Debug)]
pub enum Backend {
    /// Signal generator (`dummy` adapter)
    Simulated(SimulatedSource),
    /// Capture file playback (`replay` adapter)
    Replay(ReplaySource),
}

impl Backend {
    /// Open the backend named by `settings.hardware.adapter`.
    pub fn open(settings: &Settings) -> AppResult<Self> {
        match settings.hardware.adapter {
            AdapterKind::Dummy => Ok(Backend::Simulated(SimulatedSource::new())),
            AdapterKind::Replay => {
                let path = settings.hardware.replay_file.as_deref().ok_or_else(|| {
                    DaqError::Configuration(
                        "Adapter 'replay' requires hardware.replay_file".to_string(),
                    )
                })?;
                Ok(Backend::Replay(ReplaySource::from_capture(
                    path,
                    settings.channel_count(),
                )?))
            }
            other @ (AdapterKind::Nidaq | AdapterKind::Picodaq) => Err(DaqError::Configuration(
                format!("Adapter '{other}' has no driver in this build"),
            )),
        }
    }

    /// Adapter this backend implements.
    pub fn kind(&self) -> AdapterKind {
        match self {
            Backend::Simulated(_) => AdapterKind::Dummy,
            Backend::Replay(_) => AdapterKind::Replay,
        }
    }

    fn inner(&self) -> &dyn DataSource {
        match self {
            Backend::Simulated(s) => s,
            Backend::Replay(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DataSource {
        match self {
            Backend::Simulated(s) => s,
            Backend::Replay(s) => s,
        }
    }
}

impl DataSource for Backend {
    fn name(&self) -> &str {
        self.inner().name()
    }

    /// Switches backend first when the configured adapter changed.
    fn reconfigure(&mut self, settings: &Settings) -> AppResult<()> {
        if self.kind() != settings.hardware.adapter {
            self.stop();
            *self = Backend::open(settings)?;
        }
        self.inner_mut().reconfigure(settings)
    }

    fn run(&mut self) -> AppResult<bool> {
        self.inner_mut().run()
    }

    fn stop(&mut self) {
        self.inner_mut().stop();
    }

    fn channel_count(&self) -> usize {
        self.inner().channel_count()
    }

    fn get_data(&mut self, dst: &mut [f64]) -> AppResult<usize> {
        self.inner_mut().get_data(dst)
    }

    fn data_ready(&self) -> Arc<Notify> {
        self.inner().data_ready()
    }
}
