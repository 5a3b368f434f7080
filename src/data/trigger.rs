//! Hysteretic threshold trigger with priming, refractory period and auto-trigger.
//!
//! The detector inspects the trigger channel of each newly ingested block of
//! scans. A trigger requires the signal to *prime* first: for a rising trigger,
//! `prime_limit` consecutive samples below the revert level (the trigger level
//! minus 20% of a division). Only then does the first sample above the trigger
//! level fire. Falling triggers are the mirror image.
//!
//! ```text
//! Priming --(prime_limit samples past revert)--> Armed
//! Armed   --(sample crosses level)-------------> Triggered
//! Triggered --(sweep delivered)----------------> Refractory
//! Refractory --(next_trig_ok_idx reached)------> Priming
//! ```
//!
//! With auto-trigger enabled a synthetic trigger is scheduled so that a sweep is
//! produced even when the signal never crosses the level.

use crate::config::{Direction, Settings};

/// Hysteresis band, in divisions of the trigger source.
const HYSTERESIS_DIV: f64 = 0.2;

/// Minimum number of priming samples.
const MIN_PRIME_SCANS: usize = 10;

/// Priming length as a fraction of the sweep.
const PRIME_FRACTION: f64 = 0.2;

/// Pre/post-trigger split of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepWindow {
    /// Scans delivered before the trigger scan
    pub pretrig_scans: usize,
    /// Scans delivered from the trigger scan on
    pub posttrig_scans: usize,
}

impl SweepWindow {
    /// Split a sweep of `per_scans` with `pretrig_scans` before the trigger.
    ///
    /// The pre-trigger part is clamped to the sweep length.
    pub fn new(pretrig_scans: usize, per_scans: usize) -> Self {
        let pretrig_scans = pretrig_scans.min(per_scans);
        Self {
            pretrig_scans,
            posttrig_scans: per_scans - pretrig_scans,
        }
    }

    /// Window described by the timebase and trigger delay.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(pretrig_scans(settings), settings.per_scans())
    }

    /// Scans in one full sweep.
    pub fn per_scans(&self) -> usize {
        self.pretrig_scans + self.posttrig_scans
    }
}

/// Trigger thresholds in volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerLevels {
    /// Level the signal must cross to trigger
    pub trig_volt: f64,
    /// Level the signal must stay beyond while priming
    pub trig_revert: f64,
    /// Consecutive priming samples required before a crossing counts
    pub prime_limit: usize,
}

impl TriggerLevels {
    /// Thresholds for the configured trigger source, `None` if it does not exist.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let trig = &settings.trigger;
        let channel = settings.channels.get(trig.source)?;
        let trig_volt = (trig.level_div - channel.offset_div) * channel.unit_div;
        let trig_revert = trig_volt - trig.direction.sign() * HYSTERESIS_DIV * channel.unit_div;
        let prime_limit =
            MIN_PRIME_SCANS.max((PRIME_FRACTION * settings.per_scans() as f64) as usize);
        Some(Self {
            trig_volt,
            trig_revert,
            prime_limit,
        })
    }
}

/// Mutable detector state, reset on every reconfigure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerState {
    /// Absolute index of the trigger whose sweep is in flight
    pub trig_idx: Option<u64>,
    /// One past the last scan of the sweep in flight
    pub sweep_end_idx: u64,
    /// Consecutive priming samples seen so far
    pub primed_count: usize,
    /// No trigger search before this absolute index
    pub next_trig_ok_idx: u64,
    /// Scheduled auto-trigger position, if auto-triggering
    pub next_auto_trig_idx: Option<u64>,
}

/// Where the detector is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPhase {
    /// Counting samples beyond the revert level
    Priming,
    /// Primed; the next crossing fires
    Armed,
    /// A sweep is being delivered
    Triggered,
    /// Waiting out the period after the last trigger
    Refractory,
}

/// Origin of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// The signal crossed the level
    Natural,
    /// The auto-trigger schedule expired
    Auto,
}

/// A confirmed trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Absolute scan index of the trigger
    pub index: u64,
    /// Natural or synthetic
    pub kind: TriggerKind,
}

/// Schmitt-trigger state machine.
#[derive(Debug, Clone)]
pub struct TriggerDetector {
    direction: Direction,
    levels: TriggerLevels,
    window: SweepWindow,
    auto: bool,
    auto_margin_scans: u64,
    state: TriggerState,
}

impl TriggerDetector {
    /// Create a detector whose first auto-trigger is scheduled relative to `write_idx`.
    pub fn new(
        direction: Direction,
        levels: TriggerLevels,
        window: SweepWindow,
        auto: bool,
        auto_margin_scans: u64,
        write_idx: u64,
    ) -> Self {
        let mut detector = Self {
            direction,
            levels,
            window,
            auto,
            auto_margin_scans,
            state: TriggerState::default(),
        };
        detector.schedule_auto(write_idx);
        detector
    }

    /// Detector for the configured trigger, `None` if triggering is disabled or
    /// the source channel does not exist.
    pub fn from_settings(settings: &Settings, write_idx: u64) -> Option<Self> {
        if !settings.trigger.enabled {
            return None;
        }
        let levels = TriggerLevels::from_settings(settings)?;
        Some(Self::new(
            settings.trigger.direction,
            levels,
            SweepWindow::from_settings(settings),
            settings.trigger.auto,
            auto_margin_scans(settings),
            write_idx,
        ))
    }

    /// Pick up changed levels, delay or auto mode without resetting the state.
    ///
    /// The sweep length stays as configured; a new delay applies from the next
    /// trigger on. The auto-trigger is rescheduled relative to `write_idx`.
    pub fn rethreshold(&mut self, settings: &Settings, write_idx: u64) {
        if let Some(levels) = TriggerLevels::from_settings(settings) {
            self.levels = levels;
        }
        self.direction = settings.trigger.direction;
        self.window = SweepWindow::new(pretrig_scans(settings), self.window.per_scans());
        self.auto = settings.trigger.auto;
        self.auto_margin_scans = auto_margin_scans(settings);
        self.schedule_auto(write_idx);
    }

    /// Current state.
    pub fn state(&self) -> &TriggerState {
        &self.state
    }

    /// Current thresholds.
    pub fn levels(&self) -> &TriggerLevels {
        &self.levels
    }

    /// Current sweep window.
    pub fn window(&self) -> SweepWindow {
        self.window
    }

    /// Trigger whose sweep is in flight.
    pub fn trig_idx(&self) -> Option<u64> {
        self.state.trig_idx
    }

    /// End of the sweep in flight, fixed when its trigger fired.
    pub fn sweep_end(&self) -> Option<u64> {
        self.state.trig_idx.map(|_| self.state.sweep_end_idx)
    }

    /// Phase of the cycle given how many scans have been written.
    pub fn phase(&self, write_idx: u64) -> TriggerPhase {
        if self.state.trig_idx.is_some() {
            TriggerPhase::Triggered
        } else if write_idx < self.state.next_trig_ok_idx {
            TriggerPhase::Refractory
        } else if self.state.primed_count >= self.levels.prime_limit {
            TriggerPhase::Armed
        } else {
            TriggerPhase::Priming
        }
    }

    /// Inspect a freshly written block of the trigger channel.
    ///
    /// `samples` holds the `len` trigger-channel values of absolute scans
    /// `[origin, origin + len)`. `history_start` is the oldest scan a consumer
    /// can still read; an auto trigger is placed so that a full pre-trigger
    /// window lies at or after it.
    pub fn scan<I>(
        &mut self,
        origin: u64,
        len: usize,
        samples: I,
        history_start: u64,
    ) -> Option<TriggerEvent>
    where
        I: IntoIterator<Item = f64>,
    {
        if self.state.trig_idx.is_some() {
            return None;
        }
        let end = origin + len as u64;
        if end <= self.state.next_trig_ok_idx {
            return None;
        }

        let skip = self.state.next_trig_ok_idx.saturating_sub(origin);
        if let Some(index) = self.hunt(samples.into_iter().skip(skip as usize), origin + skip) {
            return Some(self.fire(index, TriggerKind::Natural));
        }

        match self.state.next_auto_trig_idx {
            Some(due) if end > due => {
                let earliest = history_start + self.window.pretrig_scans as u64;
                Some(self.fire(due.max(earliest), TriggerKind::Auto))
            }
            _ => None,
        }
    }

    /// Release the detector after the in-flight sweep has been delivered.
    pub fn complete_sweep(&mut self) {
        self.state.trig_idx = None;
    }

    fn hunt<I>(&mut self, samples: I, start: u64) -> Option<u64>
    where
        I: Iterator<Item = f64>,
    {
        let TriggerLevels {
            trig_volt,
            trig_revert,
            prime_limit,
        } = self.levels;
        let pretrig = self.window.pretrig_scans as u64;

        for (idx, value) in (start..).zip(samples) {
            if self.state.primed_count < prime_limit {
                let primes = match self.direction {
                    Direction::Up => value < trig_revert,
                    Direction::Down => value > trig_revert,
                };
                if primes {
                    self.state.primed_count += 1;
                } else {
                    self.state.primed_count = 0;
                }
                continue;
            }

            let crosses = match self.direction {
                Direction::Up => value > trig_volt,
                Direction::Down => value < trig_volt,
            };
            if crosses && idx >= pretrig {
                return Some(idx);
            }
        }
        None
    }

    fn fire(&mut self, index: u64, kind: TriggerKind) -> TriggerEvent {
        let per = self.window.per_scans() as u64;
        self.state.trig_idx = Some(index);
        self.state.sweep_end_idx = index + self.window.posttrig_scans as u64;
        self.state.next_trig_ok_idx = index + per;
        self.state.primed_count = 0;
        if self.auto {
            self.state.next_auto_trig_idx = Some(index + 2 * per + self.auto_margin_scans);
        }
        TriggerEvent { index, kind }
    }

    fn schedule_auto(&mut self, write_idx: u64) {
        self.state.next_auto_trig_idx = self
            .auto
            .then(|| write_idx + self.window.per_scans() as u64 + self.auto_margin_scans);
    }
}

fn pretrig_scans(settings: &Settings) -> usize {
    (settings.trigger.delay_div * settings.scans_per_division())
        .round()
        .max(0.0) as usize
}

fn auto_margin_scans(settings: &Settings) -> u64 {
    (settings.trigger.auto_margin_s * settings.hardware.acq_rate_hz)
        .round()
        .max(0.0) as u64
}
