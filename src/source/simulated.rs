//! Real-time paced signal simulator.
//!
//! Each connected channel carries a unit sine whose frequency depends on the
//! hardware input it is wired to, plus Gaussian noise. Scans become available
//! at the configured rate of wall-clock time since [`DataSource::run`], and a
//! tokio ticker raises "data available" once per delivery period.

use super::{spawn_ticker, DataSource};
use crate::config::Settings;
use crate::error::AppResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Sine frequency of each hardware input, in Hz.
pub const FREQUENCIES_HZ: [f64; 8] = [3.0, 10.0, 30.0, 100.0, 300.0, 1.0, 0.3, 0.1];

/// Standard deviation of the added noise, in volts.
pub const NOISE_V: f64 = 0.1;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Delivery period for a sweep of `sweep_seconds`.
///
/// Long sweeps are delivered in hundredths, mid-range sweeps every 100 ms and
/// short sweeps once per sweep.
pub fn delivery_period(sweep_seconds: f64) -> Duration {
    let secs = if sweep_seconds >= 10.0 {
        sweep_seconds / 100.0
    } else if sweep_seconds >= 0.1 {
        0.1
    } else {
        sweep_seconds.max(0.0)
    };
    Duration::from_secs_f64(secs).max(MIN_PERIOD)
}

/// Simulated acquisition board.
#[derive(Debug)]
pub struct SimulatedSource {
    rate_hz: f64,
    inputs: Vec<usize>,
    period: Duration,
    rng: StdRng,
    started: Option<Instant>,
    produced: u64,
    ticker: Option<JoinHandle<()>>,
    notify: Arc<Notify>,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSource {
    /// Simulator with a random noise seed.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Simulator with reproducible noise.
    pub fn with_seed(seed: u64) -> Self {
        let defaults = Settings::default();
        let mut source = Self {
            rate_hz: 0.0,
            inputs: Vec::new(),
            period: MIN_PERIOD,
            rng: StdRng::seed_from_u64(seed),
            started: None,
            produced: 0,
            ticker: None,
            notify: Arc::new(Notify::new()),
        };
        source.apply(&defaults);
        source
    }

    /// Interval between "data available" notifications.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Scans handed out since the last `run`.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Fill `rows` scans starting at scan number `first` into `dst`.
    pub fn synthesize(&mut self, dst: &mut [f64], first: u64, rows: usize) {
        let ch = self.inputs.len();
        for r in 0..rows {
            let t = (first + r as u64) as f64 / self.rate_hz;
            for (c, &hw) in self.inputs.iter().enumerate() {
                let f = FREQUENCIES_HZ[hw % FREQUENCIES_HZ.len()];
                let noise: f64 = self.rng.sample(StandardNormal);
                dst[r * ch + c] = (TAU * f * t).sin() + NOISE_V * noise;
            }
        }
    }

    fn apply(&mut self, settings: &Settings) {
        self.rate_hz = settings.hardware.acq_rate_hz;
        self.inputs = settings.connected_inputs();
        self.period = delivery_period(settings.sweep_seconds());
        self.produced = 0;
    }
}

impl DataSource for SimulatedSource {
    fn name(&self) -> &str {
        "dummy"
    }

    fn reconfigure(&mut self, settings: &Settings) -> AppResult<()> {
        self.stop();
        self.apply(settings);
        debug!(
            rate_hz = self.rate_hz,
            inputs = ?self.inputs,
            period_ms = self.period.as_millis() as u64,
            "simulator reconfigured"
        );
        Ok(())
    }

    fn run(&mut self) -> AppResult<bool> {
        self.stop();
        let Some(ticker) = spawn_ticker(self.period, self.notify.clone()) else {
            warn!("simulator needs a tokio runtime to pace delivery");
            return Ok(false);
        };
        self.ticker = Some(ticker);
        self.started = Some(Instant::now());
        self.produced = 0;
        Ok(true)
    }

    fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.started = None;
    }

    fn channel_count(&self) -> usize {
        self.inputs.len()
    }

    fn get_data(&mut self, dst: &mut [f64]) -> AppResult<usize> {
        let ch = self.inputs.len();
        let Some(started) = self.started else {
            return Ok(0);
        };
        if ch == 0 {
            return Ok(0);
        }
        let due = (started.elapsed().as_secs_f64() * self.rate_hz) as u64;
        let rows = (due.saturating_sub(self.produced) as usize).min(dst.len() / ch);
        let first = self.produced;
        self.synthesize(dst, first, rows);
        self.produced += rows as u64;
        Ok(rows)
    }

    fn data_ready(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_period() {
        assert_eq!(delivery_period(20.0), Duration::from_millis(200));
        assert_eq!(delivery_period(1.0), Duration::from_millis(100));
        assert_eq!(delivery_period(0.05), Duration::from_millis(50));
        assert_eq!(delivery_period(0.0), MIN_PERIOD);
    }

    #[test]
    fn test_run_without_runtime_refuses() {
        let mut source = SimulatedSource::with_seed(1);
        assert!(!source.run().unwrap());
        let mut dst = vec![0.0; 64];
        assert_eq!(source.get_data(&mut dst).unwrap(), 0);
    }

    #[test]
    fn test_synthesized_signal_follows_input_frequency() {
        let mut settings = Settings::default();
        settings.hardware.acq_rate_hz = 1200.0;
        settings.channels[1].hw = Some(4);
        let mut source = SimulatedSource::with_seed(7);
        source.reconfigure(&settings).unwrap();
        assert_eq!(source.channel_count(), 2);

        // one second: 3 Hz on input 0, 300 Hz on input 4
        let rows = 1200;
        let mut dst = vec![0.0; rows * 2];
        source.synthesize(&mut dst, 0, rows);
        let mean: f64 = dst.chunks(2).map(|s| s[0]).sum::<f64>() / rows as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        // quarter period of the 3 Hz sine lands near its peak
        assert!((dst[100 * 2] - 1.0).abs() < 0.6);
        assert!(dst.iter().all(|v| v.abs() < 2.0));
    }

    #[tokio::test]
    async fn test_paced_delivery() {
        let mut settings = Settings::default();
        settings.hardware.acq_rate_hz = 10_000.0;
        let mut source = SimulatedSource::with_seed(3);
        source.reconfigure(&settings).unwrap();
        assert!(source.run().unwrap());

        let ready = source.data_ready();
        tokio::time::timeout(Duration::from_secs(2), ready.notified())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut dst = vec![0.0; 100_000 * 2];
        let n = source.get_data(&mut dst).unwrap();
        assert!(n >= 200, "only {n} scans after 20 ms");
        // nothing new until time passes again
        let again = source.get_data(&mut dst).unwrap();
        assert!(again < 50);

        source.stop();
        assert_eq!(source.get_data(&mut dst).unwrap(), 0);
    }
}
