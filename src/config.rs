//! Configuration system using Figment
//!
//! Settings are layered, lowest to highest precedence:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (by default `config/scope_daq.toml`)
//! 3. Environment variables prefixed with `SCOPE_DAQ_`, nested keys split on `__`
//!
//! ```text
//! SCOPE_DAQ_TRIGGER__ENABLED=true
//! SCOPE_DAQ_TRIGGER__LEVEL_DIV=1.5
//! SCOPE_DAQ_HARDWARE__ACQ_RATE_HZ=20000
//! ```
//!
//! Everything the engine derives from the configuration (sweep length in scans,
//! connected channel list, trigger column) is computed here so that the
//! acquisition code never re-interprets raw settings.

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Maximum number of display channels.
pub const MAX_CHANNELS: usize = 8;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/scope_daq.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "SCOPE_DAQ_";

/// Lowest and highest acquisition rate offered by default (Hz).
const DEFAULT_MIN_RATE_HZ: f64 = 5000.0;
const DEFAULT_MAX_RATE_HZ: f64 = 20000.0;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition backend settings
    pub hardware: HardwareConfig,
    /// Display channels and their connection to hardware inputs
    pub channels: Vec<ChannelConfig>,
    /// Timebase
    pub horizontal: HorizontalConfig,
    /// Trigger settings
    pub trigger: TriggerConfig,
    /// Disk capture settings
    pub capture: CaptureConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Acquisition backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Built-in signal simulator
    Dummy,
    /// Playback of a previously captured file
    Replay,
    /// National Instruments DAQ boards
    Nidaq,
    /// picoDAQ boards
    Picodaq,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AdapterKind::Dummy => "dummy",
            AdapterKind::Replay => "replay",
            AdapterKind::Nidaq => "nidaq",
            AdapterKind::Picodaq => "picodaq",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dummy" => Ok(AdapterKind::Dummy),
            "replay" => Ok(AdapterKind::Replay),
            "nidaq" => Ok(AdapterKind::Nidaq),
            "picodaq" => Ok(AdapterKind::Picodaq),
            other => Err(invalid(format!(
                "Unknown adapter '{other}'. Must be one of: dummy, replay, nidaq, picodaq"
            ))),
        }
    }
}

/// Acquisition backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Which backend produces the scans
    pub adapter: AdapterKind,
    /// Backend-specific device name (e.g. "Dev1")
    #[serde(default)]
    pub device: Option<String>,
    /// Sampling rate per channel in Hz
    pub acq_rate_hz: f64,
    /// Capture file played back by the replay adapter
    #[serde(default)]
    pub replay_file: Option<PathBuf>,
}

/// One display channel.
///
/// `hw` names the hardware input feeding this channel; a channel without one is
/// not acquired at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Hardware input index, absent when the channel is not connected
    #[serde(default)]
    pub hw: Option<usize>,
    /// Volts per vertical division
    #[serde(default = "default_unit_div")]
    pub unit_div: f64,
    /// Vertical position of zero volts, in divisions
    #[serde(default)]
    pub offset_div: f64,
    /// Physical units per volt
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Physical unit label
    #[serde(default = "default_units")]
    pub units: String,
}

/// Timebase configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizontalConfig {
    /// Seconds per horizontal division
    pub s_div: f64,
    /// Visible horizontal range in divisions
    pub xlim: [f64; 2],
}

/// Trigger edge direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Trigger when the signal rises through the level
    Up,
    /// Trigger when the signal falls through the level
    Down,
}

impl Direction {
    /// +1 for rising, -1 for falling.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }
}

/// Trigger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Align sweeps to trigger events; when false data streams continuously
    pub enabled: bool,
    /// Emit a synthetic trigger when no natural one occurs in time
    pub auto: bool,
    /// Display channel carrying the trigger signal
    pub source: usize,
    /// Trigger level in divisions of the source channel
    pub level_div: f64,
    /// Edge direction
    pub direction: Direction,
    /// Trigger position within the sweep, in divisions from its start
    pub delay_div: f64,
    /// Extra wait before an auto trigger, in seconds
    #[serde(default = "default_auto_margin")]
    pub auto_margin_s: f64,
}

/// Disk capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Mirror delivered scans to disk while running
    pub enabled: bool,
    /// Directory receiving capture files
    pub directory: PathBuf,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_unit_div() -> f64 {
    1.0
}

fn default_scale() -> f64 {
    1.0
}

fn default_units() -> String {
    "V".to_string()
}

fn default_auto_margin() -> f64 {
    1.0
}

/// 1-2-5 series of values between `min` and `max`, both ends included.
pub fn reasonable_values(min: f64, max: f64) -> Vec<f64> {
    if !(min > 0.0 && max >= min) {
        return Vec::new();
    }
    let first_decade = min.log10().floor() as i32;
    let last_decade = (max + 1.0).log10().ceil() as i32;
    let mut choices = vec![min];
    for decade in first_decade..last_decade {
        let base = 10f64.powi(decade);
        for step in [1.0, 2.0, 5.0] {
            let value = step * base;
            if value >= min && value <= max && choices.last() != Some(&value) {
                choices.push(value);
            }
        }
    }
    if choices.last().is_some_and(|&last| last < max) {
        choices.push(max);
    }
    choices
}

impl Default for Settings {
    fn default() -> Self {
        let rates = reasonable_values(DEFAULT_MIN_RATE_HZ, DEFAULT_MAX_RATE_HZ);
        let acq_rate_hz = rates.get(rates.len() / 2).copied().unwrap_or(10000.0);

        let channels = (0..MAX_CHANNELS)
            .map(|k| ChannelConfig {
                hw: (k < 2).then_some(k),
                unit_div: 1.0,
                offset_div: 3.5 - k as f64,
                scale: 1.0,
                units: default_units(),
            })
            .collect();

        Self {
            application: ApplicationConfig {
                name: "scope_daq".to_string(),
                log_level: "info".to_string(),
            },
            hardware: HardwareConfig {
                adapter: AdapterKind::Dummy,
                device: None,
                acq_rate_hz,
                replay_file: None,
            },
            channels,
            horizontal: HorizontalConfig {
                s_div: 0.010,
                xlim: [0.0, 10.0],
            },
            trigger: TriggerConfig {
                enabled: false,
                auto: false,
                source: 0,
                level_div: 0.0,
                direction: Direction::Up,
                delay_div: 5.0,
                auto_margin_s: default_auto_margin(),
            },
            capture: CaptureConfig {
                enabled: false,
                directory: PathBuf::from("."),
            },
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply. The result is validated before it is returned; an
    /// unrecognised adapter is a [`DaqError::Configuration`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let adapter: String = figment.extract_inner("hardware.adapter")?;
        adapter.parse::<AdapterKind>()?;
        let settings: Self = figment.extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(self.hardware.acq_rate_hz.is_finite() && self.hardware.acq_rate_hz > 0.0) {
            return Err(invalid(format!(
                "Invalid acq_rate_hz {}. Must be positive",
                self.hardware.acq_rate_hz
            )));
        }

        if self.hardware.adapter == AdapterKind::Replay && self.hardware.replay_file.is_none() {
            return Err(invalid(
                "Adapter 'replay' requires hardware.replay_file".to_string(),
            ));
        }

        if !(self.horizontal.s_div.is_finite() && self.horizontal.s_div > 0.0) {
            return Err(invalid(format!(
                "Invalid s_div {}. Must be positive",
                self.horizontal.s_div
            )));
        }

        let [x0, x1] = self.horizontal.xlim;
        if !(x1 > x0) {
            return Err(invalid(format!(
                "Invalid xlim [{x0}, {x1}]. Upper limit must exceed lower limit"
            )));
        }

        if self.channels.len() > MAX_CHANNELS {
            return Err(invalid(format!(
                "Too many channels ({}). At most {MAX_CHANNELS} are supported",
                self.channels.len()
            )));
        }

        let mut seen = HashSet::new();
        for (k, channel) in self.channels.iter().enumerate() {
            if !(channel.unit_div.is_finite() && channel.unit_div > 0.0) {
                return Err(invalid(format!(
                    "Channel {k}: unit_div must be positive, got {}",
                    channel.unit_div
                )));
            }
            if let Some(hw) = channel.hw {
                if hw >= MAX_CHANNELS {
                    return Err(invalid(format!(
                        "Channel {k}: hardware input {hw} out of range"
                    )));
                }
                if !seen.insert(hw) {
                    return Err(invalid(format!(
                        "Channel {k}: hardware input {hw} is connected twice"
                    )));
                }
            }
        }

        if self.trigger.enabled {
            let source = self.trigger.source;
            match self.channels.get(source) {
                None => {
                    return Err(invalid(format!(
                        "Trigger source {source} does not exist ({} channels configured)",
                        self.channels.len()
                    )))
                }
                Some(channel) if channel.hw.is_none() => {
                    return Err(invalid(format!(
                        "Trigger source {source} is not connected to a hardware input"
                    )))
                }
                Some(_) => {}
            }

            if !(0.0..=x1 - x0).contains(&self.trigger.delay_div) {
                return Err(invalid(format!(
                    "Trigger delay {} div lies outside the sweep (0 to {} div)",
                    self.trigger.delay_div,
                    x1 - x0
                )));
            }
        }

        if !(self.trigger.auto_margin_s.is_finite() && self.trigger.auto_margin_s >= 0.0) {
            return Err(invalid(format!(
                "Invalid auto_margin_s {}. Must not be negative",
                self.trigger.auto_margin_s
            )));
        }

        Ok(())
    }

    /// Duration of one sweep in seconds.
    pub fn sweep_seconds(&self) -> f64 {
        self.horizontal.s_div * (self.horizontal.xlim[1] - self.horizontal.xlim[0])
    }

    /// Number of scans in one sweep window.
    pub fn per_scans(&self) -> usize {
        (self.sweep_seconds() * self.hardware.acq_rate_hz)
            .round()
            .max(0.0) as usize
    }

    /// Number of scans in one horizontal division.
    pub fn scans_per_division(&self) -> f64 {
        self.horizontal.s_div * self.hardware.acq_rate_hz
    }

    /// Hardware inputs of the connected channels, in display order.
    pub fn connected_inputs(&self) -> Vec<usize> {
        self.channels.iter().filter_map(|c| c.hw).collect()
    }

    /// Number of acquired channels (columns of a scan).
    pub fn channel_count(&self) -> usize {
        self.channels.iter().filter(|c| c.hw.is_some()).count()
    }

    /// Scan column holding the trigger source, if that channel is connected.
    pub fn trigger_column(&self) -> Option<usize> {
        let source = self.trigger.source;
        self.channels.get(source)?.hw?;
        Some(
            self.channels[..source]
                .iter()
                .filter(|c| c.hw.is_some())
                .count(),
        )
    }

    /// Serialize to TOML, e.g. to seed a configuration file.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Cannot serialize settings: {e}")))
    }
}

fn invalid(message: String) -> DaqError {
    DaqError::Configuration(message)
}
