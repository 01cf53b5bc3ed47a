//! Interaction configuration — control-number bindings, signals and tick source.
//!
//! `InteractionConfig` is the serializable form (JSON file and CLI flags both
//! land here). `validate` turns it into the typed `CallAndResponseConfig`
//! the state machine runs with.

use crate::signals::MidiSignal;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one sequence generator is required")]
    NoGenerators,

    #[error("a generator select control is required when {count} generators are configured")]
    AmbiguousGeneratorSelection { count: usize },

    #[error("exactly one of clock signal or tick duration must be specified")]
    TickSource,

    #[error("tick duration must be a positive number of seconds, got {0}")]
    InvalidTickDuration(f64),

    #[error("tempo must be a positive number of quarter notes per minute, got {0}")]
    InvalidTempo(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Parse(#[from] serde_json::Error),
}

// ─── Control bindings ───────────────────────────────────────────────────────

/// Controller numbers whose live values drive interaction parameters.
/// Unbound (None) controls fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlMap {
    pub generator_select: Option<u8>,
    /// qpm = value + 60
    pub tempo: Option<u8>,
    pub temperature: Option<u8>,
    pub min_listen_ticks: Option<u8>,
    pub max_listen_ticks: Option<u8>,
    pub response_ticks: Option<u8>,
    /// Looping is on while this control reads 127
    pub loop_enabled: Option<u8>,
}

/// Linear mapping of a 0-127 control onto a generation temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureRange {
    pub min: f64,
    pub max: f64,
    /// Used while the temperature control has no value
    pub default: f64,
}

impl Default for TemperatureRange {
    fn default() -> Self {
        Self {
            min: 0.1,
            max: 2.0,
            default: 1.0,
        }
    }
}

impl TemperatureRange {
    pub fn map(&self, value: Option<u8>) -> f64 {
        match value {
            None => self.default,
            Some(v) => self.min + (v.min(127) as f64 / 127.0) * (self.max - self.min),
        }
    }
}

// ─── Tick source ────────────────────────────────────────────────────────────

/// What drives the tick loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickSource {
    /// Internal clock with a fixed period in seconds
    Period(f64),
    /// External pulse: a tick each time this signal arrives
    Signal(MidiSignal),
}

impl TickSource {
    pub fn is_period(&self) -> bool {
        matches!(self, TickSource::Period(_))
    }
}

// ─── Interaction config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    /// Tempo used until the tempo control is moved
    pub qpm: f64,
    pub clock_signal: Option<MidiSignal>,
    /// Seconds per tick; typically one bar
    pub tick_duration: Option<f64>,
    pub end_call_signal: Option<MidiSignal>,
    pub panic_signal: Option<MidiSignal>,
    pub mutate_signal: Option<MidiSignal>,
    /// Keep capturing while the response plays
    pub allow_overlap: bool,
    /// 0-based; ignored when a clock signal drives the ticks
    pub metronome_channel: Option<u8>,
    /// Controller that receives 0/1/2 on Idle/Listening/Responding
    pub state_control: Option<u8>,
    pub controls: ControlMap,
    pub temperature: TemperatureRange,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            qpm: 120.0,
            clock_signal: None,
            tick_duration: None,
            end_call_signal: None,
            panic_signal: None,
            mutate_signal: None,
            allow_overlap: false,
            metronome_channel: None,
            state_control: None,
            controls: ControlMap::default(),
            temperature: TemperatureRange::default(),
        }
    }
}

/// Validated settings for the call-and-response loop.
#[derive(Debug, Clone, PartialEq)]
pub struct CallAndResponseConfig {
    pub tick_source: TickSource,
    pub end_call_signal: Option<MidiSignal>,
    pub panic_signal: Option<MidiSignal>,
    pub mutate_signal: Option<MidiSignal>,
    pub allow_overlap: bool,
    pub metronome_channel: Option<u8>,
    pub state_control: Option<u8>,
}

impl CallAndResponseConfig {
    /// Config with the given tick source and nothing else bound.
    pub fn new(tick_source: TickSource) -> Self {
        Self {
            tick_source,
            end_call_signal: None,
            panic_signal: None,
            mutate_signal: None,
            allow_overlap: false,
            metronome_channel: None,
            state_control: None,
        }
    }
}

impl InteractionConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        info!("Loaded interaction config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Interaction config saved to {:?}", path);
        Ok(())
    }

    /// Checks the tempo, the exactly-one-of tick source rule and tick
    /// duration sign.
    pub fn validate(&self) -> Result<CallAndResponseConfig, ConfigError> {
        if !(self.qpm.is_finite() && self.qpm > 0.0) {
            return Err(ConfigError::InvalidTempo(self.qpm));
        }
        let tick_source = match (self.clock_signal, self.tick_duration) {
            (Some(signal), None) => TickSource::Signal(signal),
            (None, Some(d)) if d.is_finite() && d > 0.0 => TickSource::Period(d),
            (None, Some(d)) => return Err(ConfigError::InvalidTickDuration(d)),
            _ => return Err(ConfigError::TickSource),
        };
        Ok(CallAndResponseConfig {
            tick_source,
            end_call_signal: self.end_call_signal,
            panic_signal: self.panic_signal,
            mutate_signal: self.mutate_signal,
            allow_overlap: self.allow_overlap,
            metronome_channel: self.metronome_channel,
            state_control: self.state_control,
        })
    }
}
