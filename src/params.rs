use crate::config::{ConfigError, ControlMap, TemperatureRange};
use crate::generator::SequenceGenerator;
use crate::hub::ControlSource;
use std::fmt;
use std::sync::Arc;

/// Added to the tempo control value to get qpm.
pub const BASE_QPM: f64 = 60.0;

/// Control value that switches looping on.
pub const LOOP_ON_VALUE: u8 = 127;

/// Upper bound on call length in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenLimit {
    Unbounded,
    Ticks(u32),
}

impl ListenLimit {
    /// True once `listen_ticks` has hit the limit (inclusive).
    pub fn reached(&self, listen_ticks: u32) -> bool {
        match *self {
            ListenLimit::Unbounded => false,
            ListenLimit::Ticks(max) => listen_ticks >= max,
        }
    }
}

impl fmt::Display for ListenLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenLimit::Unbounded => f.write_str("unbounded"),
            ListenLimit::Ticks(n) => write!(f, "{}", n),
        }
    }
}

/// Resolves interaction parameters from live control values.
///
/// Every accessor reads the control source afresh; nothing is cached, so a
/// knob turned mid-performance takes effect on the next tick. Reads are
/// lock-free on the hub side and safe to call from the tick loop at any time.
pub struct ParameterResolver {
    controls: Arc<dyn ControlSource>,
    map: ControlMap,
    default_qpm: f64,
    temperature: TemperatureRange,
    generators: Vec<Arc<dyn SequenceGenerator>>,
}

impl ParameterResolver {
    pub fn new(
        controls: Arc<dyn ControlSource>,
        map: ControlMap,
        default_qpm: f64,
        temperature: TemperatureRange,
        generators: Vec<Arc<dyn SequenceGenerator>>,
    ) -> Result<Self, ConfigError> {
        if generators.is_empty() {
            return Err(ConfigError::NoGenerators);
        }
        if generators.len() > 1 && map.generator_select.is_none() {
            return Err(ConfigError::AmbiguousGeneratorSelection {
                count: generators.len(),
            });
        }
        Ok(Self {
            controls,
            map,
            default_qpm,
            temperature,
            generators,
        })
    }

    fn value(&self, control: Option<u8>) -> Option<u8> {
        control.and_then(|c| self.controls.control_value(c))
    }

    pub fn qpm(&self) -> f64 {
        match self.value(self.map.tempo) {
            Some(v) => v as f64 + BASE_QPM,
            None => self.default_qpm,
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.map(self.value(self.map.temperature))
    }

    pub fn generator_index(&self) -> usize {
        if self.generators.len() == 1 {
            return 0;
        }
        let val = self.value(self.map.generator_select).unwrap_or(0);
        val as usize % self.generators.len()
    }

    pub fn generator(&self) -> &Arc<dyn SequenceGenerator> {
        &self.generators[self.generator_index()]
    }

    pub fn min_listen_ticks(&self) -> u32 {
        self.value(self.map.min_listen_ticks).unwrap_or(0) as u32
    }

    /// Unset or zero means no limit.
    pub fn max_listen_ticks(&self) -> ListenLimit {
        match self.value(self.map.max_listen_ticks) {
            None | Some(0) => ListenLimit::Unbounded,
            Some(n) => ListenLimit::Ticks(n as u32),
        }
    }

    /// Unset or zero means "as long as the call".
    pub fn response_ticks(&self) -> Option<u32> {
        match self.value(self.map.response_ticks) {
            None | Some(0) => None,
            Some(n) => Some(n as u32),
        }
    }

    pub fn loop_enabled(&self) -> bool {
        self.value(self.map.loop_enabled) == Some(LOOP_ON_VALUE)
    }
}
