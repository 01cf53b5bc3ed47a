//! Sequence generators — what produces a response from a call.
//!
//! The interaction treats a generator as a black box that may take any
//! amount of wall-clock time. Two are built in: `EchoGenerator` (repeats the
//! call, deterministic) and `RandomWalkGenerator` (temperature-scaled melodic
//! walk seeded from the call's range).

use crate::types::{Note, TimedSequence};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generate window ends before it starts ({start:.3}s > {end:.3}s)")]
    InvalidWindow { start: f64, end: f64 },

    #[error("generation failed: {0}")]
    Failed(String),
}

/// Half-open time range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOptions {
    /// Part of the seed to condition on
    pub input_window: TimeWindow,
    /// Part of the timeline to fill
    pub generate_window: TimeWindow,
    /// Sampling temperature; higher is wilder
    pub temperature: f64,
}

impl GeneratorOptions {
    fn check(&self) -> Result<(), GeneratorError> {
        let w = self.generate_window;
        if w.end < w.start {
            return Err(GeneratorError::InvalidWindow {
                start: w.start,
                end: w.end,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorDetails {
    pub id: String,
    pub description: String,
}

/// Produces a new sequence from a seed.
///
/// Implementations may block for an unbounded time; callers needing a
/// deadline must impose it themselves.
pub trait SequenceGenerator: Send + Sync {
    fn details(&self) -> &GeneratorDetails;

    fn generate(
        &self,
        seed: &TimedSequence,
        options: &GeneratorOptions,
    ) -> Result<TimedSequence, GeneratorError>;
}

// ─── Echo ───────────────────────────────────────────────────────────────────

/// Repeats the notes of the input window back, tiled across the generate window.
pub struct EchoGenerator {
    details: GeneratorDetails,
}

impl EchoGenerator {
    pub fn new() -> Self {
        Self {
            details: GeneratorDetails {
                id: "echo".into(),
                description: "Repeats the call phrase".into(),
            },
        }
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGenerator for EchoGenerator {
    fn details(&self) -> &GeneratorDetails {
        &self.details
    }

    fn generate(
        &self,
        seed: &TimedSequence,
        options: &GeneratorOptions,
    ) -> Result<TimedSequence, GeneratorError> {
        options.check()?;
        let input = options.input_window;
        let window = options.generate_window;
        let mut out = TimedSequence::new(seed.qpm);

        let phrase: Vec<&Note> = seed
            .notes
            .iter()
            .filter(|n| n.start_time >= input.start && n.start_time < input.end)
            .collect();
        let period = input.duration();

        if !phrase.is_empty() && period > 0.0 {
            let mut offset = window.start - input.start;
            while input.start + offset < window.end {
                for note in &phrase {
                    let start = note.start_time + offset;
                    if start >= window.end {
                        break;
                    }
                    out.push(Note::new(
                        note.pitch,
                        note.velocity,
                        start,
                        (note.end_time + offset).min(window.end),
                    ));
                }
                offset += period;
            }
        }

        out.total_time = out.total_time.max(window.end);
        Ok(out)
    }
}

// ─── Random walk ────────────────────────────────────────────────────────────

const DEFAULT_PITCH: u8 = 60;
const DEFAULT_VELOCITY: u8 = 90;

/// Sixteenth-note melodic random walk around the seed's register.
///
/// Temperature widens the step size and raises the chance of rests.
pub struct RandomWalkGenerator {
    details: GeneratorDetails,
    rng: Mutex<StdRng>,
}

impl RandomWalkGenerator {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Reproducible output for a given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            details: GeneratorDetails {
                id: "random_walk".into(),
                description: "Temperature-scaled melodic random walk".into(),
            },
            rng: Mutex::new(rng),
        }
    }
}

impl Default for RandomWalkGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGenerator for RandomWalkGenerator {
    fn details(&self) -> &GeneratorDetails {
        &self.details
    }

    fn generate(
        &self,
        seed: &TimedSequence,
        options: &GeneratorOptions,
    ) -> Result<TimedSequence, GeneratorError> {
        options.check()?;
        let input = options.input_window;
        let window = options.generate_window;
        let temperature = options.temperature.max(0.0);

        let qpm = if seed.qpm > 0.0 {
            seed.qpm
        } else {
            TimedSequence::DEFAULT_QPM
        };
        let step = 60.0 / qpm / 4.0;

        let mut phrase: Vec<&Note> = seed
            .notes
            .iter()
            .filter(|n| n.start_time >= input.start && n.start_time < input.end)
            .collect();
        phrase.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        let (lo, hi, mut last, velocity) = if phrase.is_empty() {
            (DEFAULT_PITCH - 12, DEFAULT_PITCH + 12, DEFAULT_PITCH, DEFAULT_VELOCITY)
        } else {
            let lo = phrase.iter().map(|n| n.pitch).min().unwrap_or(DEFAULT_PITCH);
            let hi = phrase.iter().map(|n| n.pitch).max().unwrap_or(DEFAULT_PITCH);
            let vel = phrase.iter().map(|n| n.velocity as u32).sum::<u32>() / phrase.len() as u32;
            let last = phrase.last().map(|n| n.pitch).unwrap_or(DEFAULT_PITCH);
            (
                lo.saturating_sub(12),
                hi.saturating_add(12).min(127),
                last,
                vel.clamp(1, 127) as u8,
            )
        };

        let rest_chance = (0.1 * temperature).min(0.6);
        let max_step = (2.0 + 3.0 * temperature).round() as i32;

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| GeneratorError::Failed("random source poisoned".into()))?;

        let mut out = TimedSequence::new(qpm);
        let mut t = window.start;
        while t + step * 0.5 < window.end {
            if rng.gen::<f64>() < rest_chance {
                t += step;
                continue;
            }
            let delta = rng.gen_range(-max_step..=max_step);
            let pitch = (last as i32 + delta).clamp(lo as i32, hi as i32) as u8;
            let len = step * rng.gen_range(1..=4) as f64;
            let end = (t + len).min(window.end);
            out.push(Note::new(pitch, velocity, t, end));
            last = pitch;
            t += len;
        }

        out.total_time = out.total_time.max(window.end);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> TimedSequence {
        let mut seq = TimedSequence::new(120.0);
        seq.push(Note::new(60, 100, 0.0, 0.5));
        seq.push(Note::new(62, 80, 0.5, 1.0));
        seq.push(Note::new(64, 90, 1.0, 2.0));
        seq.total_time = 2.0;
        seq
    }

    fn options(input_end: f64, gen_start: f64, gen_end: f64, temperature: f64) -> GeneratorOptions {
        GeneratorOptions {
            input_window: TimeWindow::new(0.0, input_end),
            generate_window: TimeWindow::new(gen_start, gen_end),
            temperature,
        }
    }

    #[test]
    fn test_echo_repeats_phrase() {
        let out = EchoGenerator::new()
            .generate(&call(), &options(2.0, 2.0, 6.0, 1.0))
            .unwrap();
        assert_eq!(out.len(), 6);
        let starts: Vec<f64> = out.notes.iter().map(|n| n.start_time).collect();
        assert_eq!(starts, vec![2.0, 2.5, 3.0, 4.0, 4.5, 5.0]);
        assert_eq!(out.notes[3].pitch, 60);
        assert_eq!(out.total_time, 6.0);
    }

    #[test]
    fn test_echo_truncates_at_window_end() {
        let out = EchoGenerator::new()
            .generate(&call(), &options(2.0, 2.0, 3.25, 1.0))
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out.notes[2].end_time, 3.25);
        assert_eq!(out.total_time, 3.25);
    }

    #[test]
    fn test_echo_of_silence_is_empty() {
        let out = EchoGenerator::new()
            .generate(&TimedSequence::empty(), &options(2.0, 2.0, 4.0, 1.0))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(out.total_time, 4.0);
    }

    #[test]
    fn test_rejects_inverted_window() {
        let err = EchoGenerator::new().generate(&call(), &options(2.0, 4.0, 3.0, 1.0));
        assert!(matches!(err, Err(GeneratorError::InvalidWindow { .. })));
    }

    #[test]
    fn test_zero_width_window_is_empty() {
        let echo = EchoGenerator::new()
            .generate(&call(), &options(2.0, 3.0, 3.0, 1.0))
            .unwrap();
        assert!(echo.is_empty());
        let walk = RandomWalkGenerator::with_seed(3)
            .generate(&call(), &options(2.0, 3.0, 3.0, 1.0))
            .unwrap();
        assert!(walk.is_empty());
    }

    #[test]
    fn test_random_walk_stays_in_window_and_range() {
        let gen = RandomWalkGenerator::with_seed(7);
        for temperature in [0.1, 1.0, 2.0] {
            let out = gen.generate(&call(), &options(2.0, 2.0, 6.0, temperature)).unwrap();
            for n in &out.notes {
                assert!(n.start_time >= 2.0 && n.start_time < 6.0);
                assert!(n.end_time <= 6.0 && n.end_time >= n.start_time);
                assert!((48..=76).contains(&n.pitch), "pitch {} out of range", n.pitch);
            }
            assert_eq!(out.total_time, 6.0);
        }
    }

    #[test]
    fn test_random_walk_is_reproducible() {
        let a = RandomWalkGenerator::with_seed(42)
            .generate(&call(), &options(2.0, 2.0, 4.0, 1.0))
            .unwrap();
        let b = RandomWalkGenerator::with_seed(42)
            .generate(&call(), &options(2.0, 2.0, 4.0, 1.0))
            .unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
