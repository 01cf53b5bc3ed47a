use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

// ─── Notes and timed sequences ──────────────────────────────────────────────

/// A single note with absolute start/end times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// MIDI note number (0-127, 60 = C4)
    pub pitch: u8,
    /// MIDI velocity (1-127)
    pub velocity: u8,
    pub start_time: f64,
    /// Always >= start_time
    pub end_time: f64,
}

impl Note {
    pub fn new(pitch: u8, velocity: u8, start_time: f64, end_time: f64) -> Self {
        Self {
            pitch,
            velocity,
            start_time,
            end_time: end_time.max(start_time),
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// An ordered collection of notes in absolute time, plus the total length
/// (which may run past the last note to represent trailing silence) and the
/// tempo the sequence was captured or generated at.
///
/// Treated as a value: `shifted` and `trimmed` return new sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSequence {
    pub notes: Vec<Note>,
    pub total_time: f64,
    /// Quarters per minute
    pub qpm: f64,
}

impl TimedSequence {
    pub const DEFAULT_QPM: f64 = 120.0;

    pub fn new(qpm: f64) -> Self {
        Self {
            notes: Vec::new(),
            total_time: 0.0,
            qpm,
        }
    }

    /// Empty sequence at the default tempo.
    pub fn empty() -> Self {
        Self::new(Self::DEFAULT_QPM)
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    /// Appends a note, growing `total_time` to cover it.
    pub fn push(&mut self, note: Note) {
        if note.end_time > self.total_time {
            self.total_time = note.end_time;
        }
        self.notes.push(note);
    }

    /// Latest note end time, 0.0 for an empty sequence.
    pub fn last_end_time(&self) -> f64 {
        self.notes
            .iter()
            .map(|n| n.end_time)
            .fold(0.0, f64::max)
    }

    /// Earliest note start time, if any.
    pub fn first_start_time(&self) -> Option<f64> {
        self.notes
            .iter()
            .map(|n| n.start_time)
            .reduce(f64::min)
    }

    /// Returns a copy with every note time and `total_time` offset by `delta`.
    pub fn shifted(&self, delta: f64) -> Self {
        Self {
            notes: self
                .notes
                .iter()
                .map(|n| Note {
                    start_time: n.start_time + delta,
                    end_time: n.end_time + delta,
                    ..*n
                })
                .collect(),
            total_time: self.total_time + delta,
            qpm: self.qpm,
        }
    }

    /// Keeps notes starting inside `[start, end)`, truncating them at `end`.
    /// `total_time` is capped at `end`.
    pub fn trimmed(&self, start: f64, end: f64) -> Self {
        let notes = self
            .notes
            .iter()
            .filter(|n| n.start_time >= start && n.start_time < end)
            .map(|n| Note {
                end_time: n.end_time.min(end),
                ..*n
            })
            .collect();
        Self {
            notes,
            total_time: self.total_time.min(end),
            qpm: self.qpm,
        }
    }

    /// Sorts notes by start time, then pitch.
    pub fn sort(&mut self) {
        self.notes.sort_by(|a, b| {
            a.start_time
                .total_cmp(&b.start_time)
                .then(a.pitch.cmp(&b.pitch))
        });
    }
}

impl Default for TimedSequence {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for TimedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} notes, total={:.3}s, qpm={:.1}",
            self.notes.len(),
            self.total_time,
            self.qpm
        )
    }
}

// ─── Interaction phase ──────────────────────────────────────────────────────

/// Where the call-and-response loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// No active call and nothing left to play
    Idle,
    /// Capturing a call
    Listening,
    /// A response is scheduled or playing
    Responding,
}

impl Phase {
    /// Value sent on the state control change.
    pub fn control_value(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Listening => 1,
            Phase::Responding => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::Listening => "Listening",
            Phase::Responding => "Responding",
        };
        f.write_str(name)
    }
}

// ─── Session clock ──────────────────────────────────────────────────────────

/// Source of "now" in seconds. Every timestamp in a session (captured notes,
/// ticks, response start times) comes from the same clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic clock for the interaction session.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SessionClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to. Used for deterministic replays and tests.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, t: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now = t;
        }
    }

    pub fn advance(&self, dt: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now += dt;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.lock().map(|t| *t).unwrap_or(0.0)
    }
}

// ─── Interaction events ─────────────────────────────────────────────────────

/// Broadcast by the interaction loop to observers (console, event log).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InteractionEvent {
    State {
        time: f64,
        phase: Phase,
    },
    CallSkipped {
        time: f64,
        listen_ticks: u32,
        min_listen_ticks: u32,
    },
    Response {
        time: f64,
        generator: String,
        start_time: f64,
        duration: f64,
        sequence: TimedSequence,
    },
    LateResponse {
        time: f64,
        push_ticks: u32,
    },
    Looped {
        time: f64,
        start_time: f64,
    },
    Mutated {
        time: f64,
        generator: String,
        start_time: f64,
        sequence: TimedSequence,
    },
    MutateIgnored {
        time: f64,
    },
    Panic {
        time: f64,
    },
    Stopped {
        time: f64,
    },
}

impl InteractionEvent {
    pub fn time(&self) -> f64 {
        match self {
            InteractionEvent::State { time, .. }
            | InteractionEvent::CallSkipped { time, .. }
            | InteractionEvent::Response { time, .. }
            | InteractionEvent::LateResponse { time, .. }
            | InteractionEvent::Looped { time, .. }
            | InteractionEvent::Mutated { time, .. }
            | InteractionEvent::MutateIgnored { time }
            | InteractionEvent::Panic { time }
            | InteractionEvent::Stopped { time } => *time,
        }
    }
}

impl fmt::Display for InteractionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionEvent::State { time, phase } => {
                write!(f, "t={:>8.3}s  state      {}", time, phase)
            }
            InteractionEvent::CallSkipped {
                time,
                listen_ticks,
                min_listen_ticks,
            } => write!(
                f,
                "t={:>8.3}s  skipped    call too short ({} < {} ticks)",
                time, listen_ticks, min_listen_ticks
            ),
            InteractionEvent::Response {
                time,
                generator,
                start_time,
                duration,
                sequence,
            } => write!(
                f,
                "t={:>8.3}s  response   '{}' {} notes @ {:.3}s for {:.3}s",
                time,
                generator,
                sequence.len(),
                start_time,
                duration
            ),
            InteractionEvent::LateResponse { time, push_ticks } => write!(
                f,
                "t={:>8.3}s  late       pushed {} tick(s)",
                time, push_ticks
            ),
            InteractionEvent::Looped { time, start_time } => {
                write!(f, "t={:>8.3}s  loop       @ {:.3}s", time, start_time)
            }
            InteractionEvent::Mutated {
                time,
                generator,
                start_time,
                sequence,
            } => write!(
                f,
                "t={:>8.3}s  mutate     '{}' {} notes @ {:.3}s",
                time,
                generator,
                sequence.len(),
                start_time
            ),
            InteractionEvent::MutateIgnored { time } => {
                write!(f, "t={:>8.3}s  mutate     ignored (no response)", time)
            }
            InteractionEvent::Panic { time } => {
                write!(f, "t={:>8.3}s  panic      playback cleared", time)
            }
            InteractionEvent::Stopped { time } => {
                write!(f, "t={:>8.3}s  stopped", time)
            }
        }
    }
}

// ─── Constants ──────────────────────────────────────────────────────────────

pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Note name with octave, e.g. 60 -> "C4".
pub fn note_name(pitch: u8) -> String {
    let octave = (pitch / 12) as i32 - 1;
    format!("{}{}", NOTE_NAMES[(pitch % 12) as usize], octave)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrase() -> TimedSequence {
        let mut seq = TimedSequence::new(100.0);
        seq.push(Note::new(60, 90, 0.5, 1.0));
        seq.push(Note::new(64, 80, 1.0, 1.75));
        seq.push(Note::new(67, 70, 1.75, 2.25));
        seq.total_time = 3.0;
        seq
    }

    #[test]
    fn test_shift_is_invertible() {
        let seq = phrase();
        for delta in [0.25, -1.5, 8.0, 1024.125] {
            let back = seq.shifted(delta).shifted(-delta);
            assert_eq!(back, seq, "shift by {} not inverted", delta);
        }
    }

    #[test]
    fn test_shift_leaves_original_untouched() {
        let seq = phrase();
        let moved = seq.shifted(2.0);
        assert_eq!(seq.notes[0].start_time, 0.5);
        assert_eq!(moved.notes[0].start_time, 2.5);
        assert_eq!(moved.notes[2].end_time, 4.25);
        assert_eq!(moved.total_time, 5.0);
        assert_eq!(moved.qpm, 100.0);
    }

    #[test]
    fn test_trim_drops_and_truncates() {
        let seq = phrase();
        let trimmed = seq.trimmed(1.0, 2.0);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed.notes[0].pitch, 64);
        // 67 starts at 1.75, ends at 2.25 -> truncated to 2.0
        assert_eq!(trimmed.notes[1].end_time, 2.0);
        assert_eq!(trimmed.total_time, 2.0);
    }

    #[test]
    fn test_trim_keeps_shorter_total_time() {
        let seq = phrase();
        let trimmed = seq.trimmed(0.0, 10.0);
        assert_eq!(trimmed.total_time, 3.0);
        assert_eq!(trimmed.len(), 3);
    }

    #[test]
    fn test_last_end_time() {
        assert_eq!(TimedSequence::empty().last_end_time(), 0.0);
        assert_eq!(phrase().last_end_time(), 2.25);
        assert_eq!(phrase().first_start_time(), Some(0.5));
    }

    #[test]
    fn test_note_end_never_before_start() {
        let n = Note::new(60, 100, 2.0, 1.0);
        assert_eq!(n.end_time, 2.0);
        assert_eq!(n.duration(), 0.0);
    }

    #[test]
    fn test_phase_control_values() {
        assert_eq!(Phase::Idle.control_value(), 0);
        assert_eq!(Phase::Listening.control_value(), 1);
        assert_eq!(Phase::Responding.control_value(), 2);
        assert_eq!(Phase::Responding.to_string(), "Responding");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1.0);
        clock.advance(0.5);
        assert_eq!(clock.now(), 1.5);
        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let ev = InteractionEvent::State {
            time: 2.0,
            phase: Phase::Listening,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"state\""), "{}", json);
        let back: InteractionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_note_name() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(69), "A4");
        assert_eq!(note_name(0), "C-1");
    }
}
