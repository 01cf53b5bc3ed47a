//! MIDI I/O hub — the collaborator the interaction talks to.
//!
//! The traits here are the whole contract: capture live input into timed
//! sequences on each tick, play sequences back, run a metronome, expose
//! control values. `VirtualHub` implements them in-process over a pluggable
//! `MidiSink`; `midi_port` (feature `hardware`) wires it to real MIDI ports.

pub mod virtual_hub;

#[cfg(feature = "hardware")]
pub mod midi_port;

pub use virtual_hub::VirtualHub;

use crate::config::TickSource;
use crate::midi::{MidiEvent, TimedEvent};
use crate::signals::{MidiSignal, SignalCallback};
use crate::types::{Clock, TimedSequence};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;
use std::sync::Arc;

/// Live controller values, 0-127. None until a controller has been moved.
pub trait ControlSource: Send + Sync {
    fn control_value(&self, control: u8) -> Option<u8>;
}

pub trait MidiHub: ControlSource {
    /// Begin capturing input from `start_time` at the given tempo.
    fn start_capture(&self, qpm: f64, start_time: f64) -> Box<dyn Capture>;

    /// Begin playback of `sequence`; the returned player accepts updates.
    fn start_playback(&self, sequence: TimedSequence) -> Box<dyn Player>;

    /// (Re)start the metronome, clicking on each beat from `start_time`.
    fn start_metronome(&self, qpm: f64, start_time: f64, channel: u8);

    fn stop_metronome(&self);

    fn send_control_change(&self, control: u8, value: u8);
}

/// An active input capture.
pub trait Capture: Send {
    /// Blocks until the next tick and returns everything captured since
    /// `start_time`, with `total_time` set to the tick time.
    /// Returns None once the capture has been stopped.
    fn next_tick(&mut self, source: &TickSource) -> Option<TimedSequence>;

    fn start_time(&self) -> f64;

    fn set_start_time(&mut self, start_time: f64);

    /// Run `callback` from the input context whenever `signal` arrives.
    fn register_callback(&mut self, signal: MidiSignal, callback: SignalCallback);

    /// Handle that can end the capture from another thread.
    fn stopper(&self) -> CaptureStopper;
}

/// An active playback.
pub trait Player: Send {
    /// Replace the playing sequence. Events before `start_time` (or now,
    /// when None) are skipped.
    fn update_sequence(&mut self, sequence: TimedSequence, start_time: Option<f64>);

    /// Silence and release the output. Blocks until playback has ended.
    fn stop(&mut self);
}

// ─── Capture stopper ────────────────────────────────────────────────────────

/// Wakes and ends a blocked `Capture::next_tick`.
#[derive(Clone)]
pub struct CaptureStopper {
    tx: Sender<()>,
}

impl CaptureStopper {
    /// Stopper plus the receiver the capture selects on.
    pub fn channel() -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(1);
        (Self { tx }, rx)
    }

    pub fn stop(&self) {
        // A full channel already carries a stop request.
        let _ = self.tx.try_send(());
    }
}

// ─── Output sinks ───────────────────────────────────────────────────────────

/// Where played MIDI goes.
pub trait MidiSink: Send + Sync {
    fn send(&self, event: &MidiEvent);
}

/// Logs outgoing events at debug level and drops them.
pub struct LogSink;

impl MidiSink for LogSink {
    fn send(&self, event: &MidiEvent) {
        debug!("MIDI out: {}", event);
    }
}

/// Forwards outgoing events, stamped with the clock, over a channel.
pub struct ChannelSink {
    tx: Sender<TimedEvent>,
    clock: Arc<dyn Clock>,
}

impl ChannelSink {
    pub fn new(tx: Sender<TimedEvent>, clock: Arc<dyn Clock>) -> Self {
        Self { tx, clock }
    }
}

impl MidiSink for ChannelSink {
    fn send(&self, event: &MidiEvent) {
        let _ = self.tx.send(TimedEvent {
            time: self.clock.now(),
            event: *event,
        });
    }
}
