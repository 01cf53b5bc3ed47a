use crate::hub::VirtualHub;
use crate::midi::MidiEvent;
use crate::signals::{MidiSignal, SignalKind};
use crate::types::note_name;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// Plays a scripted performer into a `VirtualHub` so the whole interaction
/// can run without any MIDI hardware.
pub struct Simulator {
    hub: Arc<VirtualHub>,
    channel: u8,
    stop_rx: Receiver<()>,
}

impl Simulator {
    pub fn new(hub: Arc<VirtualHub>, channel: u8, stop_rx: Receiver<()>) -> Self {
        Self {
            hub,
            channel,
            stop_rx,
        }
    }

    /// Play `gestures` in order. Blocks the calling thread; returns early
    /// (false) if a stop is requested.
    pub fn run(&self, gestures: &[Gesture]) -> bool {
        info!("Simulator starting ({} gestures)...", gestures.len());
        for gesture in gestures {
            if !self.execute(gesture) {
                info!("Simulator stopped");
                return false;
            }
        }
        info!("Simulator script complete");
        true
    }

    /// Loop the script until stopped.
    pub fn run_forever(&self, gestures: &[Gesture]) {
        while self.run(gestures) {}
    }

    fn execute(&self, gesture: &Gesture) -> bool {
        match gesture {
            Gesture::Rest { ms } => {
                info!("  rest {}ms", ms);
                self.sleep(*ms)
            }

            Gesture::Phrase { notes, velocity } => {
                let names: Vec<String> = notes
                    .iter()
                    .map(|&(pitch, _)| note_name(pitch))
                    .collect();
                info!("  phrase [{}]", names.join(" "));
                for &(pitch, ms) in notes {
                    self.hub.receive(MidiEvent::NoteOn {
                        channel: self.channel,
                        note: pitch,
                        velocity: *velocity,
                    });
                    let held = self.sleep(ms);
                    self.hub.receive(MidiEvent::NoteOff {
                        channel: self.channel,
                        note: pitch,
                    });
                    if !held {
                        return false;
                    }
                }
                true
            }

            Gesture::Control { control, value } => {
                info!("  cc {} = {}", control, value);
                self.hub.receive(MidiEvent::ControlChange {
                    channel: self.channel,
                    control: *control,
                    value: *value,
                });
                true
            }

            Gesture::Signal(signal) => {
                info!("  signal {}", signal);
                self.hub.receive(signal_event(signal, self.channel));
                true
            }
        }
    }

    fn sleep(&self, ms: u32) -> bool {
        match self.stop_rx.recv_timeout(Duration::from_millis(ms as u64)) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// An event that `signal` matches, on its own channel or `default_channel`.
pub fn signal_event(signal: &MidiSignal, default_channel: u8) -> MidiEvent {
    let channel = signal.channel.unwrap_or(default_channel);
    match signal.kind {
        SignalKind::NoteOn { note } => MidiEvent::NoteOn {
            channel,
            note: note.unwrap_or(0),
            velocity: 127,
        },
        SignalKind::ControlChange { control, value } => MidiEvent::ControlChange {
            channel,
            control,
            value: value.unwrap_or(127),
        },
    }
}

// ─── Gesture types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Gesture {
    Rest { ms: u32 },
    /// Legato run of (pitch, ms) at one velocity.
    Phrase { notes: Vec<(u8, u32)>, velocity: u8 },
    Control { control: u8, value: u8 },
    /// Send an event matching a configured signal (end call, panic, mutate).
    Signal(MidiSignal),
}

/// A short script: two calls with room for the responses between them.
/// Phrases are quantized to `tick_ms`, so the call ends on a silent tick.
pub fn demo_script(tick_ms: u32, end_call: Option<MidiSignal>) -> Vec<Gesture> {
    let eighth = (tick_ms / 4).max(1);
    let mut script = vec![
        Gesture::Rest { ms: tick_ms / 2 },
        // C major arpeggio, up and back
        Gesture::Phrase {
            notes: [60, 64, 67, 72, 67, 64, 60, 55]
                .iter()
                .map(|&p| (p, eighth))
                .collect(),
            velocity: 96,
        },
        Gesture::Rest { ms: tick_ms * 6 },
        // Blues lick
        Gesture::Phrase {
            notes: vec![
                (67, eighth),
                (70, eighth),
                (72, eighth * 2),
                (70, eighth),
                (67, eighth),
                (65, eighth),
                (67, eighth * 3),
            ],
            velocity: 88,
        },
    ];
    if let Some(signal) = end_call {
        script.push(Gesture::Signal(signal));
    }
    script.push(Gesture::Rest { ms: tick_ms * 8 });
    script
}
