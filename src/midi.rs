use serde::{Deserialize, Serialize};
use std::fmt;

/// MIDI 1.0 channel messages the interaction cares about.
/// Channels are 0-based (0-15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiEvent {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, control: u8, value: u8 },
}

/// An event stamped with the session clock time it was received or scheduled at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub time: f64,
    pub event: MidiEvent,
}

/// All-notes-off controller number.
pub const ALL_NOTES_OFF: u8 = 123;

impl MidiEvent {
    /// Parse a raw MIDI message. Running status and system messages are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }

        let status = bytes[0];
        let channel = status & 0x0F;
        let (data1, data2) = (bytes[1] & 0x7F, bytes[2] & 0x7F);

        match status & 0xF0 {
            0x90 => {
                // Velocity 0 = Note Off
                if data2 == 0 {
                    Some(MidiEvent::NoteOff {
                        channel,
                        note: data1,
                    })
                } else {
                    Some(MidiEvent::NoteOn {
                        channel,
                        note: data1,
                        velocity: data2,
                    })
                }
            }
            0x80 => Some(MidiEvent::NoteOff {
                channel,
                note: data1,
            }),
            0xB0 => Some(MidiEvent::ControlChange {
                channel,
                control: data1,
                value: data2,
            }),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } => [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiEvent::NoteOff { channel, note } => [0x80 | (channel & 0x0F), note & 0x7F, 0],
            MidiEvent::ControlChange {
                channel,
                control,
                value,
            } => [0xB0 | (channel & 0x0F), control & 0x7F, value & 0x7F],
        }
    }

    pub fn channel(&self) -> u8 {
        match *self {
            MidiEvent::NoteOn { channel, .. }
            | MidiEvent::NoteOff { channel, .. }
            | MidiEvent::ControlChange { channel, .. } => channel,
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } => write!(f, "ch{:<2} on  {:>3} vel {}", channel + 1, note, velocity),
            MidiEvent::NoteOff { channel, note } => {
                write!(f, "ch{:<2} off {:>3}", channel + 1, note)
            }
            MidiEvent::ControlChange {
                channel,
                control,
                value,
            } => write!(f, "ch{:<2} cc  {:>3} = {}", channel + 1, control, value),
        }
    }
}
