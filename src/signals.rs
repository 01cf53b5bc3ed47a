use crate::midi::MidiEvent;
use crate::types::TimedSequence;
use log::info;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ─── Signal patterns ────────────────────────────────────────────────────────

/// Which kind of MIDI message a signal listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Any note-on, or a specific note
    NoteOn { note: Option<u8> },
    /// A controller, optionally with a specific value
    ControlChange { control: u8, value: Option<u8> },
}

/// A pattern matched against live input events.
///
/// Text form: `note`, `note:60`, `cc:64`, `cc:64=127`, optionally suffixed
/// with `@<channel>` (1-based). Used for the clock, end-call, panic and
/// mutate signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiSignal {
    pub kind: SignalKind,
    /// 0-based channel filter; None = omni
    pub channel: Option<u8>,
}

impl MidiSignal {
    pub fn note(note: Option<u8>) -> Self {
        Self {
            kind: SignalKind::NoteOn { note },
            channel: None,
        }
    }

    pub fn control(control: u8, value: Option<u8>) -> Self {
        Self {
            kind: SignalKind::ControlChange { control, value },
            channel: None,
        }
    }

    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn matches(&self, event: &MidiEvent) -> bool {
        if let Some(ch) = self.channel {
            if event.channel() != ch {
                return false;
            }
        }
        match (self.kind, *event) {
            (SignalKind::NoteOn { note }, MidiEvent::NoteOn { note: n, .. }) => {
                note.map_or(true, |want| want == n)
            }
            (
                SignalKind::ControlChange { control, value },
                MidiEvent::ControlChange {
                    control: c,
                    value: v,
                    ..
                },
            ) => control == c && value.map_or(true, |want| want == v),
            _ => false,
        }
    }
}

impl fmt::Display for MidiSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SignalKind::NoteOn { note: None } => write!(f, "note")?,
            SignalKind::NoteOn { note: Some(n) } => write!(f, "note:{}", n)?,
            SignalKind::ControlChange {
                control,
                value: None,
            } => write!(f, "cc:{}", control)?,
            SignalKind::ControlChange {
                control,
                value: Some(v),
            } => write!(f, "cc:{}={}", control, v)?,
        }
        if let Some(ch) = self.channel {
            write!(f, "@{}", ch + 1)?;
        }
        Ok(())
    }
}

fn parse_data_byte(s: &str, what: &str) -> Result<u8, String> {
    let v: u8 = s
        .trim()
        .parse()
        .map_err(|_| format!("invalid {} '{}'", what, s))?;
    if v > 127 {
        return Err(format!("{} {} out of range 0-127", what, v));
    }
    Ok(v)
}

impl FromStr for MidiSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (body, channel) = match s.split_once('@') {
            Some((body, ch)) => {
                let ch: u8 = ch
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid channel '{}'", ch))?;
                if !(1..=16).contains(&ch) {
                    return Err(format!("channel {} out of range 1-16", ch));
                }
                (body, Some(ch - 1))
            }
            None => (s, None),
        };

        let kind = match body.split_once(':') {
            None if body.eq_ignore_ascii_case("note") => SignalKind::NoteOn { note: None },
            Some((head, rest)) if head.eq_ignore_ascii_case("note") => SignalKind::NoteOn {
                note: Some(parse_data_byte(rest, "note")?),
            },
            Some((head, rest)) if head.eq_ignore_ascii_case("cc") => match rest.split_once('=') {
                Some((c, v)) => SignalKind::ControlChange {
                    control: parse_data_byte(c, "control")?,
                    value: Some(parse_data_byte(v, "value")?),
                },
                None => SignalKind::ControlChange {
                    control: parse_data_byte(rest, "control")?,
                    value: None,
                },
            },
            _ => return Err(format!("unrecognized signal '{}'", s)),
        };

        Ok(Self { kind, channel })
    }
}

impl Serialize for MidiSignal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MidiSignal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Sticky flags ───────────────────────────────────────────────────────────

/// Invoked with the capture's current snapshot when a signal matches.
pub type SignalCallback = Arc<dyn Fn(&TimedSequence) + Send + Sync>;

/// A boolean that stays set until the consumer clears it.
/// Repeated sets between clears coalesce into one.
#[derive(Debug, Clone, Default)]
pub struct SignalFlag(Arc<AtomicBool>);

impl SignalFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Callback that raises this flag and logs `name`.
    pub fn callback(&self, name: &'static str) -> SignalCallback {
        let flag = self.clone();
        Arc::new(move |_captured: &TimedSequence| {
            flag.set();
            info!("{} signal received.", name);
        })
    }
}

/// The three flags the call-and-response loop consumes at tick boundaries.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    pub end_call: SignalFlag,
    pub panic: SignalFlag,
    pub mutate: SignalFlag,
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Ordered list of signal patterns and the callbacks they fire.
#[derive(Default, Clone)]
pub struct SignalRegistry {
    entries: Vec<(MidiSignal, SignalCallback)>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, signal: MidiSignal, callback: SignalCallback) {
        self.entries.push((signal, callback));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every callback whose signal matches `event`. Returns the match count.
    pub fn dispatch(&self, event: &MidiEvent, captured: &TimedSequence) -> usize {
        let mut fired = 0;
        for (signal, callback) in &self.entries {
            if signal.matches(event) {
                callback(captured);
                fired += 1;
            }
        }
        fired
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(s, _)| s.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(control: u8, value: u8) -> MidiEvent {
        MidiEvent::ControlChange {
            channel: 0,
            control,
            value,
        }
    }

    #[test]
    fn test_parse_signals() {
        assert_eq!("note".parse::<MidiSignal>().unwrap(), MidiSignal::note(None));
        assert_eq!(
            "note:36".parse::<MidiSignal>().unwrap(),
            MidiSignal::note(Some(36))
        );
        assert_eq!(
            "cc:64=127".parse::<MidiSignal>().unwrap(),
            MidiSignal::control(64, Some(127))
        );
        assert_eq!(
            "cc:1@10".parse::<MidiSignal>().unwrap(),
            MidiSignal::control(1, None).on_channel(9)
        );
        assert!("cc:200".parse::<MidiSignal>().is_err());
        assert!("pitchbend".parse::<MidiSignal>().is_err());
        assert!("note@17".parse::<MidiSignal>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for text in ["note", "note:60", "cc:64", "cc:64=127@2"] {
            let sig: MidiSignal = text.parse().unwrap();
            assert_eq!(sig.to_string(), text);
        }
    }

    #[test]
    fn test_control_matching() {
        let any = MidiSignal::control(64, None);
        let exact = MidiSignal::control(64, Some(127));
        assert!(any.matches(&cc(64, 0)));
        assert!(!exact.matches(&cc(64, 0)));
        assert!(exact.matches(&cc(64, 127)));
        assert!(!exact.matches(&cc(65, 127)));
    }

    #[test]
    fn test_channel_filter() {
        let sig = MidiSignal::note(Some(60)).on_channel(1);
        let on = |channel| MidiEvent::NoteOn {
            channel,
            note: 60,
            velocity: 90,
        };
        assert!(sig.matches(&on(1)));
        assert!(!sig.matches(&on(0)));
    }

    #[test]
    fn test_flag_is_sticky_until_taken() {
        let flag = SignalFlag::new();
        flag.set();
        flag.set();
        assert!(flag.is_set());
        assert!(flag.take());
        assert!(!flag.take());
        assert!(!flag.is_set());
    }

    #[test]
    fn test_registry_dispatch_sets_flags() {
        let flags = SignalFlags::default();
        let mut registry = SignalRegistry::new();
        registry.register(MidiSignal::control(64, Some(127)), flags.end_call.callback("End call"));
        registry.register(MidiSignal::control(120, None), flags.panic.callback("Panic"));

        let captured = TimedSequence::empty();
        assert_eq!(registry.dispatch(&cc(1, 5), &captured), 0);
        assert!(!flags.end_call.is_set());

        assert_eq!(registry.dispatch(&cc(64, 127), &captured), 1);
        assert!(flags.end_call.is_set());
        assert!(!flags.panic.is_set());

        registry.dispatch(&cc(120, 0), &captured);
        assert!(flags.panic.is_set());
        assert!(!flags.mutate.is_set());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let sig = MidiSignal::control(64, Some(127));
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, "\"cc:64=127\"");
        let back: MidiSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }
}
