//! End-to-end tests for the call-and-response loop.
//!
//! These run the real interaction thread against a `VirtualHub`:
//!   test → VirtualHub::receive → capture → CallAndResponse → player → ChannelSink
//!
//! Time comes from a `ManualClock` and ticks from a clock signal, so every
//! tick happens exactly when the test sends a pulse.

use crossbeam_channel::{unbounded, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use call_response::call_and_response::CallAndResponse;
use call_response::config::{ConfigError, ControlMap, InteractionConfig};
use call_response::generator::{EchoGenerator, SequenceGenerator};
use call_response::hub::{ChannelSink, VirtualHub};
use call_response::interaction::Interaction;
use call_response::midi::{MidiEvent, TimedEvent, ALL_NOTES_OFF};
use call_response::signals::MidiSignal;
use call_response::types::*;

const PULSE_CC: u8 = 1;
const END_CALL_CC: u8 = 20;
const PANIC_CC: u8 = 21;
const MUTATE_CC: u8 = 22;
const MIN_LISTEN_CC: u8 = 30;
const MAX_LISTEN_CC: u8 = 31;
const LOOP_CC: u8 = 33;
const STATE_CC: u8 = 50;

const TIMEOUT: Duration = Duration::from_secs(2);

// ─── Helpers ───────────────────────────────────────────────────────────────

struct Session {
    clock: Arc<ManualClock>,
    hub: Arc<VirtualHub>,
    interaction: Interaction,
    events: Receiver<InteractionEvent>,
    output: Receiver<TimedEvent>,
}

fn config() -> InteractionConfig {
    InteractionConfig {
        clock_signal: Some(MidiSignal::control(PULSE_CC, Some(127))),
        end_call_signal: Some(MidiSignal::control(END_CALL_CC, None)),
        panic_signal: Some(MidiSignal::control(PANIC_CC, None)),
        mutate_signal: Some(MidiSignal::control(MUTATE_CC, None)),
        state_control: Some(STATE_CC),
        controls: ControlMap {
            min_listen_ticks: Some(MIN_LISTEN_CC),
            max_listen_ticks: Some(MAX_LISTEN_CC),
            loop_enabled: Some(LOOP_CC),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn echo() -> Vec<Arc<dyn SequenceGenerator>> {
    vec![Arc::new(EchoGenerator::new()) as Arc<dyn SequenceGenerator>]
}

/// Start an interaction and wait until its capture is live.
fn start(config: InteractionConfig) -> Session {
    let clock = Arc::new(ManualClock::new(0.0));
    let (out_tx, output) = unbounded();
    let sink = Arc::new(ChannelSink::new(out_tx, clock.clone()));
    let hub = Arc::new(VirtualHub::new(clock.clone(), sink));

    let (events_tx, events) = unbounded();
    let machine = CallAndResponse::from_config(hub.clone(), clock.clone(), &config, echo())
        .unwrap()
        .with_observer(events_tx);
    let interaction = Interaction::start(machine).unwrap();

    let deadline = Instant::now() + TIMEOUT;
    while hub.active_captures() == 0 {
        assert!(Instant::now() < deadline, "capture never started");
        thread::sleep(Duration::from_millis(2));
    }

    Session {
        clock,
        hub,
        interaction,
        events,
        output,
    }
}

impl Session {
    fn at(&self, t: f64) -> &Self {
        self.clock.set(t);
        self
    }

    fn note_on(&self, pitch: u8) -> &Self {
        self.hub.receive(MidiEvent::NoteOn {
            channel: 0,
            note: pitch,
            velocity: 100,
        });
        self
    }

    fn note_off(&self, pitch: u8) -> &Self {
        self.hub.receive(MidiEvent::NoteOff {
            channel: 0,
            note: pitch,
        });
        self
    }

    fn cc(&self, control: u8, value: u8) -> &Self {
        self.hub.receive(MidiEvent::ControlChange {
            channel: 0,
            control,
            value,
        });
        self
    }

    fn pulse(&self) -> &Self {
        self.cc(PULSE_CC, 127)
    }

    /// Next event matching `pred`, skipping others.
    fn expect_event(
        &self,
        what: &str,
        pred: impl Fn(&InteractionEvent) -> bool,
    ) -> InteractionEvent {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) => {}
                Err(_) => panic!("timed out waiting for {}", what),
            }
        }
    }

    fn expect_phase(&self, phase: Phase) {
        self.expect_event(&format!("state {}", phase), |e| {
            matches!(e, InteractionEvent::State { phase: p, .. } if *p == phase)
        });
    }

    /// Next played event matching `pred`.
    fn expect_output(&self, what: &str, pred: impl Fn(&MidiEvent) -> bool) -> TimedEvent {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.output.recv_timeout(left) {
                Ok(ev) if pred(&ev.event) => return ev,
                Ok(_) => {}
                Err(_) => panic!("timed out waiting for output {}", what),
            }
        }
    }
}

fn response(ev: InteractionEvent) -> (f64, f64, TimedSequence) {
    match ev {
        InteractionEvent::Response {
            start_time,
            duration,
            sequence,
            ..
        } => (start_time, duration, sequence),
        other => panic!("expected response, got {:?}", other),
    }
}

fn is_response(e: &InteractionEvent) -> bool {
    matches!(e, InteractionEvent::Response { .. })
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[test]
fn test_call_then_silence_gets_echoed() {
    let s = start(config());
    s.hub.set_control(MIN_LISTEN_CC, 1);
    s.hub.set_control(MAX_LISTEN_CC, 4);

    // Three ticks of input, then a silent tick at t=8
    s.at(0.25).note_on(60);
    s.at(1.75).note_off(60);
    s.at(2.0).pulse();
    s.expect_phase(Phase::Listening);
    for (pitch, t) in [(62, 2.0), (64, 4.0)] {
        s.at(t + 0.25).note_on(pitch);
        s.at(t + 1.75).note_off(pitch);
        s.at(t + 2.0).pulse();
    }
    s.at(8.0).pulse();

    let (start_time, duration, sequence) = response(s.expect_event("response", is_response));
    assert_eq!(start_time, 8.0);
    assert!((duration - 6.0).abs() < 1e-9, "duration {}", duration);
    assert_eq!(sequence.len(), 3);
    assert!((sequence.total_time - 14.0).abs() < 1e-9);
    let pitches: Vec<u8> = sequence.notes.iter().map(|n| n.pitch).collect();
    assert_eq!(pitches, vec![60, 62, 64]);

    // Playback follows the clock
    s.at(8.3);
    let on = s.expect_output("first response note", |e| {
        matches!(e, MidiEvent::NoteOn { note: 60, .. })
    });
    assert!(on.time >= 8.25);
    s.at(10.3);
    s.expect_output("second response note", |e| {
        matches!(e, MidiEvent::NoteOn { note: 62, .. })
    });
}

#[test]
fn test_short_call_is_skipped() {
    let s = start(config());
    s.hub.set_control(MIN_LISTEN_CC, 2);

    s.at(0.5).note_on(60);
    s.at(1.0).note_off(60);
    s.at(2.0).pulse();
    s.expect_phase(Phase::Listening);
    s.at(4.0).pulse();

    match s.expect_event("skip", |e| {
        matches!(e, InteractionEvent::CallSkipped { .. } | InteractionEvent::Response { .. })
    }) {
        InteractionEvent::CallSkipped {
            listen_ticks,
            min_listen_ticks,
            ..
        } => {
            assert_eq!(listen_ticks, 1);
            assert_eq!(min_listen_ticks, 2);
        }
        other => panic!("expected skip, got {:?}", other),
    }
}

#[test]
fn test_end_call_signal_cuts_call_short() {
    let s = start(config());

    s.at(0.5).note_on(60);
    s.at(2.0).pulse();
    s.expect_phase(Phase::Listening);

    // Still holding the note: only the end-call signal can end the call
    s.at(3.0).cc(END_CALL_CC, 127);
    s.at(4.0).pulse();
    let (start_time, duration, _) = response(s.expect_event("response", is_response));
    assert_eq!(start_time, 4.0);
    assert!((duration - 4.0).abs() < 1e-9);
    s.at(4.1).note_off(60);
}

#[test]
fn test_panic_silences_response() {
    let s = start(config());
    s.at(0.5).note_on(60);
    s.at(1.5).note_off(60);
    s.at(2.0).pulse();
    s.expect_phase(Phase::Listening);
    s.at(4.0).pulse();
    s.expect_event("response", is_response);

    s.at(4.2).cc(PANIC_CC, 127);
    s.at(4.4).pulse();
    s.expect_event("panic", |e| matches!(e, InteractionEvent::Panic { .. }));
    s.expect_output("all notes off", |e| {
        matches!(e, MidiEvent::ControlChange { control, .. } if *control == ALL_NOTES_OFF)
    });

    // The cleared response never plays
    thread::sleep(Duration::from_millis(50));
    s.at(6.0);
    thread::sleep(Duration::from_millis(60));
    assert!(!s
        .output
        .try_iter()
        .any(|e| matches!(e.event, MidiEvent::NoteOn { .. })));
}

#[test]
fn test_loop_replays_response() {
    let s = start(config());
    s.hub.set_control(LOOP_CC, 127);

    s.at(0.5).note_on(67);
    s.at(1.0).note_off(67);
    s.at(2.0).pulse();
    s.expect_phase(Phase::Listening);
    s.at(4.0).pulse();
    let (_, duration, _) = response(s.expect_event("response", is_response));
    assert!((duration - 2.0).abs() < 1e-9);

    // Let the first pass play out
    s.at(5.5);
    let first = s.expect_output("response note", |e| {
        matches!(e, MidiEvent::NoteOn { note: 67, .. })
    });
    assert!(first.time >= 4.5 && first.time < 6.0);

    // Response spans 4..6; the tick at 6 loops it
    s.at(6.0).pulse();
    match s.expect_event("loop", |e| matches!(e, InteractionEvent::Looped { .. })) {
        InteractionEvent::Looped { start_time, .. } => assert_eq!(start_time, 6.0),
        _ => unreachable!(),
    }
    s.at(6.6);
    let on = s.expect_output("looped note", |e| {
        matches!(e, MidiEvent::NoteOn { note: 67, .. })
    });
    assert!(on.time >= 6.5);
}

#[test]
fn test_mutate_regenerates_after_response() {
    let s = start(config());

    s.at(0.5).note_on(60);
    s.at(1.0).note_off(60);
    s.at(2.0).pulse();
    s.expect_phase(Phase::Listening);
    s.at(4.0).pulse();
    s.expect_event("response", is_response);

    s.at(5.0).cc(MUTATE_CC, 127);
    s.at(6.0).pulse();
    match s.expect_event("mutate", |e| matches!(e, InteractionEvent::Mutated { .. })) {
        InteractionEvent::Mutated {
            start_time,
            generator,
            sequence,
            ..
        } => {
            assert_eq!(start_time, 6.0);
            assert_eq!(generator, "echo");
            assert!((sequence.total_time - 8.0).abs() < 1e-9);
            assert_eq!(sequence.notes[0].pitch, 60);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_state_changes_reach_output() {
    let s = start(config());
    s.at(0.5).note_on(60);
    s.at(1.0).note_off(60);
    s.at(2.0).pulse();
    s.expect_phase(Phase::Listening);
    s.expect_output("listening cc", |e| {
        matches!(e, MidiEvent::ControlChange { control: STATE_CC, value: 1, .. })
    });
    s.at(4.0).pulse();
    s.expect_output("responding cc", |e| {
        matches!(e, MidiEvent::ControlChange { control: STATE_CC, value: 2, .. })
    });
}

#[test]
fn test_stop_wakes_blocked_capture() {
    let mut s = start(config());
    // No pulses: the loop is parked in next_tick
    let started = Instant::now();
    s.interaction.stop().unwrap();
    assert!(started.elapsed() < TIMEOUT);
    assert!(s.interaction.is_finished());
    s.expect_event("stopped", |e| matches!(e, InteractionEvent::Stopped { .. }));

    // Input after stop goes nowhere
    s.at(1.0).note_on(60);
    s.pulse();
    assert!(s.events.try_recv().is_err());
}

#[test]
fn test_config_errors_surface_before_start() {
    let clock = Arc::new(ManualClock::new(0.0));
    let (tx, _rx) = unbounded();
    let hub = Arc::new(VirtualHub::new(
        clock.clone(),
        Arc::new(ChannelSink::new(tx, clock.clone())),
    ));

    let no_tick = InteractionConfig::default();
    let err = CallAndResponse::from_config(hub.clone(), clock.clone(), &no_tick, echo());
    assert!(matches!(err, Err(ConfigError::TickSource)));

    let both = InteractionConfig {
        tick_duration: Some(1.0),
        ..config()
    };
    let err = CallAndResponse::from_config(hub.clone(), clock.clone(), &both, echo());
    assert!(matches!(err, Err(ConfigError::TickSource)));

    let err = CallAndResponse::from_config(hub.clone(), clock.clone(), &config(), Vec::new());
    assert!(matches!(err, Err(ConfigError::NoGenerators)));

    let mut generators = echo();
    generators.push(Arc::new(EchoGenerator::new()));
    let err = CallAndResponse::from_config(hub, clock, &config(), generators);
    assert!(matches!(
        err,
        Err(ConfigError::AmbiguousGeneratorSelection { count: 2 })
    ));
}
