use super::{Capture, CaptureStopper, ControlSource, MidiHub, MidiSink, Player};
use crate::config::TickSource;
use crate::midi::{MidiEvent, TimedEvent, ALL_NOTES_OFF};
use crate::signals::{MidiSignal, SignalCallback, SignalRegistry};
use crate::types::{Clock, Note, TimedSequence};
use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest single sleep while waiting on the clock. Keeps waits responsive
/// to clocks that are not wall time.
const MAX_WAIT: Duration = Duration::from_millis(20);

const UNSET: u8 = u8::MAX;

/// Metronome click notes (GM percussion: high/low wood block).
const CLICK_ACCENT: (u8, u8) = (76, 110);
const CLICK_REGULAR: (u8, u8) = (77, 80);
const CLICK_LEN: f64 = 0.05;
const BEATS_PER_BAR: u64 = 4;

/// Blocks until `clock` reaches `t`. Returns false if `stop_rx` fired first.
fn wait_until(clock: &dyn Clock, stop_rx: &Receiver<()>, t: f64) -> bool {
    loop {
        let remaining = t - clock.now();
        if remaining <= 0.0 {
            return true;
        }
        let wait = Duration::from_secs_f64(remaining).min(MAX_WAIT);
        match stop_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

// ─── Control bank ───────────────────────────────────────────────────────────

/// Latest value of each of the 128 controllers, readable without locking.
struct ControlBank([AtomicU8; 128]);

impl ControlBank {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU8::new(UNSET)))
    }

    fn get(&self, control: u8) -> Option<u8> {
        match self.0[(control & 0x7F) as usize].load(Ordering::Acquire) {
            UNSET => None,
            v => Some(v),
        }
    }

    fn set(&self, control: u8, value: u8) {
        self.0[(control & 0x7F) as usize].store(value & 0x7F, Ordering::Release);
    }
}

// ─── Hub ────────────────────────────────────────────────────────────────────

/// In-process MIDI hub.
///
/// Input arrives through `receive` (from the simulator, a hardware port, or
/// a test) and is stamped with the hub clock. Output goes to the sink.
pub struct VirtualHub {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MidiSink>,
    controls: ControlBank,
    captures: Mutex<Vec<Weak<CaptureShared>>>,
    metronome: Mutex<Option<Metronome>>,
    /// 0-based channel for playback and state control changes
    output_channel: u8,
}

impl VirtualHub {
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn MidiSink>) -> Self {
        Self {
            clock,
            sink,
            controls: ControlBank::new(),
            captures: Mutex::new(Vec::new()),
            metronome: Mutex::new(None),
            output_channel: 0,
        }
    }

    /// Channel (0-15) for playback and state control changes.
    pub fn with_output_channel(mut self, channel: u8) -> Self {
        self.output_channel = channel & 0x0F;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Feed one input event, stamped with the current clock time.
    pub fn receive(&self, event: MidiEvent) {
        self.receive_at(self.clock.now(), event);
    }

    /// Feed one input event with an explicit timestamp.
    pub fn receive_at(&self, time: f64, event: MidiEvent) {
        trace!("MIDI in @ {:.3}: {}", time, event);
        if let MidiEvent::ControlChange { control, value, .. } = event {
            self.controls.set(control, value);
        }

        let live: Vec<Arc<CaptureShared>> = match self.captures.lock() {
            Ok(mut captures) => {
                captures.retain(|w| w.strong_count() > 0);
                captures.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return,
        };
        for capture in live {
            capture.push(TimedEvent { time, event });
        }
    }

    /// Number of captures still receiving input.
    pub fn active_captures(&self) -> usize {
        self.captures
            .lock()
            .map(|c| c.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Set a controller directly, as if a control change had been received.
    pub fn set_control(&self, control: u8, value: u8) {
        self.controls.set(control, value);
    }
}

impl ControlSource for VirtualHub {
    fn control_value(&self, control: u8) -> Option<u8> {
        self.controls.get(control)
    }
}

impl MidiHub for VirtualHub {
    fn start_capture(&self, qpm: f64, start_time: f64) -> Box<dyn Capture> {
        let (events_tx, events_rx) = unbounded();
        let shared = Arc::new(CaptureShared {
            qpm,
            buffer: Mutex::new(CaptureBuffer::new(start_time)),
            signals: Mutex::new(SignalRegistry::new()),
            events_tx,
        });
        if let Ok(mut captures) = self.captures.lock() {
            captures.push(Arc::downgrade(&shared));
        }
        let (stopper, stop_rx) = CaptureStopper::channel();
        debug!("Capture started @ {:.3}s (qpm {:.1})", start_time, qpm);
        Box::new(VirtualCapture {
            shared,
            clock: self.clock.clone(),
            events_rx,
            stop_rx,
            stopper,
            origin: start_time,
            last_tick: None,
            stopped: false,
        })
    }

    fn start_playback(&self, sequence: TimedSequence) -> Box<dyn Player> {
        Box::new(VirtualPlayer::spawn(
            sequence,
            self.sink.clone(),
            self.clock.clone(),
            self.output_channel,
        ))
    }

    fn start_metronome(&self, qpm: f64, start_time: f64, channel: u8) {
        if let Ok(mut slot) = self.metronome.lock() {
            if let Some(old) = slot.take() {
                old.stop();
            }
            *slot = Metronome::spawn(
                qpm,
                start_time,
                channel,
                self.sink.clone(),
                self.clock.clone(),
            );
        }
    }

    fn stop_metronome(&self) {
        if let Ok(mut slot) = self.metronome.lock() {
            if let Some(old) = slot.take() {
                old.stop();
                debug!("Metronome stopped");
            }
        }
    }

    fn send_control_change(&self, control: u8, value: u8) {
        self.sink.send(&MidiEvent::ControlChange {
            channel: self.output_channel,
            control,
            value,
        });
    }
}

impl Drop for VirtualHub {
    fn drop(&mut self) {
        self.stop_metronome();
    }
}

// ─── Capture ────────────────────────────────────────────────────────────────

struct CaptureBuffer {
    start_time: f64,
    notes: Vec<Note>,
    /// (channel, pitch) -> (velocity, start)
    open: HashMap<(u8, u8), (u8, f64)>,
}

impl CaptureBuffer {
    fn new(start_time: f64) -> Self {
        Self {
            start_time,
            notes: Vec::new(),
            open: HashMap::new(),
        }
    }

    fn close(&mut self, channel: u8, note: u8, time: f64) {
        if let Some((velocity, start)) = self.open.remove(&(channel, note)) {
            self.notes.push(Note::new(note, velocity, start, time));
        }
    }

    fn apply(&mut self, ev: &TimedEvent) {
        match ev.event {
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } => {
                self.close(channel, note, ev.time);
                self.open.insert((channel, note), (velocity, ev.time));
            }
            MidiEvent::NoteOff { channel, note } => self.close(channel, note, ev.time),
            MidiEvent::ControlChange { .. } => {}
        }
    }

    /// Notes started in `[start_time, t]`; still-held notes end at `t`.
    fn snapshot(&self, t: f64, qpm: f64) -> TimedSequence {
        let start = self.start_time;
        let in_window = |s: f64| s >= start && s <= t;
        let mut seq = TimedSequence::new(qpm);
        for n in self.notes.iter().filter(|n| in_window(n.start_time)) {
            seq.notes.push(Note::new(n.pitch, n.velocity, n.start_time, n.end_time.min(t)));
        }
        for (&(_, pitch), &(velocity, s)) in &self.open {
            if in_window(s) {
                seq.notes.push(Note::new(pitch, velocity, s, t));
            }
        }
        seq.sort();
        seq.total_time = t;
        seq
    }

    fn set_start_time(&mut self, start_time: f64) {
        self.start_time = start_time;
        self.notes.retain(|n| n.start_time >= start_time);
    }
}

/// State shared between a capture and the hub's input path.
struct CaptureShared {
    qpm: f64,
    buffer: Mutex<CaptureBuffer>,
    signals: Mutex<SignalRegistry>,
    events_tx: Sender<TimedEvent>,
}

impl CaptureShared {
    fn push(&self, ev: TimedEvent) {
        let snapshot = match self.buffer.lock() {
            Ok(mut buffer) => {
                buffer.apply(&ev);
                buffer.snapshot(ev.time, self.qpm)
            }
            Err(_) => return,
        };
        let _ = self.events_tx.send(ev);

        if let Ok(signals) = self.signals.lock() {
            signals.dispatch(&ev.event, &snapshot);
        }
    }
}

struct VirtualCapture {
    shared: Arc<CaptureShared>,
    clock: Arc<dyn Clock>,
    events_rx: Receiver<TimedEvent>,
    stop_rx: Receiver<()>,
    stopper: CaptureStopper,
    /// Period ticks fall on origin + k * period
    origin: f64,
    last_tick: Option<f64>,
    stopped: bool,
}

impl VirtualCapture {
    fn next_period_tick(&self, period: f64) -> f64 {
        let now = self.clock.now();
        let k = ((now - self.origin) / period).floor().max(0.0) + 1.0;
        let tick = self.origin + k * period;
        match self.last_tick {
            Some(last) if tick <= last + period * 0.5 => last + period,
            _ => tick,
        }
    }

    fn wait_for_pulse(&mut self, source: &TickSource) -> Option<f64> {
        match *source {
            TickSource::Period(period) => {
                // Only signal-driven ticks consume the event stream.
                for _ in self.events_rx.try_iter() {}
                let tick = self.next_period_tick(period);
                if wait_until(self.clock.as_ref(), &self.stop_rx, tick) {
                    Some(tick)
                } else {
                    None
                }
            }
            TickSource::Signal(signal) => loop {
                select! {
                    recv(self.stop_rx) -> _ => return None,
                    recv(self.events_rx) -> ev => match ev {
                        Ok(ev) if signal.matches(&ev.event) => return Some(ev.time),
                        Ok(_) => {}
                        Err(_) => return None,
                    },
                }
            },
        }
    }
}

impl Capture for VirtualCapture {
    fn next_tick(&mut self, source: &TickSource) -> Option<TimedSequence> {
        if self.stopped {
            return None;
        }
        let Some(tick) = self.wait_for_pulse(source) else {
            self.stopped = true;
            debug!("Capture stopped");
            return None;
        };
        self.last_tick = Some(tick);
        let buffer = self.shared.buffer.lock().ok()?;
        Some(buffer.snapshot(tick, self.shared.qpm))
    }

    fn start_time(&self) -> f64 {
        self.shared
            .buffer
            .lock()
            .map(|b| b.start_time)
            .unwrap_or(self.origin)
    }

    fn set_start_time(&mut self, start_time: f64) {
        if let Ok(mut buffer) = self.shared.buffer.lock() {
            buffer.set_start_time(start_time);
        }
    }

    fn register_callback(&mut self, signal: MidiSignal, callback: SignalCallback) {
        if let Ok(mut signals) = self.shared.signals.lock() {
            debug!("Registered callback for signal {}", signal);
            signals.register(signal, callback);
        }
    }

    fn stopper(&self) -> CaptureStopper {
        self.stopper.clone()
    }
}

// ─── Playback ───────────────────────────────────────────────────────────────

enum PlayerCommand {
    /// Sequence and the time before which its events are skipped
    Update(TimedSequence, f64),
    Stop,
}

struct VirtualPlayer {
    tx: Sender<PlayerCommand>,
    clock: Arc<dyn Clock>,
    handle: Option<JoinHandle<()>>,
}

impl VirtualPlayer {
    fn spawn(
        sequence: TimedSequence,
        sink: Arc<dyn MidiSink>,
        clock: Arc<dyn Clock>,
        channel: u8,
    ) -> Self {
        let (tx, rx) = unbounded();
        let _ = tx.send(PlayerCommand::Update(sequence, clock.now()));
        let loop_clock = clock.clone();
        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || PlaybackLoop::new(sink, loop_clock, channel).run(rx));
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                error!("Failed to spawn playback thread: {}", e);
                None
            }
        };
        Self { tx, clock, handle }
    }
}

impl Player for VirtualPlayer {
    fn update_sequence(&mut self, sequence: TimedSequence, start_time: Option<f64>) {
        let from = start_time.unwrap_or_else(|| self.clock.now());
        let _ = self.tx.send(PlayerCommand::Update(sequence, from));
    }

    fn stop(&mut self) {
        let _ = self.tx.send(PlayerCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VirtualPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PlaybackLoop {
    sink: Arc<dyn MidiSink>,
    clock: Arc<dyn Clock>,
    channel: u8,
    /// Pending events, latest first so the next one is at the end
    pending: Vec<TimedEvent>,
    sounding: Vec<u8>,
}

impl PlaybackLoop {
    fn new(sink: Arc<dyn MidiSink>, clock: Arc<dyn Clock>, channel: u8) -> Self {
        Self {
            sink,
            clock,
            channel,
            pending: Vec::new(),
            sounding: Vec::new(),
        }
    }

    fn run(mut self, rx: Receiver<PlayerCommand>) {
        loop {
            self.emit_due();
            let wait = match self.pending.last() {
                Some(next) => {
                    let remaining = (next.time - self.clock.now()).max(0.0);
                    Duration::from_secs_f64(remaining).min(MAX_WAIT)
                }
                None => Duration::from_secs(3600),
            };
            match rx.recv_timeout(wait) {
                Ok(PlayerCommand::Update(sequence, from)) => self.load(&sequence, from),
                Ok(PlayerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.silence();
        debug!("Playback stopped");
    }

    fn load(&mut self, sequence: &TimedSequence, from: f64) {
        self.silence();
        let mut events = Vec::with_capacity(sequence.len() * 2);
        for n in sequence.notes.iter().filter(|n| n.start_time >= from) {
            events.push(TimedEvent {
                time: n.start_time,
                event: MidiEvent::NoteOn {
                    channel: self.channel,
                    note: n.pitch,
                    velocity: n.velocity,
                },
            });
            events.push(TimedEvent {
                time: n.end_time,
                event: MidiEvent::NoteOff {
                    channel: self.channel,
                    note: n.pitch,
                },
            });
        }
        // Latest first; at equal times note-offs sort after note-ons so
        // they are popped (played) first.
        events.sort_by(|a, b| {
            b.time.total_cmp(&a.time).then_with(|| {
                let rank = |e: &TimedEvent| matches!(e.event, MidiEvent::NoteOff { .. });
                rank(a).cmp(&rank(b))
            })
        });
        trace!("Playback loaded {} events from {:.3}s", events.len(), from);
        self.pending = events;
    }

    fn emit_due(&mut self) {
        let now = self.clock.now();
        while self.pending.last().is_some_and(|e| e.time <= now) {
            let Some(ev) = self.pending.pop() else { break };
            match ev.event {
                MidiEvent::NoteOn { note, .. } => self.sounding.push(note),
                MidiEvent::NoteOff { note, .. } => {
                    if let Some(i) = self.sounding.iter().position(|&p| p == note) {
                        self.sounding.swap_remove(i);
                    }
                }
                MidiEvent::ControlChange { .. } => {}
            }
            self.sink.send(&ev.event);
        }
    }

    fn silence(&mut self) {
        for note in self.sounding.drain(..) {
            self.sink.send(&MidiEvent::NoteOff {
                channel: self.channel,
                note,
            });
        }
        self.pending.clear();
        self.sink.send(&MidiEvent::ControlChange {
            channel: self.channel,
            control: ALL_NOTES_OFF,
            value: 0,
        });
    }
}

// ─── Metronome ──────────────────────────────────────────────────────────────

struct Metronome {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Metronome {
    fn spawn(
        qpm: f64,
        start_time: f64,
        channel: u8,
        sink: Arc<dyn MidiSink>,
        clock: Arc<dyn Clock>,
    ) -> Option<Self> {
        if qpm <= 0.0 {
            error!("Refusing to start metronome at {} qpm", qpm);
            return None;
        }
        let (stop_tx, stop_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("metronome".into())
            .spawn(move || {
                let beat = 60.0 / qpm;
                let now = clock.now();
                let mut k = ((now - start_time) / beat).ceil().max(0.0) as u64;
                info!("Metronome @ {:.1} qpm on channel {}", qpm, channel + 1);
                loop {
                    let t = start_time + k as f64 * beat;
                    if !wait_until(clock.as_ref(), &stop_rx, t) {
                        break;
                    }
                    let (note, velocity) = if k % BEATS_PER_BAR == 0 {
                        CLICK_ACCENT
                    } else {
                        CLICK_REGULAR
                    };
                    sink.send(&MidiEvent::NoteOn {
                        channel,
                        note,
                        velocity,
                    });
                    let stopped = !wait_until(clock.as_ref(), &stop_rx, t + CLICK_LEN);
                    sink.send(&MidiEvent::NoteOff { channel, note });
                    if stopped {
                        break;
                    }
                    k += 1;
                }
            });
        match handle {
            Ok(handle) => Some(Self { stop_tx, handle }),
            Err(e) => {
                error!("Failed to spawn metronome thread: {}", e);
                None
            }
        }
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}
