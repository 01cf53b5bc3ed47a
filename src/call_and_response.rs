use crate::config::{CallAndResponseConfig, ConfigError, InteractionConfig};
use crate::generator::{GeneratorError, GeneratorOptions, SequenceGenerator, TimeWindow};
use crate::hub::{Capture, MidiHub, Player};
use crate::interaction::{InteractionError, StopSignal, TickHandler};
use crate::params::ParameterResolver;
use crate::signals::SignalFlags;
use crate::types::*;
use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// Mutable state of one run of the loop. Owned by the loop thread only.
#[derive(Debug, Clone)]
pub struct Session {
    pub phase: Phase,
    /// Non-silent ticks since the call started
    pub listen_ticks: u32,
    pub last_tick_time: f64,
    pub response: TimedSequence,
    pub response_start_time: f64,
    pub response_duration: f64,
}

impl Session {
    pub fn new(start_time: f64, qpm: f64) -> Self {
        Self {
            phase: Phase::Idle,
            listen_ticks: 0,
            last_tick_time: start_time,
            response: TimedSequence::new(qpm),
            response_start_time: 0.0,
            response_duration: 0.0,
        }
    }
}

/// Alternates between capturing a call from the hub and playing a generated
/// response, one decision per clock tick.
///
/// A call starts with the first captured note and ends on the end-call
/// signal, on a tick with no input, or after `max_listen_ticks`. The
/// response is generated immediately and lasts either `response_ticks` ticks
/// or as long as the call. When generation overruns a quarter tick the
/// response is pushed back by whole ticks so it never starts in the past.
pub struct CallAndResponse {
    hub: Arc<dyn MidiHub>,
    clock: Arc<dyn Clock>,
    params: ParameterResolver,
    config: CallAndResponseConfig,
    flags: SignalFlags,
    observers: Vec<Sender<InteractionEvent>>,
}

impl CallAndResponse {
    pub fn new(
        hub: Arc<dyn MidiHub>,
        clock: Arc<dyn Clock>,
        params: ParameterResolver,
        config: CallAndResponseConfig,
    ) -> Self {
        Self {
            hub,
            clock,
            params,
            config,
            flags: SignalFlags::default(),
            observers: Vec::new(),
        }
    }

    /// Validate `config` and build the interaction over `hub`.
    pub fn from_config<H: MidiHub + 'static>(
        hub: Arc<H>,
        clock: Arc<dyn Clock>,
        config: &InteractionConfig,
        generators: Vec<Arc<dyn SequenceGenerator>>,
    ) -> Result<Self, ConfigError> {
        let validated = config.validate()?;
        let params = ParameterResolver::new(
            hub.clone(),
            config.controls.clone(),
            config.qpm,
            config.temperature,
            generators,
        )?;
        Ok(Self::new(hub, clock, params, validated))
    }

    pub fn with_observer(mut self, tx: Sender<InteractionEvent>) -> Self {
        self.observers.push(tx);
        self
    }

    /// The sticky end-call/panic/mutate flags, for triggering from outside
    /// the registered signals.
    pub fn flags(&self) -> &SignalFlags {
        &self.flags
    }

    pub fn params(&self) -> &ParameterResolver {
        &self.params
    }

    /// The metronome only runs against a fixed tick period.
    fn metronome_channel(&self) -> Option<u8> {
        self.config
            .metronome_channel
            .filter(|_| self.config.tick_source.is_period())
    }

    fn emit(&self, event: InteractionEvent) {
        for tx in &self.observers {
            let _ = tx.send(event.clone());
        }
    }

    fn update_state(&self, session: &mut Session, phase: Phase, time: f64) {
        if let Some(control) = self.config.state_control {
            self.hub.send_control_change(control, phase.control_value());
        }
        if session.phase != phase {
            info!("State: {}", phase);
            session.phase = phase;
            self.emit(InteractionEvent::State { time, phase });
        } else {
            trace!("State: {}", phase);
        }
    }

    /// Generate with the selected generator over `[start, end]`, treating
    /// `zero_time` as the start of the seed. Returns the response in
    /// absolute time and the generator id.
    fn generate(
        &self,
        seed: &TimedSequence,
        zero_time: f64,
        start: f64,
        end: f64,
    ) -> Result<(TimedSequence, String), GeneratorError> {
        let rel_start = start - zero_time;
        let rel_end = end - zero_time;
        let options = GeneratorOptions {
            input_window: TimeWindow::new(0.0, rel_start),
            generate_window: TimeWindow::new(rel_start, rel_end),
            temperature: self.params.temperature(),
        };

        let generator = self.params.generator();
        let details = generator.details();
        info!("Generating sequence using '{}' generator.", details.id);
        debug!("Generator details: {:?}", details);
        debug!("Generator options: {:?}", options);

        let generated = generator.generate(&seed.shifted(-zero_time), &options)?;
        let response = generated.trimmed(rel_start, rel_end).shifted(zero_time);
        Ok((response, details.id.clone()))
    }

    /// Handle one clock tick. `captured` holds everything captured since the
    /// capture's start time, with `total_time` set to the tick time.
    pub fn process_tick(
        &self,
        session: &mut Session,
        mut captured: TimedSequence,
        capture: &mut dyn Capture,
        player: &mut dyn Player,
    ) -> Result<(), GeneratorError> {
        // Flags raised after this point are seen next tick.
        let end_call = self.flags.end_call.take();
        let panic = self.flags.panic.take();
        let mut mutate = self.flags.mutate.is_set();

        let tick_time = captured.total_time;
        let qpm = self.params.qpm();
        if let Some(channel) = self.metronome_channel() {
            self.hub.start_metronome(qpm, tick_time, channel);
        }
        captured.qpm = qpm;

        let tick_duration = tick_time - session.last_tick_time;
        let silent_tick = captured.last_end_time() <= session.last_tick_time;
        if !silent_tick {
            session.listen_ticks += 1;
        }
        trace!(
            "Tick @ {:.3}s: {} captured, silent={}, listen_ticks={}",
            tick_time,
            captured.len(),
            silent_tick,
            session.listen_ticks
        );

        if captured.is_empty() {
            if session.response.total_time <= tick_time {
                self.update_state(session, Phase::Idle, tick_time);
            }
            if capture.start_time() < tick_time {
                capture.set_start_time(tick_time);
            }
            session.listen_ticks = 0;
        } else if end_call
            || silent_tick
            || self.params.max_listen_ticks().reached(session.listen_ticks)
        {
            let min_listen_ticks = self.params.min_listen_ticks();
            if session.listen_ticks < min_listen_ticks {
                info!(
                    "Input too short ({} vs {}). Skipping.",
                    session.listen_ticks, min_listen_ticks
                );
                self.emit(InteractionEvent::CallSkipped {
                    time: tick_time,
                    listen_ticks: session.listen_ticks,
                    min_listen_ticks,
                });
                capture.set_start_time(tick_time);
            } else {
                self.respond(
                    session,
                    captured,
                    silent_tick,
                    tick_duration,
                    capture,
                    player,
                )?;
            }
            session.listen_ticks = 0;
        } else {
            self.update_state(session, Phase::Listening, tick_time);
        }

        if panic {
            session.response = TimedSequence::new(qpm);
            player.update_sequence(session.response.clone(), None);
            info!("Panic: playback cleared.");
            self.emit(InteractionEvent::Panic { time: tick_time });
        }

        if mutate && session.response.is_empty() {
            self.flags.mutate.clear();
            mutate = false;
            warn!("Ignoring mutate request with nothing to mutate.");
            self.emit(InteractionEvent::MutateIgnored { time: tick_time });
        }

        if session.response.total_time <= tick_time
            && !session.response.is_empty()
            && (mutate || self.params.loop_enabled())
        {
            let mut mutated_by = None;
            if mutate {
                let new_start = session.response_start_time + session.response_duration;
                let (response, generator) = self.generate(
                    &session.response,
                    session.response_start_time,
                    new_start,
                    new_start + session.response_duration,
                )?;
                session.response = response;
                session.response_start_time = new_start;
                self.flags.mutate.clear();
                mutated_by = Some(generator);
            }

            session.response = session
                .response
                .shifted(tick_time - session.response_start_time);
            session.response_start_time = tick_time;
            player.update_sequence(session.response.clone(), Some(tick_time));

            match mutated_by {
                Some(generator) => {
                    info!("Mutated response @ {:.3}s", tick_time);
                    self.emit(InteractionEvent::Mutated {
                        time: tick_time,
                        generator,
                        start_time: tick_time,
                        sequence: session.response.clone(),
                    });
                }
                None => {
                    debug!("Looping response @ {:.3}s", tick_time);
                    self.emit(InteractionEvent::Looped {
                        time: tick_time,
                        start_time: tick_time,
                    });
                }
            }
        }

        session.last_tick_time = tick_time;
        Ok(())
    }

    /// End the call: generate the response, correct for generation latency,
    /// start playback and move the capture window.
    fn respond(
        &self,
        session: &mut Session,
        mut captured: TimedSequence,
        silent_tick: bool,
        tick_duration: f64,
        capture: &mut dyn Capture,
        player: &mut dyn Player,
    ) -> Result<(), GeneratorError> {
        let tick_time = captured.total_time;
        self.update_state(session, Phase::Responding, tick_time);

        let mut capture_start = capture.start_time();
        if silent_tick {
            // Drop the silent tick from the call so the seed ends where the
            // response begins.
            captured = captured.shifted(tick_duration);
            captured.total_time = tick_time;
            capture_start += tick_duration;
        }

        session.response_duration = match self.params.response_ticks() {
            Some(ticks) => ticks as f64 * tick_duration,
            None => tick_time - capture_start,
        };

        let mut response_start = tick_time;
        let (mut response, generator) = self.generate(
            &captured,
            capture_start,
            response_start,
            response_start + session.response_duration,
        )?;

        let elapsed = self.clock.now() - response_start;
        if tick_duration > 0.0 && elapsed >= tick_duration / 4.0 {
            let push_ticks = ((elapsed / tick_duration).ceil() as u32).max(1);
            let push = push_ticks as f64 * tick_duration;
            response_start += push;
            response = response.shifted(push);
            warn!("Response too late. Pushing back {} ticks.", push_ticks);
            self.emit(InteractionEvent::LateResponse {
                time: tick_time,
                push_ticks,
            });
        }

        // Pass the start time so lag doesn't strip the opening notes.
        player.update_sequence(response.clone(), Some(response_start));
        self.emit(InteractionEvent::Response {
            time: tick_time,
            generator,
            start_time: response_start,
            duration: session.response_duration,
            sequence: response.clone(),
        });

        if self.config.allow_overlap {
            capture.set_start_time(response_start);
        } else {
            capture.set_start_time(response_start + session.response_duration);
        }

        session.response = response;
        session.response_start_time = response_start;
        Ok(())
    }
}

impl TickHandler for CallAndResponse {
    fn name(&self) -> &str {
        "call-and-response"
    }

    fn run(&mut self, stop: &StopSignal) -> Result<(), InteractionError> {
        let start_time = self.clock.now();
        let qpm = self.params.qpm();
        let mut capture = self.hub.start_capture(qpm, start_time);

        if let Some(channel) = self.metronome_channel() {
            self.hub.start_metronome(qpm, start_time, channel);
        }

        let signals = [
            (self.config.end_call_signal, &self.flags.end_call, "End call"),
            (self.config.panic_signal, &self.flags.panic, "Panic"),
            (self.config.mutate_signal, &self.flags.mutate, "Mutate"),
        ];
        for (signal, flag, name) in signals {
            if let Some(signal) = signal {
                capture.register_callback(signal, flag.callback(name));
            }
        }

        let stopper = capture.stopper();
        stop.on_stop(move || stopper.stop());
        let hub = self.hub.clone();
        stop.on_stop(move || hub.stop_metronome());

        let mut session = Session::new(start_time, qpm);
        let mut player = self.hub.start_playback(session.response.clone());
        let tick_source = self.config.tick_source;
        info!("Call and response running ({:?})", tick_source);

        let mut result = Ok(());
        while let Some(captured) = capture.next_tick(&tick_source) {
            if stop.is_set() {
                break;
            }
            if let Err(e) =
                self.process_tick(&mut session, captured, capture.as_mut(), player.as_mut())
            {
                error!("Generation failed: {}", e);
                result = Err(e.into());
                break;
            }
        }

        player.stop();
        self.hub.stop_metronome();
        self.emit(InteractionEvent::Stopped {
            time: self.clock.now(),
        });
        result
    }
}
