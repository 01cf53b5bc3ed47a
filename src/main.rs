use call_response::call_and_response::CallAndResponse;
use call_response::config::InteractionConfig;
use call_response::console_display::ConsoleDisplay;
use call_response::event_logger::EventLogger;
use call_response::generator::{EchoGenerator, RandomWalkGenerator, SequenceGenerator};
use call_response::hub::{LogSink, MidiSink, VirtualHub};
use call_response::interaction::Interaction;
use call_response::signals::MidiSignal;
use call_response::simulator::{self, Gesture, Simulator};
use call_response::types::*;
#[cfg(feature = "hardware")]
use call_response::hub::midi_port;

use clap::{Parser, ValueEnum};
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{error, info};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "call-response")]
#[command(about = "Tick-driven MIDI call-and-response interaction")]
struct Cli {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Default tempo when no tempo control is mapped
    #[arg(long)]
    qpm: Option<f64>,

    /// Fixed tick length in seconds (defaults to one beat)
    #[arg(long)]
    tick_duration: Option<f64>,

    /// Tick on an incoming signal instead, e.g. "cc:1=127" or "note:36@10"
    #[arg(long)]
    clock_signal: Option<MidiSignal>,

    /// Signal that ends the current call immediately
    #[arg(long)]
    end_call_signal: Option<MidiSignal>,

    /// Signal that silences playback
    #[arg(long)]
    panic_signal: Option<MidiSignal>,

    /// Signal that regenerates the response from itself
    #[arg(long)]
    mutate_signal: Option<MidiSignal>,

    /// Keep capturing while the response plays
    #[arg(long)]
    allow_overlap: bool,

    /// MIDI channel (0-15) for metronome clicks
    #[arg(long)]
    metronome_channel: Option<u8>,

    /// MIDI channel (0-15) for played responses and state control changes
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..16))]
    output_channel: u8,

    /// Control number selecting the generator
    #[arg(long)]
    generator_select_control: Option<u8>,

    /// Control number setting the tempo
    #[arg(long)]
    tempo_control: Option<u8>,

    /// Control number setting the sampling temperature
    #[arg(long)]
    temperature_control: Option<u8>,

    /// Control number setting the minimum call length in ticks
    #[arg(long)]
    min_listen_ticks_control: Option<u8>,

    /// Control number setting the maximum call length in ticks
    #[arg(long)]
    max_listen_ticks_control: Option<u8>,

    /// Control number setting a fixed response length in ticks
    #[arg(long)]
    response_ticks_control: Option<u8>,

    /// Control number enabling response looping (on at 127)
    #[arg(long)]
    loop_control: Option<u8>,

    /// Control number the current state is sent on (0 idle, 1 listening, 2 responding)
    #[arg(long)]
    state_control: Option<u8>,

    /// Generators to offer, in control order (repeatable)
    #[arg(long = "generator", value_enum)]
    generators: Vec<GeneratorKind>,

    /// Seed for the random generator
    #[arg(long)]
    seed: Option<u64>,

    /// Drive the interaction with a scripted performer (no hardware required)
    #[arg(long)]
    simulate: bool,

    /// Enable console display
    #[arg(long)]
    console: bool,

    /// Redraw the console as a panel instead of printing one line per event
    #[arg(long)]
    console_panel: bool,

    /// Record events as JSONL under this directory
    #[arg(long)]
    log_events: Option<PathBuf>,

    /// Stop after this many seconds (default: run until the input ends)
    #[arg(long)]
    run_secs: Option<f64>,

    /// List MIDI ports and exit
    #[cfg(feature = "hardware")]
    #[arg(long)]
    list_ports: bool,

    /// MIDI input port (substring match; first port if omitted)
    #[cfg(feature = "hardware")]
    #[arg(long)]
    input_port: Option<String>,

    /// MIDI output port (substring match; log-only output if omitted)
    #[cfg(feature = "hardware")]
    #[arg(long)]
    output_port: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum GeneratorKind {
    Echo,
    Random,
}

impl Cli {
    /// File config (or defaults) with flag overrides applied.
    fn interaction_config(&self) -> Result<InteractionConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => InteractionConfig::load(path)?,
            None => InteractionConfig::default(),
        };

        if let Some(qpm) = self.qpm {
            config.qpm = qpm;
        }
        if self.tick_duration.is_some() || self.clock_signal.is_some() {
            config.tick_duration = self.tick_duration;
            config.clock_signal = self.clock_signal;
        }
        if config.tick_duration.is_none() && config.clock_signal.is_none() {
            config.tick_duration = Some(60.0 / config.qpm);
        }
        config.end_call_signal = self.end_call_signal.or(config.end_call_signal);
        config.panic_signal = self.panic_signal.or(config.panic_signal);
        config.mutate_signal = self.mutate_signal.or(config.mutate_signal);
        config.allow_overlap |= self.allow_overlap;
        config.metronome_channel = self.metronome_channel.or(config.metronome_channel);
        config.state_control = self.state_control.or(config.state_control);

        let c = &mut config.controls;
        c.generator_select = self.generator_select_control.or(c.generator_select);
        c.tempo = self.tempo_control.or(c.tempo);
        c.temperature = self.temperature_control.or(c.temperature);
        c.min_listen_ticks = self.min_listen_ticks_control.or(c.min_listen_ticks);
        c.max_listen_ticks = self.max_listen_ticks_control.or(c.max_listen_ticks);
        c.response_ticks = self.response_ticks_control.or(c.response_ticks);
        c.loop_enabled = self.loop_control.or(c.loop_enabled);
        Ok(config)
    }

    fn generators(&self) -> Vec<Arc<dyn SequenceGenerator>> {
        let kinds = if self.generators.is_empty() {
            vec![GeneratorKind::Echo]
        } else {
            self.generators.clone()
        };
        kinds
            .into_iter()
            .map(|kind| -> Arc<dyn SequenceGenerator> {
                match (kind, self.seed) {
                    (GeneratorKind::Echo, _) => Arc::new(EchoGenerator::new()),
                    (GeneratorKind::Random, Some(seed)) => {
                        Arc::new(RandomWalkGenerator::with_seed(seed))
                    }
                    (GeneratorKind::Random, None) => Arc::new(RandomWalkGenerator::new()),
                }
            })
            .collect()
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    #[cfg(feature = "hardware")]
    if cli.list_ports {
        for name in midi_port::list_input_ports()? {
            println!("in:  {}", name);
        }
        for name in midi_port::list_output_ports()? {
            println!("out: {}", name);
        }
        return Ok(());
    }

    let config = cli.interaction_config()?;
    if let Some(path) = &cli.save_config {
        config.save(path)?;
        return Ok(());
    }
    let validated = config.validate()?;

    #[cfg(feature = "hardware")]
    let simulate = cli.simulate;
    #[cfg(not(feature = "hardware"))]
    let simulate = {
        if !cli.simulate {
            log::warn!("Hardware mode requires 'hardware' feature. Falling back to simulator.");
        }
        true
    };

    info!("═══════════════════════════════════════════════");
    info!("  CALL & RESPONSE v{}", env!("CARGO_PKG_VERSION"));
    info!("  Tick: {:?}", validated.tick_source);
    info!("  Mode: {}", if simulate { "SIMULATOR" } else { "HARDWARE" });
    if cli.console {
        info!("  UI: Console");
    }
    if let Some(dir) = &cli.log_events {
        info!("  Event log: {:?}", dir);
    }
    info!("═══════════════════════════════════════════════");

    let clock: Arc<dyn Clock> = Arc::new(SessionClock::new());

    #[cfg(feature = "hardware")]
    let sink: Arc<dyn MidiSink> = match &cli.output_port {
        Some(port) => Arc::new(midi_port::MidirSink::connect(Some(port))?),
        None => Arc::new(LogSink),
    };
    #[cfg(not(feature = "hardware"))]
    let sink: Arc<dyn MidiSink> = Arc::new(LogSink);

    let hub = Arc::new(
        VirtualHub::new(clock.clone(), sink).with_output_channel(cli.output_channel),
    );
    let mut handles = Vec::new();
    let mut observers: Vec<Sender<InteractionEvent>> = Vec::new();

    // ─── Console display ────────────────────────────────────────────
    if cli.console {
        let (tx, rx) = unbounded::<InteractionEvent>();
        observers.push(tx);
        let panel = cli.console_panel;
        handles.push(
            thread::Builder::new()
                .name("display".into())
                .spawn(move || ConsoleDisplay::new(rx, panel).run())?,
        );
    }

    // ─── Event logger ───────────────────────────────────────────────
    if let Some(dir) = &cli.log_events {
        let (tx, rx) = unbounded::<InteractionEvent>();
        observers.push(tx);
        let logger = EventLogger::new(rx, dir, &config)?;
        handles.push(thread::Builder::new().name("logger".into()).spawn(move || {
            if let Err(e) = logger.run() {
                error!("Event logger failed: {}", e);
            }
        })?);
    }

    // ─── Interaction ────────────────────────────────────────────────
    let mut machine =
        CallAndResponse::from_config(hub.clone(), clock.clone(), &config, cli.generators())?;
    for tx in observers {
        machine = machine.with_observer(tx);
    }
    let mut interaction = Interaction::start(machine)?;

    // ─── Input source ───────────────────────────────────────────────
    let (sim_stop_tx, sim_stop_rx) = bounded::<()>(1);
    #[cfg(feature = "hardware")]
    let mut _input_link = None;
    if simulate {
        let tick = config.tick_duration.unwrap_or(60.0 / config.qpm);
        let tick_ms = (tick * 1000.0).round().max(1.0) as u32;
        let script = simulator::demo_script(tick_ms, config.end_call_signal);

        let sim = Simulator::new(hub.clone(), 0, sim_stop_rx.clone());
        handles.push(
            thread::Builder::new()
                .name("simulator".into())
                .spawn(move || sim.run_forever(&script))?,
        );

        // A signal clock needs someone to send the pulses.
        if let Some(signal) = config.clock_signal {
            let beat_ms = (60_000.0 / config.qpm).round().max(1.0) as u32;
            let pulses = [Gesture::Signal(signal), Gesture::Rest { ms: beat_ms }];
            let pulser = Simulator::new(hub.clone(), 0, sim_stop_rx);
            handles.push(
                thread::Builder::new()
                    .name("pulse".into())
                    .spawn(move || pulser.run_forever(&pulses))?,
            );
        }
    } else {
        #[cfg(feature = "hardware")]
        {
            _input_link = Some(midi_port::connect_input(
                hub.clone(),
                cli.input_port.as_deref(),
            )?);
        }
    }

    // ─── Run ────────────────────────────────────────────────────────
    let result = match cli.run_secs {
        Some(secs) => {
            info!("Running for {:.1}s...", secs);
            let deadline = Duration::from_secs_f64(secs.max(0.0));
            let step = Duration::from_millis(50);
            let mut waited = Duration::ZERO;
            while waited < deadline && !interaction.is_finished() {
                thread::sleep(step);
                waited += step;
            }
            interaction.stop()
        }
        None => {
            info!("Running. Press Ctrl+C to stop.");
            interaction.wait()
        }
    };

    // Disconnecting the stop channel ends every script player.
    drop(sim_stop_tx);
    drop(interaction);
    for h in handles {
        let _ = h.join();
    }
    result?;
    Ok(())
}
