use crate::types::*;
use crossbeam_channel::Receiver;
use std::io::{self, Write};

/// Number of recent events kept on screen.
const HISTORY: usize = 12;

/// Renders a live ASCII monitor of the interaction.
pub struct ConsoleDisplay {
    rx: Receiver<InteractionEvent>,
    /// Redraw the whole panel per event (false: append one line per event)
    redraw: bool,
}

/// What the monitor shows, folded from the event stream.
#[derive(Debug, Default)]
pub struct MonitorState {
    pub phase: Option<Phase>,
    pub responses: u32,
    pub skipped: u32,
    pub late: u32,
    pub last_response: Option<TimedSequence>,
    pub history: Vec<String>,
}

impl MonitorState {
    pub fn apply(&mut self, event: &InteractionEvent) {
        match event {
            InteractionEvent::State { phase, .. } => self.phase = Some(*phase),
            InteractionEvent::CallSkipped { .. } => self.skipped += 1,
            InteractionEvent::Response { sequence, .. }
            | InteractionEvent::Mutated { sequence, .. } => {
                self.responses += 1;
                self.last_response = Some(sequence.clone());
            }
            InteractionEvent::LateResponse { .. } => self.late += 1,
            InteractionEvent::Panic { .. } => self.last_response = None,
            _ => {}
        }
        self.history.push(event.to_string());
        if self.history.len() > HISTORY {
            self.history.remove(0);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("╔══════════════════════════════════════════════════════════╗\n");
        out.push_str("║  CALL & RESPONSE — Live Monitor                          ║\n");
        out.push_str("╠══════════════════════════════════════════════════════════╣\n");

        let phase = self
            .phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "---".into());
        out.push_str(&format!("║  State: {:<49}║\n", phase));
        out.push_str(&format!(
            "║  Responses: {:<5} Skipped: {:<5} Late: {:<15}║\n",
            self.responses, self.skipped, self.late
        ));

        out.push_str("║                                                          ║\n");
        match &self.last_response {
            Some(seq) if !seq.is_empty() => {
                let names: Vec<String> = seq
                    .notes
                    .iter()
                    .take(12)
                    .map(|n| note_name(n.pitch))
                    .collect();
                out.push_str(&format!("║  Last: {:<50}║\n", names.join(" ")));
                out.push_str(&format!("║  {:<56}║\n", piano_roll(seq, 54)));
            }
            _ => {
                out.push_str("║  Last: ---                                               ║\n");
                out.push_str(&format!("║  {:56}║\n", ""));
            }
        }

        out.push_str("║                                                          ║\n");
        for line in &self.history {
            let line: String = line.chars().take(56).collect();
            out.push_str(&format!("║  {:<56}║\n", line));
        }
        out.push_str("╚══════════════════════════════════════════════════════════╝\n");
        out
    }
}

impl ConsoleDisplay {
    pub fn new(rx: Receiver<InteractionEvent>, redraw: bool) -> Self {
        Self { rx, redraw }
    }

    /// Blocks until every event sender is gone.
    pub fn run(&self) {
        let mut state = MonitorState::default();
        let mut stdout = io::stdout();

        for event in self.rx.iter() {
            state.apply(&event);
            if self.redraw {
                // Clear screen and move cursor home
                print!("\x1b[2J\x1b[H{}", state.render());
            } else {
                println!("{}", event);
            }
            let _ = stdout.flush();
        }
    }
}

/// One-row piano roll: each column is a slice of the sequence, marked where
/// a note is sounding.
fn piano_roll(seq: &TimedSequence, width: usize) -> String {
    let start = seq.first_start_time().unwrap_or(0.0);
    let span = (seq.total_time - start).max(1e-6);
    (0..width)
        .map(|i| {
            let t = start + span * (i as f64 + 0.5) / width as f64;
            if seq.notes.iter().any(|n| n.start_time <= t && t < n.end_time) {
                '█'
            } else {
                '░'
            }
        })
        .collect()
}
