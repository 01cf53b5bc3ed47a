use crate::config::InteractionConfig;
use crate::types::*;
use crossbeam_channel::Receiver;
use log::{error, info};
use serde_json::json;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Records the interaction event stream to a session directory:
/// `manifest.json`, `events.jsonl` (one event per line) and `stats.json`.
pub struct EventLogger {
    rx: Receiver<InteractionEvent>,
    session_dir: PathBuf,
}

/// Totals written to `stats.json` when the stream ends.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionStats {
    pub events: u64,
    pub responses: u64,
    pub skipped_calls: u64,
    pub late_responses: u64,
    pub panics: u64,
    pub response_notes: u64,
}

impl SessionStats {
    fn record(&mut self, event: &InteractionEvent) {
        self.events += 1;
        match event {
            InteractionEvent::Response { sequence, .. }
            | InteractionEvent::Mutated { sequence, .. } => {
                self.responses += 1;
                self.response_notes += sequence.len() as u64;
            }
            InteractionEvent::CallSkipped { .. } => self.skipped_calls += 1,
            InteractionEvent::LateResponse { .. } => self.late_responses += 1,
            InteractionEvent::Panic { .. } => self.panics += 1,
            _ => {}
        }
    }
}

impl EventLogger {
    /// Create `session_<unix secs>` under `output_dir` and write the manifest.
    pub fn new(
        rx: Receiver<InteractionEvent>,
        output_dir: &Path,
        config: &InteractionConfig,
    ) -> io::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let session_dir = output_dir.join(format!("session_{}", timestamp));
        fs::create_dir_all(&session_dir)?;

        let logger = Self { rx, session_dir };
        logger.write_manifest(config)?;
        Ok(logger)
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Run the logger until every sender is gone. Blocks the calling thread.
    pub fn run(&self) -> io::Result<SessionStats> {
        info!("Event logger → {:?}", self.session_dir);

        let events_path = self.session_dir.join("events.jsonl");
        let mut writer = BufWriter::new(File::create(&events_path)?);
        let mut stats = SessionStats::default();

        for event in self.rx.iter() {
            match serde_json::to_string(&event) {
                Ok(line) => writeln!(writer, "{}", line)?,
                Err(e) => error!("Failed to encode event: {}", e),
            }
            stats.record(&event);

            // Responses are rare; flush so a crash keeps them.
            if matches!(event, InteractionEvent::Response { .. }) {
                writer.flush()?;
            }
        }
        writer.flush()?;

        let summary = json!({
            "total_events": stats.events,
            "responses": stats.responses,
            "skipped_calls": stats.skipped_calls,
            "late_responses": stats.late_responses,
            "panics": stats.panics,
            "response_notes": stats.response_notes,
        });
        let stats_path = self.session_dir.join("stats.json");
        if let Err(e) = fs::write(&stats_path, serde_json::to_string_pretty(&summary)?) {
            error!("Failed to write stats: {}", e);
        }

        info!(
            "Session saved: {} events, {} responses → {:?}",
            stats.events, stats.responses, self.session_dir
        );
        Ok(stats)
    }

    fn write_manifest(&self, config: &InteractionConfig) -> io::Result<()> {
        let manifest = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "system": "call-response",
            "config": config,
            "files": {
                "events": "events.jsonl",
                "stats": "stats.json",
            },
        });
        let path = self.session_dir.join("manifest.json");
        fs::write(&path, serde_json::to_string_pretty(&manifest)?)
    }
}

/// Read back an `events.jsonl` file. Malformed lines are skipped.
pub fn read_events(path: &Path) -> io::Result<Vec<InteractionEvent>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_logs_events_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let logger = EventLogger::new(rx, dir.path(), &InteractionConfig::default()).unwrap();
        let session = logger.session_dir().to_path_buf();
        assert!(session.join("manifest.json").exists());

        let mut seq = TimedSequence::new(120.0);
        seq.push(Note::new(60, 100, 4.0, 4.5));
        tx.send(InteractionEvent::State {
            time: 2.0,
            phase: Phase::Listening,
        })
        .unwrap();
        tx.send(InteractionEvent::Response {
            time: 4.0,
            generator: "echo".into(),
            start_time: 4.0,
            duration: 2.0,
            sequence: seq,
        })
        .unwrap();
        tx.send(InteractionEvent::Panic { time: 5.0 }).unwrap();
        drop(tx);

        let stats = logger.run().unwrap();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.responses, 1);
        assert_eq!(stats.response_notes, 1);
        assert_eq!(stats.panics, 1);

        let events = read_events(&session.join("events.jsonl")).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], InteractionEvent::Panic { time: 5.0 });

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(session.join("stats.json")).unwrap())
                .unwrap();
        assert_eq!(summary["total_events"], 3);
    }

    #[test]
    fn test_manifest_carries_config() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = unbounded();
        let config = InteractionConfig {
            qpm: 90.0,
            ..Default::default()
        };
        let logger = EventLogger::new(rx, dir.path(), &config).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(logger.session_dir().join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["config"]["qpm"], 90.0);
        assert_eq!(manifest["system"], "call-response");
    }
}
