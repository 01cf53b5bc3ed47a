//! Hardware MIDI ports via midir. Input feeds a `VirtualHub`; output is a
//! `MidiSink` the hub plays through.

use super::{MidiSink, VirtualHub};
use crate::midi::MidiEvent;
use log::{debug, error, info, warn};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::sync::{Arc, Mutex};

const CLIENT_NAME: &str = "call-response";

#[derive(Debug, thiserror::Error)]
pub enum MidiPortError {
    #[error("MIDI init error: {0}")]
    Init(String),

    #[error("no MIDI {direction} port matching '{name}'")]
    NotFound { direction: &'static str, name: String },

    #[error("MIDI connection failed: {0}")]
    Connect(String),
}

/// Names of the available input ports.
pub fn list_input_ports() -> Result<Vec<String>, MidiPortError> {
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(|e| MidiPortError::Init(e.to_string()))?;
    Ok(midi_in
        .ports()
        .iter()
        .filter_map(|p| midi_in.port_name(p).ok())
        .collect())
}

/// Names of the available output ports.
pub fn list_output_ports() -> Result<Vec<String>, MidiPortError> {
    let midi_out =
        MidiOutput::new(CLIENT_NAME).map_err(|e| MidiPortError::Init(e.to_string()))?;
    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|p| midi_out.port_name(p).ok())
        .collect())
}

/// Index of the first port whose name contains `wanted` (or the first port).
fn pick_port(names: &[String], wanted: Option<&str>) -> Option<usize> {
    match wanted {
        None => (!names.is_empty()).then_some(0),
        Some(w) => names.iter().position(|n| n.contains(w)),
    }
}

/// Open input connection. Dropping it disconnects.
pub struct MidiInputLink {
    port_name: String,
    _connection: MidiInputConnection<()>,
}

impl MidiInputLink {
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// Connect an input port to `hub`. Every parsed message is delivered with
/// `VirtualHub::receive`, stamped by the hub's clock.
pub fn connect_input(
    hub: Arc<VirtualHub>,
    port: Option<&str>,
) -> Result<MidiInputLink, MidiPortError> {
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(|e| MidiPortError::Init(e.to_string()))?;
    let ports = midi_in.ports();
    let names: Vec<String> = ports
        .iter()
        .map(|p| midi_in.port_name(p).unwrap_or_else(|_| "Unknown".into()))
        .collect();

    let index = pick_port(&names, port).ok_or_else(|| MidiPortError::NotFound {
        direction: "input",
        name: port.unwrap_or("*").into(),
    })?;
    let port_name = names[index].clone();
    info!("Opening MIDI input: {}", port_name);

    let connection = midi_in
        .connect(
            &ports[index],
            "call-response-input",
            move |_timestamp, message, _| match MidiEvent::from_bytes(message) {
                Some(event) => hub.receive(event),
                None => debug!("Ignoring MIDI message {:02X?}", message),
            },
            (),
        )
        .map_err(|e| MidiPortError::Connect(e.to_string()))?;

    Ok(MidiInputLink {
        port_name,
        _connection: connection,
    })
}

/// Sends played events to a hardware output port.
pub struct MidirSink {
    port_name: String,
    connection: Mutex<MidiOutputConnection>,
}

impl MidirSink {
    pub fn connect(port: Option<&str>) -> Result<Self, MidiPortError> {
        let midi_out =
            MidiOutput::new(CLIENT_NAME).map_err(|e| MidiPortError::Init(e.to_string()))?;
        let ports = midi_out.ports();
        let names: Vec<String> = ports
            .iter()
            .map(|p| midi_out.port_name(p).unwrap_or_else(|_| "Unknown".into()))
            .collect();

        let index = pick_port(&names, port).ok_or_else(|| MidiPortError::NotFound {
            direction: "output",
            name: port.unwrap_or("*").into(),
        })?;
        let port_name = names[index].clone();
        info!("Opening MIDI output: {}", port_name);

        let connection = midi_out
            .connect(&ports[index], "call-response-output")
            .map_err(|e| MidiPortError::Connect(e.to_string()))?;

        Ok(Self {
            port_name,
            connection: Mutex::new(connection),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl MidiSink for MidirSink {
    fn send(&self, event: &MidiEvent) {
        let Ok(mut conn) = self.connection.lock() else {
            error!("MIDI output lock poisoned; dropping {}", event);
            return;
        };
        if let Err(e) = conn.send(&event.to_bytes()) {
            warn!("MIDI send failed ({}): {}", event, e);
        }
    }
}
