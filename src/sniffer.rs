//! Serial bus sniffer for debugging and development
//!
//! Prints every decoded frame on the link, either straight from a port
//! (`run_cli_sniffer`) or from a running controller's wire events.

use anyhow::{Context, Result};
use colored::*;
use std::sync::Arc;
use std::time::Instant;

use crate::events::FaderEvent;
use crate::midi::{format_hex, MidiFramer, MidiMessage};
use crate::transport::{self, LinkEvent, PortOpener, SerialSettings, SerialTransport};

/// Direction of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn display(&self) -> ColoredString {
        match self {
            Direction::Input => "IN ".green(),
            Direction::Output => "OUT".red(),
        }
    }
}

/// One observed frame
#[derive(Debug, Clone)]
pub struct SnifferEvent {
    pub timestamp_ms: u64,
    pub direction: Direction,
    pub port_name: String,
    pub message: MidiMessage,
}

impl SnifferEvent {
    /// Wire-level controller events only
    pub fn from_fader_event(event: &FaderEvent, timestamp_ms: u64, port_name: &str) -> Option<Self> {
        let (direction, message) = match event {
            FaderEvent::MidiIn(m) => (Direction::Input, *m),
            FaderEvent::MidiOut(m) => (Direction::Output, *m),
            _ => return None,
        };
        Some(Self {
            timestamp_ms,
            direction,
            port_name: port_name.to_string(),
            message,
        })
    }

    /// Uncoloured line, `[timestamp] DIR PORT | HEX => PARSED`
    pub fn plain_line(&self) -> String {
        let direction = match self.direction {
            Direction::Input => "IN ",
            Direction::Output => "OUT",
        };
        crate::midi::format_sniffer(self.timestamp_ms, direction, &short_port(&self.port_name), &self.message)
    }
}

fn short_port(name: &str) -> String {
    if name.chars().count() > 20 {
        format!("{}...", name.chars().take(17).collect::<String>())
    } else {
        name.to_string()
    }
}

/// Print one event with colours per message type
pub fn print_event(event: &SnifferEvent) {
    let hex = format_hex(&event.message.encode());
    let hex_colored = match event.message {
        MidiMessage::NoteOn { .. } => hex.bright_green(),
        MidiMessage::NoteOff { .. } => hex.bright_red(),
        MidiMessage::ProgramChange { .. } => hex.bright_magenta(),
        MidiMessage::PitchBend { .. } => hex.bright_cyan(),
        MidiMessage::ControlChange { .. } => hex.bright_yellow(),
        MidiMessage::Other { .. } => hex.normal(),
    };

    println!(
        "[{}] {} {:<20} | {} => {}",
        format!("{:08}", event.timestamp_ms).dimmed(),
        event.direction.display(),
        short_port(&event.port_name),
        hex_colored,
        event.message.to_string().bright_blue()
    );
}

/// Monitor a port until Ctrl+C
pub async fn run_cli_sniffer(settings: SerialSettings, opener: Arc<dyn PortOpener>) -> Result<()> {
    println!("{}", "=== Fader Bus Sniffer ===".bold().cyan());
    println!("Press Ctrl+C to exit\n");

    let port_name = settings.port.clone();
    let transport = SerialTransport::new(opener);
    let mut rx = transport
        .setup(settings)
        .await
        .with_context(|| format!("Failed to open {}", port_name))?;

    println!("{}", format!("Monitoring {}...", port_name).green());
    println!("{}", "Format: [timestamp] DIR PORT | HEX => PARSED".dimmed());
    println!("{}\n", "─".repeat(80).dimmed());

    let start_time = Instant::now();
    let mut framer = MidiFramer::new();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(LinkEvent::Data(bytes)) => {
                    for message in framer.push(&bytes) {
                        print_event(&SnifferEvent {
                            timestamp_ms: start_time.elapsed().as_millis() as u64,
                            direction: Direction::Input,
                            port_name: port_name.clone(),
                            message,
                        });
                    }
                }
                Some(LinkEvent::Closed) | None => {
                    println!("\n{}", "Port closed".yellow());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.close();
    println!(
        "\n{} ({} stray byte(s) discarded)",
        "Sniffer stopped".yellow(),
        framer.discarded()
    );
    Ok(())
}

/// List serial ports in a formatted way
pub fn list_ports_formatted() {
    println!("\n{}", "=== Available Serial Ports ===".bold().cyan());

    match transport::list_ports() {
        Ok(ports) if ports.is_empty() => println!("  {}", "No serial ports found".dimmed()),
        Ok(ports) => {
            for port in ports {
                println!("  {} {}", "[SERIAL]".green(), port);
            }
        }
        Err(e) => println!("  {} {}", "Port discovery failed:".red(), e),
    }
    println!();
}
