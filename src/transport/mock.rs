//! In-memory serial port
//!
//! Stands in for the hardware in tests and `--mock` runs. It can echo
//! position frames back like units with bus feedback, stay silent like
//! units without it, refuse opens, fail writes and drop the link.

use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use super::{PortHandles, PortOpener};
use crate::midi::{MidiFramer, MidiMessage};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    echo_positions: bool,
    failing_opens: u32,
    fail_writes: bool,
    opens: u32,
}

/// Shared handle to a fake device; clones see the same device
#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    /// A silent device (no position echo)
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that echoes every position command it receives
    pub fn echoing() -> Self {
        let port = Self::new();
        port.set_echo(true);
        port
    }

    pub fn set_echo(&self, enabled: bool) {
        self.state.lock().echo_positions = enabled;
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().failing_opens = count;
    }

    pub fn fail_writes(&self, enabled: bool) {
        self.state.lock().fail_writes = enabled;
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    /// Every byte written so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Written bytes decoded into messages
    pub fn written_messages(&self) -> Vec<MidiMessage> {
        MidiFramer::new().push(&self.written())
    }

    /// Position values written to one channel, in order
    pub fn written_positions(&self, channel: u8) -> Vec<u16> {
        self.written_messages()
            .into_iter()
            .filter_map(|m| match m {
                MidiMessage::PitchBend { channel: ch, value } if ch == channel => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Deliver bytes as if the device sent them. False when no connection is open.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        match self.state.lock().inbound.as_ref() {
            Some(tx) => tx.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    pub fn inject_message(&self, message: MidiMessage) -> bool {
        self.inject(&message.encode())
    }

    /// Touch (NOTE_ON) or release (NOTE_OFF) a fader
    pub fn touch(&self, channel: u8, touched: bool) -> bool {
        let data2 = crate::midi::NOTE_CHANNEL_BASE + channel;
        let message = if touched {
            MidiMessage::NoteOn {
                status_channel: 0,
                data1: 0x7F,
                data2,
            }
        } else {
            MidiMessage::NoteOff {
                status_channel: 0,
                data1: 0x00,
                data2,
            }
        };
        self.inject_message(message)
    }

    /// Send the readiness beacon
    pub fn signal_ready(&self) -> bool {
        self.inject_message(MidiMessage::ProgramChange {
            channel: 0,
            program: 0,
            payload: crate::midi::READY_PAYLOADS[0],
        })
    }

    /// Drop the link; the reader sees EOF
    pub fn disconnect(&self) {
        self.state.lock().inbound.take();
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().inbound.is_some()
    }
}

impl PortOpener for MockPort {
    fn open(&self, path: &str, _baud_rate: u32) -> io::Result<PortHandles> {
        let mut state = self.state.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock port '{}' unavailable", path),
            ));
        }

        let (tx, rx) = mpsc::channel();
        state.inbound = Some(tx);
        state.opens += 1;

        Ok(PortHandles {
            reader: Box::new(MockReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(MockWriter {
                state: self.state.clone(),
                framer: MidiFramer::new(),
            }),
        })
    }
}

struct MockReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(bytes) => self.pending = bytes,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct MockWriter {
    state: Arc<Mutex<MockState>>,
    framer: MidiFramer,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        if state.inbound.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock port disconnected"));
        }
        state.written.extend_from_slice(buf);

        if state.echo_positions {
            for message in self.framer.push(buf) {
                if matches!(message, MidiMessage::PitchBend { .. }) {
                    if let Some(tx) = state.inbound.as_ref() {
                        let _ = tx.send(message.encode().to_vec());
                    }
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
