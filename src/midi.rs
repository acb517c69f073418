//! MIDI codec for the fader link
//!
//! Every frame on the wire is exactly three bytes `[status, data1, data2]`.
//! There is no running status: each frame carries its own status byte, so
//! the framer resynchronizes on any byte with the high bit set.

use std::fmt;

/// Fixed frame width on the wire
pub const FRAME_LEN: usize = 3;

/// Largest 14-bit position value
pub const MAX_POSITION: u16 = 16383;

/// Note-class messages encode the fader channel as `data2 - NOTE_CHANNEL_BASE`
pub const NOTE_CHANNEL_BASE: u8 = 104;

/// PROGRAM_CHANGE payloads the device sends once it is ready
pub const READY_PAYLOADS: [u8; 2] = [102, 116];

pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;
pub const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const STATUS_PITCH_BEND: u8 = 0xE0;

/// Decoded 3-byte MIDI frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    /// Untouch report: fader channel is `data2 - 104`
    NoteOff { status_channel: u8, data1: u8, data2: u8 },

    /// Touch report: fader channel is `data2 - 104`
    NoteOn { status_channel: u8, data1: u8, data2: u8 },

    /// Set or report a 14-bit fader position (little-endian 7-bit halves)
    PitchBend { channel: u8, value: u16 },

    /// Device readiness beacon
    ProgramChange { channel: u8, program: u8, payload: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// Anything else; kept so it can be logged
    Other { status: u8, data1: u8, data2: u8 },
}

/// Coarse message type, derived from the status upper nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NoteOff,
    NoteOn,
    PitchBend,
    ProgramChange,
    ControlChange,
    Other,
}

impl MessageKind {
    /// Translate a status byte to a message type
    pub fn from_status(status: u8) -> Self {
        match status & 0xF0 {
            STATUS_NOTE_OFF => MessageKind::NoteOff,
            STATUS_NOTE_ON => MessageKind::NoteOn,
            STATUS_PITCH_BEND => MessageKind::PitchBend,
            STATUS_PROGRAM_CHANGE => MessageKind::ProgramChange,
            STATUS_CONTROL_CHANGE => MessageKind::ControlChange,
            _ => MessageKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::NoteOff => "NOTE_OFF",
            MessageKind::NoteOn => "NOTE_ON",
            MessageKind::PitchBend => "PITCH_BEND",
            MessageKind::ProgramChange => "PROGRAM_CHANGE",
            MessageKind::ControlChange => "CONTROL_CHANGE",
            MessageKind::Other => "OTHER",
        }
    }
}

impl MidiMessage {
    /// Parse one complete frame. Returns None if the first byte is not a status byte.
    pub fn parse(frame: [u8; FRAME_LEN]) -> Option<Self> {
        let [status, d1, d2] = frame;
        if status & 0x80 == 0 {
            return None;
        }

        let d1 = d1 & 0x7F;
        let d2 = d2 & 0x7F;
        let channel = status & 0x0F;

        let message = match MessageKind::from_status(status) {
            MessageKind::NoteOff => MidiMessage::NoteOff {
                status_channel: channel,
                data1: d1,
                data2: d2,
            },
            MessageKind::NoteOn => MidiMessage::NoteOn {
                status_channel: channel,
                data1: d1,
                data2: d2,
            },
            MessageKind::PitchBend => MidiMessage::PitchBend {
                channel,
                value: ((d2 as u16) << 7) | d1 as u16,
            },
            MessageKind::ProgramChange => MidiMessage::ProgramChange {
                channel,
                program: d1,
                payload: d2,
            },
            MessageKind::ControlChange => MidiMessage::ControlChange {
                channel,
                cc: d1,
                value: d2,
            },
            MessageKind::Other => MidiMessage::Other {
                status,
                data1: d1,
                data2: d2,
            },
        };
        Some(message)
    }

    /// Position command for one fader
    pub fn position(channel: u8, value: u16) -> Self {
        MidiMessage::PitchBend {
            channel: channel & 0x0F,
            value: value.min(MAX_POSITION),
        }
    }

    /// Encode the message to its 3-byte frame
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        match *self {
            MidiMessage::NoteOff { status_channel, data1, data2 } => {
                [STATUS_NOTE_OFF | (status_channel & 0x0F), data1 & 0x7F, data2 & 0x7F]
            }
            MidiMessage::NoteOn { status_channel, data1, data2 } => {
                [STATUS_NOTE_ON | (status_channel & 0x0F), data1 & 0x7F, data2 & 0x7F]
            }
            MidiMessage::PitchBend { channel, value } => {
                let lsb = (value & 0x7F) as u8;
                let msb = ((value >> 7) & 0x7F) as u8;
                [STATUS_PITCH_BEND | (channel & 0x0F), lsb, msb]
            }
            MidiMessage::ProgramChange { channel, program, payload } => {
                [STATUS_PROGRAM_CHANGE | (channel & 0x0F), program & 0x7F, payload & 0x7F]
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                [STATUS_CONTROL_CHANGE | (channel & 0x0F), cc & 0x7F, value & 0x7F]
            }
            MidiMessage::Other { status, data1, data2 } => [status, data1 & 0x7F, data2 & 0x7F],
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_status(self.encode()[0])
    }

    /// Fader channel addressed by this message.
    ///
    /// Position-class messages use the status nibble; note-class messages
    /// carry the channel as `data2 - 104`.
    pub fn fader_channel(&self) -> Option<u8> {
        match *self {
            MidiMessage::PitchBend { channel, .. } => Some(channel),
            MidiMessage::NoteOn { data2, .. } | MidiMessage::NoteOff { data2, .. } => {
                data2.checked_sub(NOTE_CHANNEL_BASE)
            }
            _ => None,
        }
    }

    /// True for PROGRAM_CHANGE frames carrying a readiness payload in either data byte
    pub fn is_ready_beacon(&self) -> bool {
        match *self {
            MidiMessage::ProgramChange { program, payload, .. } => {
                READY_PAYLOADS.contains(&program) || READY_PAYLOADS.contains(&payload)
            }
            _ => false,
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { data1, data2, .. } => match self.fader_channel() {
                Some(ch) => write!(f, "NoteOff fader:{} n:{}", ch, data1),
                None => write!(f, "NoteOff n:{} d2:{}", data1, data2),
            },
            MidiMessage::NoteOn { data1, data2, .. } => match self.fader_channel() {
                Some(ch) => write!(f, "NoteOn fader:{} n:{}", ch, data1),
                None => write!(f, "NoteOn n:{} d2:{}", data1, data2),
            },
            MidiMessage::PitchBend { channel, value } => {
                write!(f, "PitchBend fader:{} v:{}", channel, value)
            }
            MidiMessage::ProgramChange { channel, program, payload } => {
                write!(f, "ProgramChange ch:{} p:{} payload:{}", channel, program, payload)
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel, cc, value)
            }
            MidiMessage::Other { status, data1, data2 } => {
                write!(f, "Other {:02X} {:02X} {:02X}", status, data1, data2)
            }
        }
    }
}

/// Accumulates an unbounded byte stream into complete frames.
///
/// Serial noise is expected: stray data bytes and incomplete frames are
/// discarded silently and only counted.
#[derive(Debug, Default)]
pub struct MidiFramer {
    partial: Vec<u8>,
    discarded: u64,
}

impl MidiFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<MidiMessage> {
        let mut messages = Vec::new();

        for &byte in bytes {
            if byte & 0x80 != 0 {
                // A status byte always opens a new frame
                self.discarded += self.partial.len() as u64;
                self.partial.clear();
                self.partial.push(byte);
                continue;
            }

            if self.partial.is_empty() {
                self.discarded += 1;
                continue;
            }

            self.partial.push(byte);
            if self.partial.len() == FRAME_LEN {
                let frame = [self.partial[0], self.partial[1], self.partial[2]];
                self.partial.clear();
                if let Some(message) = MidiMessage::parse(frame) {
                    messages.push(message);
                }
            }
        }

        messages
    }

    /// Number of bytes dropped so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn reset(&mut self) {
        self.partial.clear();
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format a frame for sniffer output
pub fn format_sniffer(timestamp_ms: u64, direction: &str, port: &str, message: &MidiMessage) -> String {
    format!(
        "[{:08}ms] {} {} | {} => {}",
        timestamp_ms,
        direction,
        port,
        format_hex(&message.encode()),
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitch_bend_parsing() {
        let msg = MidiMessage::parse([0xE2, 0x00, 0x40]).unwrap();
        assert_eq!(msg, MidiMessage::PitchBend { channel: 2, value: 8192 });
        assert_eq!(msg.fader_channel(), Some(2));
        assert_eq!(msg.kind(), MessageKind::PitchBend);
    }

    #[test]
    fn test_pitch_bend_encoding_is_little_endian() {
        let msg = MidiMessage::position(1, 16383);
        assert_eq!(msg.encode(), [0xE1, 0x7F, 0x7F]);

        let msg = MidiMessage::position(0, 130);
        assert_eq!(msg.encode(), [0xE0, 2, 1]);
    }

    #[test]
    fn test_note_channel_from_data2() {
        let on = MidiMessage::parse([0x90, 0x68, 104]).unwrap();
        assert_eq!(on.fader_channel(), Some(0));
        assert_eq!(on.kind(), MessageKind::NoteOn);

        let off = MidiMessage::parse([0x80, 0x00, 107]).unwrap();
        assert_eq!(off.fader_channel(), Some(3));

        let low = MidiMessage::parse([0x90, 0x00, 20]).unwrap();
        assert_eq!(low.fader_channel(), None);
    }

    #[test]
    fn test_ready_beacon() {
        assert!(MidiMessage::parse([0xC0, 0x00, 102]).unwrap().is_ready_beacon());
        assert!(MidiMessage::parse([0xC0, 116, 0x00]).unwrap().is_ready_beacon());
        assert!(!MidiMessage::parse([0xC0, 0x01, 0x02]).unwrap().is_ready_beacon());
        assert!(!MidiMessage::position(0, 102).is_ready_beacon());
    }

    #[test]
    fn test_framer_splits_chunks() {
        let mut framer = MidiFramer::new();
        assert!(framer.push(&[0xE0, 0x10]).is_empty());
        let messages = framer.push(&[0x20, 0x90, 0x00, 105]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], MidiMessage::PitchBend { channel: 0, value: (0x20 << 7) | 0x10 });
        assert_eq!(messages[1].fader_channel(), Some(1));
        assert_eq!(framer.discarded(), 0);
    }

    #[test]
    fn test_framer_drops_noise() {
        let mut framer = MidiFramer::new();
        // stray data bytes, then an incomplete frame cut off by a new status byte
        let messages = framer.push(&[0x01, 0x02, 0xE0, 0x05, 0xE1, 0x00, 0x00]);
        assert_eq!(messages, vec![MidiMessage::PitchBend { channel: 1, value: 0 }]);
        assert_eq!(framer.discarded(), 4);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xE0, 0x7F, 0x01]), "E0 7F 01");
        let line = format_sniffer(12, "IN ", "mock", &MidiMessage::position(0, 0));
        assert!(line.contains("E0 00 00"));
        assert!(line.contains("PitchBend fader:0"));
    }
}
