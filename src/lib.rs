//! faderlink - control layer for motorized touch faders over MIDI-over-serial
//!
//! Drives up to four 14-bit motorized faders, keeps their physical position
//! in step with software values, and yields to the user's hand whenever a
//! fader is touched.

pub mod calibration;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod fader;
pub mod midi;
pub mod queue;
pub mod sniffer;
pub mod transport;

pub use calibration::{CalibrationSettings, CalibrationTarget, FaderCalibration, RateReference};
pub use config::ControllerConfig;
pub use controller::{ControllerState, FaderController};
pub use error::{FaderError, Result};
pub use events::{EventBus, EventFilter, FaderEvent, MoveReport};
pub use fader::{FaderInfo, FaderMove};
pub use queue::FeedbackStrategy;
pub use transport::{PortOpener, SerialSettings, SystemPortOpener};
