//! Per-channel fader state
//!
//! A `Fader` tracks two orthogonal axes: whether the user's hand is on it
//! (touch) and whether hardware position reports are written back to the
//! device (echo). Positions are stored raw (0-16383 / 0-100) and the trim
//! map is only applied at the presentation and command boundaries.

pub mod movement;

use serde::Serialize;

use crate::error::{FaderError, Result};
use crate::events::FaderEvent;
use crate::midi::MAX_POSITION;

pub use movement::{calculate_ramp, FaderMove, MAX_CHANNELS};

/// Convert a 0-100 progression to a 14-bit position
pub fn progression_to_position(progression: f64) -> u16 {
    ((progression.clamp(0.0, 100.0) / 100.0) * MAX_POSITION as f64).round() as u16
}

/// Convert a 14-bit position to a 0-100 progression
pub fn position_to_progression(position: u16) -> f64 {
    position.min(MAX_POSITION) as f64 / MAX_POSITION as f64 * 100.0
}

/// Per-fader [min, max] sub-range of 0-100
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressionMap {
    pub min: f64,
    pub max: f64,
}

impl ProgressionMap {
    pub const FULL: ProgressionMap = ProgressionMap { min: 0.0, max: 100.0 };

    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite()) || min < 0.0 || max > 100.0 || min >= max {
            return Err(FaderError::InvalidConfig(format!(
                "progression map [{}, {}] must satisfy 0 <= min < max <= 100",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Map a full-scale progression onto the trimmed sub-range
    pub fn apply(&self, progression: f64) -> f64 {
        self.min + progression.clamp(0.0, 100.0) / 100.0 * (self.max - self.min)
    }
}

impl Default for ProgressionMap {
    fn default() -> Self {
        Self::FULL
    }
}

/// Read-only snapshot of one fader.
///
/// Taken at an instant; it may already be stale while a move is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaderInfo {
    pub index: u8,
    pub raw_position: u16,
    pub raw_progression: f64,
    /// Raw progression remapped through the trim map
    pub progression: f64,
    pub touch: bool,
    pub echo_mode: bool,
    pub progression_map: ProgressionMap,
    pub speed_factor: f64,
}

/// State of a single motorized fader
#[derive(Debug, Clone)]
pub struct Fader {
    index: u8,
    raw_position: u16,
    raw_progression: f64,
    touch: bool,
    echo_mode: bool,
    progression_map: ProgressionMap,
    speed_factor: f64,
}

impl Fader {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            raw_position: 0,
            raw_progression: 0.0,
            touch: false,
            echo_mode: false,
            progression_map: ProgressionMap::FULL,
            speed_factor: 1.0,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn raw_position(&self) -> u16 {
        self.raw_position
    }

    pub fn is_touched(&self) -> bool {
        self.touch
    }

    pub fn echo_mode(&self) -> bool {
        self.echo_mode
    }

    pub fn speed_factor(&self) -> f64 {
        self.speed_factor
    }

    pub fn progression_map(&self) -> ProgressionMap {
        self.progression_map
    }

    pub fn info(&self) -> FaderInfo {
        FaderInfo {
            index: self.index,
            raw_position: self.raw_position,
            raw_progression: self.raw_progression,
            progression: self.progression_map.apply(self.raw_progression),
            touch: self.touch,
            echo_mode: self.echo_mode,
            progression_map: self.progression_map,
            speed_factor: self.speed_factor,
        }
    }

    /// Raw 14-bit target for an external (untrimmed) progression value
    pub fn target_position(&self, progression: f64) -> u16 {
        progression_to_position(self.progression_map.apply(progression))
    }

    pub fn set_progression_map(&mut self, min: f64, max: f64) -> Result<FaderEvent> {
        self.progression_map = ProgressionMap::new(min, max)?;
        Ok(FaderEvent::ConfigChange(self.info()))
    }

    pub fn set_speed_factor(&mut self, factor: f64) -> Result<FaderEvent> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(FaderError::InvalidConfig(format!(
                "speed factor for fader {} must be > 0, got {}",
                self.index, factor
            )));
        }
        self.speed_factor = factor;
        Ok(FaderEvent::ConfigChange(self.info()))
    }

    pub fn set_echo_mode(&mut self, enabled: bool) -> FaderEvent {
        self.echo_mode = enabled;
        FaderEvent::ConfigChange(self.info())
    }

    /// Apply a touch report. Repeating the current state raises nothing.
    pub fn update_touch_state(&mut self, touch: bool) -> Option<FaderEvent> {
        if self.touch == touch {
            return None;
        }
        self.touch = touch;
        let info = self.info();
        Some(if touch {
            FaderEvent::Touch(info)
        } else {
            FaderEvent::Untouch(info)
        })
    }

    /// Apply a hardware-originated position that no software move is tracking.
    ///
    /// Raises `move` only while the user is holding the fader.
    pub fn update_position_user(&mut self, position: u16) -> Option<FaderEvent> {
        self.set_raw_position(position);
        self.touch.then(|| FaderEvent::Move(self.info()))
    }

    /// Apply a position correlated with a software-issued move. Never raises `move`.
    pub fn update_position_feedback(&mut self, position: u16) {
        self.set_raw_position(position);
    }

    fn set_raw_position(&mut self, position: u16) {
        self.raw_position = position.min(MAX_POSITION);
        self.raw_progression = position_to_progression(self.raw_position);
    }
}
