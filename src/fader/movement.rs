//! Fader movement requests and ramp generation
//!
//! A `FaderMove` is an immutable request; `calculate_ramp` turns one channel
//! of it into the ordered list of intermediate positions to transmit. The
//! calculator is pure and deterministic so calibration runs are repeatable.

use serde::Serialize;

use crate::error::{FaderError, Result};

/// Channels one batch can address; bounded by the protocol's channel width
pub const MAX_CHANNELS: usize = 4;

/// Highest channel the status nibble can carry
pub const MAX_CHANNEL_INDEX: u8 = 15;

/// Below this distance (raw units) the target is sent directly
pub const MIN_STEP_DISTANCE: u16 = 16;

/// Raw units covered per step for each unit of speed
pub const UNITS_PER_SPEED_STEP: f64 = 4.0;

pub const MIN_RAMP_STEPS: usize = 2;
pub const MAX_RAMP_STEPS: usize = 16383;

/// Multi-channel movement request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaderMove {
    indexes: Vec<u8>,
    targets: Vec<f64>,
    speeds: Vec<f64>,
    resolution: f64,
}

impl FaderMove {
    /// Move every index to the same target at the same speed
    pub fn new(indexes: &[u8], target: f64, speed: f64) -> Result<Self> {
        Self::with_targets(
            indexes,
            vec![target; indexes.len()],
            vec![speed; indexes.len()],
            1.0,
        )
    }

    /// Single-fader shorthand
    pub fn single(index: u8, target: f64, speed: f64) -> Result<Self> {
        Self::new(&[index], target, speed)
    }

    /// Per-index targets and speeds
    pub fn with_targets(
        indexes: &[u8],
        targets: Vec<f64>,
        speeds: Vec<f64>,
        resolution: f64,
    ) -> Result<Self> {
        if indexes.is_empty() || indexes.len() > MAX_CHANNELS {
            return Err(FaderError::movement(
                indexes,
                format!("a move addresses 1-{} faders, got {}", MAX_CHANNELS, indexes.len()),
            ));
        }
        for (i, index) in indexes.iter().enumerate() {
            if *index > MAX_CHANNEL_INDEX {
                return Err(FaderError::movement(indexes, format!("index {} out of range", index)));
            }
            if indexes[..i].contains(index) {
                return Err(FaderError::movement(indexes, format!("index {} repeated", index)));
            }
        }
        if targets.len() != indexes.len() || speeds.len() != indexes.len() {
            return Err(FaderError::movement(
                indexes,
                "targets and speeds must match the number of indexes",
            ));
        }
        if let Some(t) = targets.iter().find(|t| !(0.0..=100.0).contains(*t)) {
            return Err(FaderError::movement(indexes, format!("target {} outside 0-100", t)));
        }
        if let Some(s) = speeds.iter().find(|s| !(**s > 0.0 && **s <= 100.0)) {
            return Err(FaderError::movement(indexes, format!("speed {} outside (0, 100]", s)));
        }
        if !(resolution > 0.0 && resolution <= 1.0) {
            return Err(FaderError::movement(
                indexes,
                format!("resolution {} outside (0, 1]", resolution),
            ));
        }

        Ok(Self {
            indexes: indexes.to_vec(),
            targets,
            speeds,
            resolution,
        })
    }

    /// Same move with a different resolution
    pub fn with_resolution(self, resolution: f64) -> Result<Self> {
        Self::with_targets(&self.indexes, self.targets, self.speeds, resolution)
    }

    /// Union several moves into one batch.
    ///
    /// The first occurrence of each index wins, encounter order is kept and
    /// the result is capped at `MAX_CHANNELS`.
    pub fn combine(moves: &[FaderMove]) -> Result<Self> {
        let mut indexes = Vec::with_capacity(MAX_CHANNELS);
        let mut targets = Vec::with_capacity(MAX_CHANNELS);
        let mut speeds = Vec::with_capacity(MAX_CHANNELS);
        let mut resolution: f64 = 0.0;

        'outer: for m in moves {
            resolution = resolution.max(m.resolution);
            for (i, index) in m.indexes.iter().enumerate() {
                if indexes.len() == MAX_CHANNELS {
                    break 'outer;
                }
                if indexes.contains(index) {
                    continue;
                }
                indexes.push(*index);
                targets.push(m.targets[i]);
                speeds.push(m.speeds[i]);
            }
        }

        if indexes.is_empty() {
            return Err(FaderError::movement(&[], "nothing to combine"));
        }
        Self::with_targets(&indexes, targets, speeds, resolution)
    }

    pub fn indexes(&self) -> &[u8] {
        &self.indexes
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    pub fn speeds(&self) -> &[f64] {
        &self.speeds
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// (index, target, speed) triples in order
    pub fn channels(&self) -> impl Iterator<Item = (u8, f64, f64)> + '_ {
        self.indexes
            .iter()
            .zip(self.targets.iter().zip(self.speeds.iter()))
            .map(|(i, (t, s))| (*i, *t, *s))
    }
}

/// Compute the ramp of raw positions from `current` to `target`.
///
/// The last element is always `target`. `speed` must be positive.
pub fn calculate_ramp(current: u16, target: u16, speed: f64, resolution: f64) -> Vec<u16> {
    let distance = current.abs_diff(target);
    if distance < MIN_STEP_DISTANCE {
        return vec![target];
    }

    let per_step = speed.max(f64::MIN_POSITIVE) * UNITS_PER_SPEED_STEP;
    let steps = ((distance as f64 / per_step).ceil() as usize).clamp(MIN_RAMP_STEPS, MAX_RAMP_STEPS);

    let start = current as f64;
    let delta = target as f64 - start;
    let mut ramp: Vec<u16> = (1..=steps)
        .map(|i| (start + delta * i as f64 / steps as f64).round() as u16)
        .collect();
    if let Some(last) = ramp.last_mut() {
        *last = target;
    }

    if resolution < 1.0 {
        ramp = thin(&ramp, resolution);
    }
    ramp
}

/// Keep an evenly spaced subset, always including the first and last point
fn thin(ramp: &[u16], resolution: f64) -> Vec<u16> {
    let n = ramp.len();
    let keep = ((n as f64 * resolution).round() as usize).clamp(MIN_RAMP_STEPS.min(n), n);
    if keep >= n {
        return ramp.to_vec();
    }

    let mut out = Vec::with_capacity(keep);
    let mut last_idx = None;
    for j in 0..keep {
        let idx = if keep == 1 {
            n - 1
        } else {
            ((j * (n - 1)) as f64 / (keep - 1) as f64).round() as usize
        };
        if last_idx != Some(idx) {
            out.push(ramp[idx]);
            last_idx = Some(idx);
        }
    }
    out
}
