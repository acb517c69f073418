//! Calibration engine
//!
//! Nominally identical faders differ in friction and motor strength. The
//! advanced routine times repeated moves over a sweep of speeds for each
//! candidate resolution, keeps the most consistent resolution per fader and
//! derives a speed factor so a given software speed yields the same real
//! travel rate on every unit.
//!
//! The statistics are pure functions so they can be checked against
//! synthetic timings; the hardware side sits behind `CalibrationTarget`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FaderError, Result};

/// What the engine drives
#[async_trait]
pub trait CalibrationTarget: Send + Sync {
    /// Move one fader to `target` at the raw `speed` (no speed factor)
    /// and return how long the move took to be confirmed
    async fn timed_move(&self, index: u8, target: f64, speed: f64, resolution: f64) -> Result<Duration>;

    /// Whether completion is observed on the wire rather than assumed
    fn hardware_feedback(&self) -> bool;
}

/// Where the reference rate comes from when no `target_rate` is set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateReference {
    /// `reference_speed` read as progression units per second
    #[default]
    ReferenceSpeed,
    /// Mean measured rate of the faders calibrated together
    FleetMean,
}

/// Sweep parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Candidate resolutions, in preference order for ties
    pub resolutions: Vec<f64>,
    pub min_speed: f64,
    pub max_speed: f64,
    pub speed_steps: usize,
    pub warmup_runs: usize,
    pub measured_runs: usize,
    /// Progression span of each timed move, centred on the travel
    pub span: f64,
    pub reference_speed: f64,
    /// Absolute target rate (progression units per second), overrides `rate_reference`
    pub target_rate: Option<f64>,
    pub rate_reference: RateReference,
    pub run_delay_ms: u64,
    pub min_speed_factor: f64,
    pub max_speed_factor: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            resolutions: vec![1.0, 0.5, 0.25],
            min_speed: 10.0,
            max_speed: 100.0,
            speed_steps: 4,
            warmup_runs: 1,
            measured_runs: 3,
            span: 80.0,
            reference_speed: 50.0,
            target_rate: None,
            rate_reference: RateReference::ReferenceSpeed,
            run_delay_ms: 100,
            min_speed_factor: 0.25,
            max_speed_factor: 4.0,
        }
    }
}

impl CalibrationSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FaderError::InvalidConfig(format!("calibration: {}", msg)));

        if self.resolutions.is_empty() {
            return invalid("at least one resolution is required".to_string());
        }
        if let Some(r) = self.resolutions.iter().find(|r| !(**r > 0.0 && **r <= 1.0)) {
            return invalid(format!("resolution {} outside (0, 1]", r));
        }
        if !(self.min_speed > 0.0 && self.min_speed <= self.max_speed && self.max_speed <= 100.0) {
            return invalid(format!(
                "speed bounds must satisfy 0 < min <= max <= 100, got [{}, {}]",
                self.min_speed, self.max_speed
            ));
        }
        if self.speed_steps == 0 || self.measured_runs == 0 {
            return invalid("speed_steps and measured_runs must be at least 1".to_string());
        }
        if !(self.span > 0.0 && self.span <= 100.0) {
            return invalid(format!("span {} outside (0, 100]", self.span));
        }
        if !(self.reference_speed > 0.0 && self.reference_speed <= 100.0) {
            return invalid(format!("reference speed {} outside (0, 100]", self.reference_speed));
        }
        if matches!(self.target_rate, Some(rate) if rate <= 0.0 || !rate.is_finite()) {
            return invalid("target rate must be positive".to_string());
        }
        if !(self.min_speed_factor > 0.0 && self.min_speed_factor <= self.max_speed_factor) {
            return invalid(format!(
                "speed factor bounds must satisfy 0 < min <= max, got [{}, {}]",
                self.min_speed_factor, self.max_speed_factor
            ));
        }
        Ok(())
    }

    /// Start and end progression of a timed move
    pub fn span_bounds(&self) -> (f64, f64) {
        let start = (100.0 - self.span) / 2.0;
        (start, start + self.span)
    }

    pub fn run_delay(&self) -> Duration {
        Duration::from_millis(self.run_delay_ms)
    }
}

/// Measurements for one (resolution, speed) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationCell {
    pub resolution: f64,
    pub speed: f64,
    pub run_times_ms: Vec<f64>,
    pub avg_time_ms: f64,
    pub std_dev_ms: f64,
    /// Progression units per second
    pub effective_speed: f64,
}

impl CalibrationCell {
    pub fn from_runs(resolution: f64, speed: f64, run_times_ms: Vec<f64>, span: f64) -> Self {
        let avg_time_ms = mean(&run_times_ms);
        let std_dev_ms = sample_std_dev(&run_times_ms);
        let effective_speed = if avg_time_ms > 0.0 {
            span / (avg_time_ms / 1000.0)
        } else {
            0.0
        };
        Self {
            resolution,
            speed,
            run_times_ms,
            avg_time_ms,
            std_dev_ms,
            effective_speed,
        }
    }
}

/// Result for one fader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaderCalibration {
    pub index: u8,
    pub optimal_resolution: f64,
    /// Measured rate at the reference speed and optimal resolution
    pub effective_speed: f64,
    pub speed_factor: f64,
    pub cells: Vec<CalibrationCell>,
}

/// `steps` evenly spaced speeds from `min` to `max` inclusive
pub fn speed_sweep(min: f64, max: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![min],
        n => (0..n)
            .map(|i| min + (max - min) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1); zero below two samples
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Resolution whose cells have the lowest mean std-dev; ties keep the earlier candidate
pub fn select_resolution(cells: &[CalibrationCell], resolutions: &[f64]) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    for resolution in resolutions {
        let deviations: Vec<f64> = cells
            .iter()
            .filter(|c| c.resolution == *resolution)
            .map(|c| c.std_dev_ms)
            .collect();
        if deviations.is_empty() {
            continue;
        }
        let score = mean(&deviations);
        if best.map_or(true, |(_, s)| score < s) {
            best = Some((*resolution, score));
        }
    }
    best.map(|(resolution, _)| resolution)
}

/// Effective speed of the cell closest to `reference_speed` at `resolution`
pub fn rate_at(cells: &[CalibrationCell], resolution: f64, reference_speed: f64) -> Option<f64> {
    cells
        .iter()
        .filter(|c| c.resolution == resolution)
        .fold(None::<&CalibrationCell>, |best, c| match best {
            Some(b) if (b.speed - reference_speed).abs() <= (c.speed - reference_speed).abs() => Some(b),
            _ => Some(c),
        })
        .map(|c| c.effective_speed)
}

/// Rate every fader is corrected towards
pub fn reference_rate(results: &[FaderCalibration], settings: &CalibrationSettings) -> f64 {
    if let Some(rate) = settings.target_rate {
        return rate;
    }
    match settings.rate_reference {
        RateReference::ReferenceSpeed => settings.reference_speed,
        RateReference::FleetMean => {
            let measured: Vec<f64> = results
                .iter()
                .map(|r| r.effective_speed)
                .filter(|r| *r > 0.0)
                .collect();
            mean(&measured)
        }
    }
}

/// Fill in `speed_factor = reference rate / effective speed`, clamped
pub fn apply_speed_factors(results: &mut [FaderCalibration], settings: &CalibrationSettings) {
    let reference = reference_rate(results, settings);

    for result in results.iter_mut() {
        result.speed_factor = if result.effective_speed > 0.0 && reference > 0.0 {
            (reference / result.effective_speed).clamp(settings.min_speed_factor, settings.max_speed_factor)
        } else {
            1.0
        };
    }
}

/// Sweep every fader and derive its optimal resolution and speed factor
pub async fn run_advanced(
    target: &dyn CalibrationTarget,
    indexes: &[u8],
    settings: &CalibrationSettings,
) -> Result<Vec<FaderCalibration>> {
    if indexes.is_empty() {
        return Err(FaderError::calibration(indexes, "no faders to calibrate"));
    }
    settings.validate()?;
    if !target.hardware_feedback() {
        return Err(FaderError::calibration(
            indexes,
            "hardware position feedback is unavailable, run times would not reflect motion",
        ));
    }

    let speeds = speed_sweep(settings.min_speed, settings.max_speed, settings.speed_steps);
    let (low, high) = settings.span_bounds();
    let mut results = Vec::with_capacity(indexes.len());

    for &index in indexes {
        info!("Calibrating fader {}", index);
        let fail = |e: FaderError| FaderError::calibration(&[index], e.to_string());

        target.timed_move(index, low, settings.max_speed, 1.0).await.map_err(fail)?;

        let mut cells = Vec::with_capacity(settings.resolutions.len() * speeds.len());
        for &resolution in &settings.resolutions {
            for &speed in &speeds {
                let mut runs = Vec::with_capacity(settings.measured_runs);
                // Each run travels the span; alternating keeps the start point fixed
                let mut at_low = true;
                for run in 0..settings.warmup_runs + settings.measured_runs {
                    let to = if at_low { high } else { low };
                    let elapsed = target
                        .timed_move(index, to, speed, resolution)
                        .await
                        .map_err(fail)?;
                    at_low = !at_low;
                    if run >= settings.warmup_runs {
                        runs.push(elapsed.as_secs_f64() * 1000.0);
                    }
                    if !settings.run_delay().is_zero() {
                        tokio::time::sleep(settings.run_delay()).await;
                    }
                }
                // Leave the fader at the low end for the next cell
                if !at_low {
                    target.timed_move(index, low, settings.max_speed, 1.0).await.map_err(fail)?;
                }

                let cell = CalibrationCell::from_runs(resolution, speed, runs, settings.span);
                debug!(
                    "fader {} res {} speed {:.1}: avg {:.1}ms sd {:.2}ms -> {:.1}/s",
                    index, resolution, speed, cell.avg_time_ms, cell.std_dev_ms, cell.effective_speed
                );
                cells.push(cell);
            }
        }

        let optimal_resolution = select_resolution(&cells, &settings.resolutions)
            .ok_or_else(|| FaderError::calibration(&[index], "no measurements recorded"))?;
        let effective_speed = rate_at(&cells, optimal_resolution, settings.reference_speed)
            .filter(|r| *r > 0.0)
            .ok_or_else(|| FaderError::calibration(&[index], "no usable rate at the reference speed"))?;

        results.push(FaderCalibration {
            index,
            optimal_resolution,
            effective_speed,
            speed_factor: 1.0,
            cells,
        });
    }

    apply_speed_factors(&mut results, settings);
    for result in &results {
        info!(
            "Fader {} calibrated: resolution {}, speed factor {:.3}",
            result.index, result.optimal_resolution, result.speed_factor
        );
    }
    Ok(results)
}
