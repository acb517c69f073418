//! Controller configuration
//!
//! Loaded from YAML (every field has a default) or built in code. Trim maps
//! and speed factors are runtime state owned by the caller, not config.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::calibration::CalibrationSettings;
use crate::error::{FaderError, Result};
use crate::fader::movement::{MAX_CHANNELS, MAX_CHANNEL_INDEX};
use crate::midi::MAX_POSITION;
use crate::queue::QueueConfig;
use crate::transport::SerialSettings;

/// Root configuration of a `FaderController`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Channels owned by this controller, fixed for its lifetime
    pub fader_indexes: Vec<u8>,
    /// Speed presets: slow, medium, fast
    pub speeds: [f64; 3],
    /// Pause between queue batches
    pub message_delay_ms: u64,
    pub calibrate_on_start: bool,
    /// Wait for position echoes to declare steps complete
    pub feedback_midi: bool,
    /// Raw units an echo may differ from the target
    pub feedback_tolerance: u16,
    pub feedback_timeout_ms: u64,
    /// Base ceiling of every queued step
    pub command_timeout_ms: u64,
    /// Backlog ceiling per channel
    pub max_queue_len: usize,
    pub max_in_flight: usize,
    pub lock_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    pub ready_max_attempts: u32,
    pub stop_timeout_ms: u64,
    pub serial: SerialConfig,
    pub calibration: CalibrationSettings,
}

/// Serial port section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_retries")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            retries: default_retries(),
            retry_interval_ms: default_retry_interval(),
            reconnect_attempts: default_retries(),
            reconnect_interval_ms: default_reconnect_interval(),
        }
    }
}

impl SerialConfig {
    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            retries: self.retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fader_indexes: vec![0, 1, 2, 3],
            speeds: [10.0, 50.0, 100.0],
            message_delay_ms: 2,
            calibrate_on_start: false,
            feedback_midi: true,
            feedback_tolerance: 64,
            feedback_timeout_ms: 300,
            command_timeout_ms: 1000,
            max_queue_len: 2048,
            max_in_flight: MAX_CHANNELS,
            lock_timeout_ms: 1000,
            ready_poll_interval_ms: 100,
            ready_max_attempts: 50,
            stop_timeout_ms: 3000,
            serial: SerialConfig::default(),
            calibration: CalibrationSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a YAML file and validate it
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: ControllerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path))?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FaderError::InvalidConfig(msg));

        if self.fader_indexes.is_empty() {
            return invalid("at least one fader index is required".to_string());
        }
        if self.fader_indexes.len() > MAX_CHANNELS {
            return invalid(format!(
                "at most {} faders are supported, got {}",
                MAX_CHANNELS,
                self.fader_indexes.len()
            ));
        }
        for (i, index) in self.fader_indexes.iter().enumerate() {
            if *index > MAX_CHANNEL_INDEX {
                return invalid(format!("fader index {} out of range 0-{}", index, MAX_CHANNEL_INDEX));
            }
            if self.fader_indexes[..i].contains(index) {
                return invalid(format!("fader index {} listed twice", index));
            }
        }

        if let Some(speed) = self.speeds.iter().find(|s| !(**s > 0.0 && **s <= 100.0)) {
            return invalid(format!("speed preset {} outside (0, 100]", speed));
        }
        if self.feedback_tolerance > MAX_POSITION {
            return invalid(format!(
                "feedback_tolerance {} exceeds the 14-bit range",
                self.feedback_tolerance
            ));
        }
        if self.max_in_flight == 0 {
            return invalid("max_in_flight must be at least 1".to_string());
        }
        if self.max_queue_len == 0 {
            return invalid("max_queue_len must be at least 1".to_string());
        }
        if self.serial.port.is_empty() {
            return invalid("serial port cannot be empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            return invalid("serial baud_rate must be positive".to_string());
        }

        self.calibration.validate()
    }

    pub fn slow_speed(&self) -> f64 {
        self.speeds[0]
    }

    pub fn medium_speed(&self) -> f64 {
        self.speeds[1]
    }

    pub fn fast_speed(&self) -> f64 {
        self.speeds[2]
    }

    pub fn message_delay(&self) -> Duration {
        Duration::from_millis(self.message_delay_ms)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_millis(self.feedback_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Ceiling for the `step_number`-th step (1-based) of a move
    pub fn step_ceiling(&self, step_number: usize) -> Duration {
        let per_step = self.message_delay() + self.feedback_timeout();
        self.command_timeout() + per_step.saturating_mul(step_number.min(u32::MAX as usize) as u32)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_len: self.max_queue_len,
            max_in_flight: self.max_in_flight,
            message_delay: self.message_delay(),
        }
    }
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyACM0".to_string()
    }
}
fn default_baud_rate() -> u32 { 115_200 }
fn default_retries() -> u32 { 5 }
fn default_retry_interval() -> u64 { 1000 }
fn default_reconnect_interval() -> u64 { 250 }
