//! Software-issued moves and calibration

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::FaderController;
use crate::calibration::{self, CalibrationTarget, FaderCalibration};
use crate::error::{FaderError, Result};
use crate::events::{ChannelMoveReport, FaderEvent, MoveReport};
use crate::fader::{calculate_ramp, FaderMove};
use crate::midi::MidiMessage;
use crate::queue::{CommandHandle, FeedbackStrategy, QueueOptions, StepOutcome};

/// One channel's share of a move
struct ChannelPlan {
    index: u8,
    start_position: u16,
    target_position: u16,
    handles: Vec<CommandHandle>,
}

impl FaderController {
    /// Move faders along computed ramps and wait for every step.
    ///
    /// `interrupt` drops steps still queued for the move's channels first.
    /// `disable_feedback` completes steps on write instead of on echo.
    pub async fn move_faders(
        &self,
        fader_move: &FaderMove,
        interrupt: bool,
        disable_feedback: bool,
    ) -> Result<MoveReport> {
        self.execute_move(fader_move, interrupt, disable_feedback, true).await
    }

    /// Coalesce independent moves landing in the same tick into one batch
    pub fn combine_moves(&self, moves: &[FaderMove]) -> Result<FaderMove> {
        FaderMove::combine(moves)
    }

    /// Settle routine: full travel up at the fast preset, back down at the slow one
    pub async fn calibrate_basic(&self) -> Result<()> {
        let indexes = self.fader_indexes();
        let config = self.config();
        info!("Basic calibration on faders {:?}", indexes);

        let up = FaderMove::new(&indexes, 100.0, config.fast_speed())?;
        let down = FaderMove::new(&indexes, 0.0, config.slow_speed())?;
        for step in [up, down] {
            let report = self.move_faders(&step, true, false).await?;
            if !report.is_complete() {
                return Err(FaderError::calibration(&indexes, "settle move did not complete"));
            }
        }
        Ok(())
    }

    /// Measure faders without applying anything
    pub async fn run_calibration(&self, indexes: &[u8]) -> Result<BTreeMap<u8, FaderCalibration>> {
        for index in indexes {
            self.inner.with_fader(*index, |_| ())?;
        }
        if !self.is_connected() {
            return Err(FaderError::calibration(indexes, "serial port is not open"));
        }

        let results = calibration::run_advanced(self, indexes, &self.config().calibration).await?;
        Ok(results.into_iter().map(|r| (r.index, r)).collect())
    }

    /// Measure faders, apply their speed factors and announce the results
    pub async fn calibrate(&self, indexes: &[u8]) -> Result<BTreeMap<u8, FaderCalibration>> {
        let results = self.run_calibration(indexes).await?;
        for result in results.values() {
            self.set_faders_movement_speed_factor(result.index, result.speed_factor)?;
        }
        self.inner
            .events
            .emit(FaderEvent::Calibration(results.values().cloned().collect()));
        Ok(results)
    }

    async fn execute_move(
        &self,
        fader_move: &FaderMove,
        interrupt: bool,
        disable_feedback: bool,
        apply_speed_factor: bool,
    ) -> Result<MoveReport> {
        let inner = &self.inner;
        let indexes = fader_move.indexes().to_vec();

        for index in &indexes {
            inner.with_fader(*index, |_| ())?;
        }
        if !inner.transport.is_open() {
            return Err(FaderError::movement(&indexes, "serial port is not open"));
        }

        let started = Instant::now();
        let waited = inner.config.lock_timeout();
        let guard = tokio::time::timeout(waited, inner.send_lock.lock())
            .await
            .map_err(|_| FaderError::QueueLockError { waited })?;

        if interrupt {
            inner.queue.flush(Some(&indexes));
        }

        // Plan every ramp against one consistent snapshot
        let ramps: Vec<(u8, u16, u16, Vec<u16>)> = {
            let faders = inner.faders.read();
            let mut ramps = Vec::with_capacity(indexes.len());
            for (index, target, speed) in fader_move.channels() {
                let fader = faders.get(&index).ok_or(FaderError::FaderNotFound { index })?;
                let speed = if apply_speed_factor {
                    speed * fader.speed_factor()
                } else {
                    speed
                };
                let target_position = fader.target_position(target);
                let ramp = calculate_ramp(
                    fader.raw_position(),
                    target_position,
                    speed,
                    fader_move.resolution(),
                );
                ramps.push((index, fader.raw_position(), target_position, ramp));
            }
            ramps
        };

        inner.events.emit(FaderEvent::MoveStart {
            indexes: indexes.clone(),
            targets: ramps.iter().map(|(_, _, target, _)| *target).collect(),
        });

        let mut plans = Vec::with_capacity(ramps.len());
        for (index, start_position, target_position, ramp) in ramps {
            let mut handles = Vec::with_capacity(ramp.len());
            for (i, position) in ramp.into_iter().enumerate() {
                let enqueued = inner.queue.add(
                    MidiMessage::position(index, position),
                    QueueOptions {
                        track_feedback: !disable_feedback,
                        timeout: inner.config.step_ceiling(i + 1),
                    },
                )?;
                if enqueued.dropped > 0 {
                    inner.events.emit(FaderEvent::Error(FaderError::QueueOverflow {
                        channel: index,
                        dropped: enqueued.dropped,
                        limit: inner.config.max_queue_len,
                    }));
                }
                handles.push(enqueued.handle);
            }
            debug!(
                "Fader {}: {} step(s) {} -> {}",
                index,
                handles.len(),
                start_position,
                target_position
            );
            plans.push(ChannelPlan {
                index,
                start_position,
                target_position,
                handles,
            });
        }
        drop(guard);

        let mut waiters = JoinSet::new();
        for plan in plans {
            waiters.spawn(wait_channel(plan));
        }
        let mut channels = Vec::with_capacity(indexes.len());
        while let Some(joined) = waiters.join_next().await {
            match joined {
                Ok(report) => channels.push(report),
                Err(e) => warn!("Move waiter failed: {}", e),
            }
        }
        channels.sort_by_key(|c| indexes.iter().position(|i| *i == c.index));

        let report = MoveReport {
            indexes,
            channels,
            duration: started.elapsed(),
        };
        inner.events.emit(FaderEvent::MoveComplete(report.clone()));
        Ok(report)
    }
}

async fn wait_channel(plan: ChannelPlan) -> ChannelMoveReport {
    let started = Instant::now();
    let mut report = ChannelMoveReport {
        index: plan.index,
        target_position: plan.target_position,
        steps_queued: plan.handles.len(),
        steps_completed: 0,
        steps_confirmed: 0,
        steps_cancelled: 0,
        steps_timed_out: 0,
        steps_failed: 0,
        duration: Duration::ZERO,
        units_per_second: None,
    };

    for handle in plan.handles {
        match handle.wait().await {
            StepOutcome::Completed { confirmed } => {
                report.steps_completed += 1;
                if confirmed.is_some() {
                    report.steps_confirmed += 1;
                }
            }
            StepOutcome::Cancelled | StepOutcome::Dropped => report.steps_cancelled += 1,
            StepOutcome::TimedOut => report.steps_timed_out += 1,
            StepOutcome::Failed(_) => report.steps_failed += 1,
        }
    }

    report.duration = started.elapsed();
    let secs = report.duration.as_secs_f64();
    if report.is_complete() && secs > 0.0 {
        let distance = plan.start_position.abs_diff(plan.target_position) as f64;
        report.units_per_second = Some(distance / secs);
    }
    report
}

#[async_trait]
impl CalibrationTarget for FaderController {
    async fn timed_move(&self, index: u8, target: f64, speed: f64, resolution: f64) -> Result<Duration> {
        let fader_move = FaderMove::single(index, target, speed)?.with_resolution(resolution)?;
        let report = self.execute_move(&fader_move, true, false, false).await?;

        match report.channel(index) {
            Some(channel) if channel.is_complete() && channel.steps_confirmed == channel.steps_queued => {
                Ok(report.duration)
            }
            Some(channel) => Err(FaderError::movement(
                &[index],
                format!(
                    "{}/{} step(s) confirmed",
                    channel.steps_confirmed, channel.steps_queued
                ),
            )),
            None => Err(FaderError::FaderNotFound { index }),
        }
    }

    fn hardware_feedback(&self) -> bool {
        self.feedback_strategy() == FeedbackStrategy::Hardware
    }
}
