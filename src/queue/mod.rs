//! Per-channel outgoing command queue
//!
//! One FIFO per fader channel. The processing loop writes at most one step
//! per channel at a time, up to `max_in_flight` channels concurrently, and
//! only releases a channel once its step is complete (echo observed, echo
//! timed out, or written when running on software completion).
//!
//! ## Guarantees:
//! - **Sequencing**: per-channel sequence numbers strictly increase, flush included
//! - **Hands win**: a step for a touched channel is never written
//! - **Bounded waits**: every handle resolves within its ceiling

pub mod feedback;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{FaderError, Result};
use crate::midi::MidiMessage;

pub use feedback::{FeedbackRecord, FeedbackStrategy, FeedbackTracker, Observation};

/// Identity of one queued step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    pub channel: u8,
    pub seq: u64,
    /// Raw position the step commands
    pub position: u16,
    pub enqueued_at: Instant,
}

/// How a queued step ended
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Written; `confirmed` holds the echo record under hardware feedback
    Completed { confirmed: Option<FeedbackRecord> },
    /// Flushed before or while waiting for its echo
    Cancelled,
    /// Truncated by a queue overflow
    Dropped,
    /// Ceiling or echo window elapsed
    TimedOut,
    /// The transport rejected the write
    Failed(String),
}

impl StepOutcome {
    /// The step reached the device
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed { .. })
    }

    /// The device confirmed the position
    pub fn is_confirmed(&self) -> bool {
        matches!(self, StepOutcome::Completed { confirmed: Some(_) })
    }
}

/// Per-command options for `MidiQueue::add`
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub track_feedback: bool,
    /// Hard ceiling for the handle, measured from enqueue
    pub timeout: Duration,
}

/// Queue tuning
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Backlog ceiling per channel
    pub max_len: usize,
    /// Channels written concurrently
    pub max_in_flight: usize,
    /// Pause between batches
    pub message_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_len: 4096,
            max_in_flight: crate::fader::MAX_CHANNELS,
            message_delay: Duration::from_millis(1),
        }
    }
}

/// Completion handle for one queued step
#[derive(Debug)]
pub struct CommandHandle {
    pub channel: u8,
    pub seq: u64,
    ceiling: Duration,
    rx: oneshot::Receiver<StepOutcome>,
}

impl CommandHandle {
    /// Wait for the step, never longer than its ceiling
    pub async fn wait(self) -> StepOutcome {
        match tokio::time::timeout(self.ceiling, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => StepOutcome::Cancelled,
            Err(_) => StepOutcome::TimedOut,
        }
    }
}

/// Result of `MidiQueue::add`
#[derive(Debug)]
pub struct Enqueued {
    pub handle: CommandHandle,
    /// Oldest entries dropped to stay under the backlog ceiling
    pub dropped: usize,
}

/// What the processing loop needs from its owner
#[async_trait]
pub trait QueueSink: Send + Sync {
    fn is_touched(&self, channel: u8) -> bool;

    /// Last known raw position, used as the feedback start point
    fn current_position(&self, channel: u8) -> u16;

    async fn write_message(&self, message: &MidiMessage) -> Result<()>;

    fn step_started(&self, step: &StepInfo);

    fn step_finished(&self, step: &StepInfo, outcome: &StepOutcome);

    fn report_error(&self, error: FaderError);
}

struct QueuedCommand {
    info: StepInfo,
    message: MidiMessage,
    track_feedback: bool,
    done: oneshot::Sender<StepOutcome>,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<u8, VecDeque<QueuedCommand>>,
    /// channel -> seq currently written and not yet complete
    in_flight: HashMap<u8, u64>,
    next_seq: HashMap<u8, u64>,
}

/// Per-channel FIFO of outgoing position commands
pub struct MidiQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    feedback: Arc<FeedbackTracker>,
    wake: Notify,
    running: AtomicBool,
}

impl MidiQueue {
    pub fn new(config: QueueConfig, feedback: Arc<FeedbackTracker>) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            feedback,
            wake: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn feedback(&self) -> &Arc<FeedbackTracker> {
        &self.feedback
    }

    /// Queue one message for its fader channel
    pub fn add(&self, message: MidiMessage, options: QueueOptions) -> Result<Enqueued> {
        let channel = message
            .fader_channel()
            .ok_or_else(|| FaderError::movement(&[], format!("'{}' addresses no fader", message)))?;
        let position = match message {
            MidiMessage::PitchBend { value, .. } => value,
            _ => 0,
        };

        let (done, rx) = oneshot::channel();
        let mut dropped = Vec::new();
        let info = {
            let mut state = self.state.lock();
            let next = state.next_seq.entry(channel).or_insert(0);
            *next += 1;
            let info = StepInfo {
                channel,
                seq: *next,
                position,
                enqueued_at: Instant::now(),
            };

            let backlog = state.pending.entry(channel).or_default();
            while backlog.len() >= self.config.max_len.max(1) {
                match backlog.pop_front() {
                    Some(old) => dropped.push(old),
                    None => break,
                }
            }
            backlog.push_back(QueuedCommand {
                info,
                message,
                track_feedback: options.track_feedback,
                done,
            });
            info
        };

        if !dropped.is_empty() {
            warn!(
                "Queue for ch{} over {} entries, dropped {} oldest",
                channel,
                self.config.max_len,
                dropped.len()
            );
        }
        let dropped_count = dropped.len();
        for old in dropped {
            let _ = old.done.send(StepOutcome::Dropped);
        }

        trace!("Queued ch{} seq {} -> {}", channel, info.seq, position);
        self.wake.notify_one();

        Ok(Enqueued {
            handle: CommandHandle {
                channel,
                seq: info.seq,
                ceiling: options.timeout,
                rx,
            },
            dropped: dropped_count,
        })
    }

    /// Cancel pending entries for some or all channels.
    ///
    /// Feedback records on those channels are invalidated too, even when
    /// the bytes already left, so no stale completion can arrive later.
    pub fn flush(&self, channels: Option<&[u8]>) -> usize {
        let mut flushed = Vec::new();
        let touched_channels: Vec<u8> = {
            let mut state = self.state.lock();
            let targets: Vec<u8> = match channels {
                Some(list) => list.to_vec(),
                None => state.pending.keys().copied().chain(state.in_flight.keys().copied()).collect(),
            };
            for channel in &targets {
                if let Some(backlog) = state.pending.get_mut(channel) {
                    flushed.extend(backlog.drain(..));
                }
            }
            targets
        };

        match channels {
            Some(_) => {
                for channel in &touched_channels {
                    self.feedback.invalidate(*channel);
                }
            }
            None => {
                self.feedback.invalidate_all();
            }
        }

        let count = flushed.len();
        for cmd in flushed {
            let _ = cmd.done.send(StepOutcome::Cancelled);
        }
        if count > 0 {
            debug!("Flushed {} pending step(s) on {:?}", count, touched_channels);
        }
        self.wake.notify_one();
        count
    }

    /// Total pending entries across channels
    pub fn len(&self) -> usize {
        self.state.lock().pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self, channel: u8) -> usize {
        self.state.lock().pending.get(&channel).map_or(0, VecDeque::len)
    }

    pub fn is_in_flight(&self, channel: u8) -> bool {
        self.state.lock().in_flight.contains_key(&channel)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Re-evaluate the queue (e.g. after a channel is released by the user)
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Start the processing loop. It stops on `shutdown` or once the sink is gone.
    pub fn spawn(self: &Arc<Self>, sink: Weak<dyn QueueSink>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(sink).await })
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.flush(None);
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>, sink: Weak<dyn QueueSink>) {
        debug!("MIDI queue processor started");

        while self.running.load(Ordering::SeqCst) {
            let Some(target) = sink.upgrade() else {
                break;
            };

            let blocked: HashSet<u8> = self
                .waiting_channels()
                .into_iter()
                .filter(|channel| target.is_touched(*channel))
                .collect();
            let batch = self.take_batch(&blocked);

            if batch.is_empty() {
                drop(target);
                self.wake.notified().await;
                continue;
            }

            let mut failure: Option<(Vec<u8>, String)> = None;
            for cmd in batch {
                if let Some((channels, reason)) = failure.as_mut() {
                    channels.push(cmd.info.channel);
                    let outcome = StepOutcome::Failed(reason.clone());
                    self.finish(cmd.info, cmd.done, outcome, Some(&target));
                    continue;
                }
                let channel = cmd.info.channel;
                if let Err(reason) = self.dispatch(cmd, &target).await {
                    failure = Some((vec![channel], reason));
                }
            }
            if let Some((channels, reason)) = failure {
                target.report_error(self.abandon_pending(channels, &reason));
            }
            drop(target);

            if !self.config.message_delay.is_zero() {
                tokio::time::sleep(self.config.message_delay).await;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("MIDI queue processor stopped");
    }

    fn waiting_channels(&self) -> Vec<u8> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|(_, backlog)| !backlog.is_empty())
            .map(|(channel, _)| *channel)
            .collect()
    }

    /// Pop at most one entry per free, unblocked channel
    fn take_batch(&self, blocked: &HashSet<u8>) -> Vec<QueuedCommand> {
        let mut state = self.state.lock();
        let channels: Vec<u8> = state.pending.keys().copied().collect();
        let mut batch = Vec::new();

        for channel in channels {
            if state.in_flight.len() >= self.config.max_in_flight.max(1) {
                break;
            }
            if state.in_flight.contains_key(&channel) || blocked.contains(&channel) {
                continue;
            }
            if let Some(cmd) = state.pending.get_mut(&channel).and_then(VecDeque::pop_front) {
                state.in_flight.insert(channel, cmd.info.seq);
                batch.push(cmd);
            }
        }
        batch
    }

    /// Fail every pending step after a write error; returns the one error to report
    fn abandon_pending(&self, mut channels: Vec<u8>, reason: &str) -> FaderError {
        let abandoned: Vec<QueuedCommand> = {
            let mut state = self.state.lock();
            state.pending.values_mut().flat_map(|backlog| backlog.drain(..)).collect()
        };

        for cmd in &abandoned {
            if !channels.contains(&cmd.info.channel) {
                channels.push(cmd.info.channel);
            }
        }
        channels.sort_unstable();
        channels.dedup();

        let count = abandoned.len();
        for cmd in abandoned {
            let _ = cmd.done.send(StepOutcome::Failed(reason.to_string()));
        }
        warn!("Serial write failed, abandoned {} pending step(s): {}", count, reason);

        FaderError::movement(
            &channels,
            format!("serial write failed, {} pending step(s) abandoned: {}", count, reason),
        )
    }

    /// Write one step. `Err` carries the write failure reason.
    async fn dispatch(
        self: &Arc<Self>,
        cmd: QueuedCommand,
        sink: &Arc<dyn QueueSink>,
    ) -> std::result::Result<(), String> {
        let QueuedCommand {
            info,
            message,
            track_feedback,
            done,
        } = cmd;

        // Registered before writing so an immediate echo is never missed
        let hardware = track_feedback && self.feedback.strategy() == FeedbackStrategy::Hardware;
        let echo = hardware.then(|| {
            self.feedback.begin(
                info.channel,
                info.seq,
                info.position,
                sink.current_position(info.channel),
            )
        });

        sink.step_started(&info);

        if let Err(e) = sink.write_message(&message).await {
            if echo.is_some() {
                self.feedback.invalidate(info.channel);
            }
            let reason = e.to_string();
            self.finish(info, done, StepOutcome::Failed(reason.clone()), Some(sink));
            return Err(reason);
        }

        match echo {
            None => self.finish(info, done, StepOutcome::Completed { confirmed: None }, Some(sink)),
            Some(rx) => {
                let queue = Arc::clone(self);
                let weak = Arc::downgrade(sink);
                tokio::spawn(async move {
                    let outcome = queue.await_echo(info, rx, &weak).await;
                    let sink = weak.upgrade();
                    queue.finish(info, done, outcome, sink.as_ref());
                });
            }
        }
        Ok(())
    }

    async fn await_echo(
        &self,
        info: StepInfo,
        rx: oneshot::Receiver<FeedbackRecord>,
        sink: &Weak<dyn QueueSink>,
    ) -> StepOutcome {
        match tokio::time::timeout(self.feedback.window(), rx).await {
            Ok(Ok(record)) => StepOutcome::Completed {
                confirmed: Some(record),
            },
            Ok(Err(_)) => StepOutcome::Cancelled,
            Err(_) => {
                let last_position = self
                    .feedback
                    .expire(info.channel, info.seq)
                    .and_then(|record| record.last_position);
                self.feedback.downgrade();

                let error = FaderError::MidiFeedbackError {
                    channel: info.channel,
                    target: info.position,
                    last_position,
                    window: self.feedback.window(),
                };
                warn!("{}", error);
                if let Some(sink) = sink.upgrade() {
                    sink.report_error(error);
                }
                StepOutcome::TimedOut
            }
        }
    }

    fn finish(
        &self,
        info: StepInfo,
        done: oneshot::Sender<StepOutcome>,
        outcome: StepOutcome,
        sink: Option<&Arc<dyn QueueSink>>,
    ) {
        {
            let mut state = self.state.lock();
            if state.in_flight.get(&info.channel) == Some(&info.seq) {
                state.in_flight.remove(&info.channel);
            }
        }

        if let Some(sink) = sink {
            sink.step_finished(&info, &outcome);
        }
        let _ = done.send(outcome);
        self.wake.notify_one();
    }
}
