//! Closed-loop completion tracking
//!
//! Correlates position commands written to the device with the positions it
//! echoes back. Some units echo on the bus and some do not, so the strategy
//! is decided once per session: it starts as configured and can only ever
//! fall back from `Hardware` to `Software`, never flap back.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How a written step is declared complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FeedbackStrategy {
    /// Wait for the device to echo a position within tolerance
    Hardware,
    /// Complete as soon as the bytes are written
    Software,
}

/// One tracked position command
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackRecord {
    pub channel: u8,
    pub seq: u64,
    pub target_position: u16,
    pub start_position: u16,
    pub started_at: Instant,
    pub started: bool,
    pub completed: bool,
    pub ended_at: Option<Instant>,
    pub duration: Option<Duration>,
    /// Last echoed position seen for this record
    pub last_position: Option<u16>,
}

impl FeedbackRecord {
    /// Raw units travelled per second, once completed
    pub fn units_per_second(&self) -> Option<f64> {
        let secs = self.duration?.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(self.start_position.abs_diff(self.target_position) as f64 / secs)
    }
}

/// Result of matching an echoed position
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Nothing outstanding on this channel
    Untracked,
    /// A record is outstanding but the position is not within tolerance yet
    Tracking,
    /// The echo closed the outstanding record
    Completed(FeedbackRecord),
}

impl Observation {
    /// Whether the position belongs to a software-issued move
    pub fn is_correlated(&self) -> bool {
        !matches!(self, Observation::Untracked)
    }
}

struct Outstanding {
    record: FeedbackRecord,
    done: oneshot::Sender<FeedbackRecord>,
}

/// Tracks at most one outstanding command per channel
pub struct FeedbackTracker {
    strategy: Mutex<FeedbackStrategy>,
    outstanding: Mutex<HashMap<u8, Outstanding>>,
    tolerance: u16,
    window: Duration,
}

impl FeedbackTracker {
    pub fn new(strategy: FeedbackStrategy, tolerance: u16, window: Duration) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            outstanding: Mutex::new(HashMap::new()),
            tolerance,
            window,
        }
    }

    pub fn strategy(&self) -> FeedbackStrategy {
        *self.strategy.lock()
    }

    /// How long to wait for an echo before giving up
    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn tolerance(&self) -> u16 {
        self.tolerance
    }

    /// Fall back to software completion for the rest of the session.
    ///
    /// Returns true only on the call that actually changed the strategy.
    pub fn downgrade(&self) -> bool {
        let mut strategy = self.strategy.lock();
        if *strategy == FeedbackStrategy::Software {
            return false;
        }
        *strategy = FeedbackStrategy::Software;
        warn!("Position echo unavailable, falling back to software completion for this session");
        true
    }

    /// Start tracking a command. Any previous record on the channel is invalidated.
    pub fn begin(
        &self,
        channel: u8,
        seq: u64,
        target_position: u16,
        start_position: u16,
    ) -> oneshot::Receiver<FeedbackRecord> {
        let (done, rx) = oneshot::channel();
        let record = FeedbackRecord {
            channel,
            seq,
            target_position,
            start_position,
            started_at: Instant::now(),
            started: true,
            completed: false,
            ended_at: None,
            duration: None,
            last_position: None,
        };
        if let Some(previous) = self.outstanding.lock().insert(channel, Outstanding { record, done }) {
            debug!(
                "Feedback for ch{} seq {} superseded by seq {}",
                channel, previous.record.seq, seq
            );
        }
        rx
    }

    /// Match an echoed position against the outstanding record
    pub fn observe(&self, channel: u8, position: u16) -> Observation {
        let mut outstanding = self.outstanding.lock();
        let within = match outstanding.get_mut(&channel) {
            None => return Observation::Untracked,
            Some(entry) => {
                entry.record.last_position = Some(position);
                entry.record.target_position.abs_diff(position) <= self.tolerance
            }
        };
        if !within {
            return Observation::Tracking;
        }

        let Some(Outstanding { mut record, done }) = outstanding.remove(&channel) else {
            return Observation::Untracked;
        };
        drop(outstanding);

        let now = Instant::now();
        record.completed = true;
        record.ended_at = Some(now);
        record.duration = Some(now.duration_since(record.started_at));
        // The waiter may already have given up; the record is still returned
        let _ = done.send(record.clone());
        Observation::Completed(record)
    }

    /// Drop the record for `seq` after its window elapsed, returning it
    pub fn expire(&self, channel: u8, seq: u64) -> Option<FeedbackRecord> {
        let mut outstanding = self.outstanding.lock();
        match outstanding.get(&channel) {
            Some(entry) if entry.record.seq == seq => {
                outstanding.remove(&channel).map(|entry| entry.record)
            }
            _ => None,
        }
    }

    /// Invalidate the record on a channel; its waiter sees a closed channel
    pub fn invalidate(&self, channel: u8) -> bool {
        self.outstanding.lock().remove(&channel).is_some()
    }

    pub fn invalidate_all(&self) -> usize {
        let mut outstanding = self.outstanding.lock();
        let count = outstanding.len();
        outstanding.clear();
        count
    }

    pub fn is_outstanding(&self, channel: u8) -> bool {
        self.outstanding.lock().contains_key(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FeedbackTracker {
        FeedbackTracker::new(FeedbackStrategy::Hardware, 50, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_echo_within_tolerance_completes() {
        let tracker = tracker();
        let rx = tracker.begin(0, 1, 8000, 0);

        assert_eq!(tracker.observe(0, 4000), Observation::Tracking);
        assert_eq!(tracker.observe(1, 8000), Observation::Untracked);

        match tracker.observe(0, 7960) {
            Observation::Completed(record) => {
                assert!(record.completed);
                assert_eq!(record.last_position, Some(7960));
                assert!(record.duration.is_some());
            }
            other => panic!("expected completion, got {:?}", other),
        }

        let record = rx.await.unwrap();
        assert_eq!(record.seq, 1);
        assert!(!tracker.is_outstanding(0));
    }

    #[tokio::test]
    async fn test_invalidate_closes_waiter() {
        let tracker = tracker();
        let rx = tracker.begin(2, 7, 100, 0);
        assert!(tracker.invalidate(2));
        assert!(rx.await.is_err());
        assert_eq!(tracker.observe(2, 100), Observation::Untracked);
    }

    #[test]
    fn test_expire_only_matching_seq() {
        let tracker = tracker();
        let _first = tracker.begin(1, 1, 100, 0);
        let _second = tracker.begin(1, 2, 200, 100);
        assert!(tracker.expire(1, 1).is_none());
        assert_eq!(tracker.expire(1, 2).map(|r| r.target_position), Some(200));
    }

    #[test]
    fn test_downgrade_is_one_way() {
        let tracker = tracker();
        assert_eq!(tracker.strategy(), FeedbackStrategy::Hardware);
        assert!(tracker.downgrade());
        assert!(!tracker.downgrade());
        assert_eq!(tracker.strategy(), FeedbackStrategy::Software);
    }

    #[test]
    fn test_units_per_second() {
        let record = FeedbackRecord {
            channel: 0,
            seq: 1,
            target_position: 1000,
            start_position: 0,
            started_at: Instant::now(),
            started: true,
            completed: true,
            ended_at: None,
            duration: Some(Duration::from_millis(500)),
            last_position: Some(1000),
        };
        assert_eq!(record.units_per_second(), Some(2000.0));
    }
}
