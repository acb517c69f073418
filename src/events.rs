//! Controller events and the subscriber bus
//!
//! Events fall in two tiers. Public events are what collaborators build
//! on (touch, moves, errors, readiness). Diagnostic events expose the wire
//! and step-level detail useful for logging and debugging.
//!
//! Dispatch is synchronous: `emit` calls every live subscriber in
//! registration order before returning.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::calibration::FaderCalibration;
use crate::error::FaderError;
use crate::fader::FaderInfo;
use crate::midi::MidiMessage;
use crate::queue::{StepInfo, StepOutcome};

/// Event tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTier {
    Public,
    Diagnostic,
}

/// Which tiers a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Public,
    Diagnostic,
    All,
}

impl EventFilter {
    fn accepts(&self, tier: EventTier) -> bool {
        matches!(
            (self, tier),
            (EventFilter::All, _)
                | (EventFilter::Public, EventTier::Public)
                | (EventFilter::Diagnostic, EventTier::Diagnostic)
        )
    }
}

/// Per-channel summary of a finished software move
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMoveReport {
    pub index: u8,
    pub target_position: u16,
    pub steps_queued: usize,
    pub steps_completed: usize,
    pub steps_confirmed: usize,
    pub steps_cancelled: usize,
    pub steps_timed_out: usize,
    pub steps_failed: usize,
    pub duration: std::time::Duration,
    /// Raw units per second over the whole move
    pub units_per_second: Option<f64>,
}

impl ChannelMoveReport {
    /// Every queued step reached the device
    pub fn is_complete(&self) -> bool {
        self.steps_completed == self.steps_queued
    }
}

/// Summary of a finished `move_faders` call
#[derive(Debug, Clone, PartialEq)]
pub struct MoveReport {
    pub indexes: Vec<u8>,
    pub channels: Vec<ChannelMoveReport>,
    pub duration: std::time::Duration,
}

impl MoveReport {
    pub fn channel(&self, index: u8) -> Option<&ChannelMoveReport> {
        self.channels.iter().find(|c| c.index == index)
    }

    pub fn is_complete(&self) -> bool {
        self.channels.iter().all(ChannelMoveReport::is_complete)
    }
}

/// Everything the controller can raise
#[derive(Debug, Clone)]
pub enum FaderEvent {
    Touch(FaderInfo),
    Untouch(FaderInfo),
    /// Hardware-originated move while the user holds the fader
    Move(FaderInfo),
    MoveStart {
        indexes: Vec<u8>,
        targets: Vec<u16>,
    },
    MoveComplete(MoveReport),
    MoveStepStart(StepInfo),
    MoveStepComplete {
        step: StepInfo,
        outcome: StepOutcome,
    },
    ConfigChange(FaderInfo),
    Error(FaderError),
    Ready {
        payload: u8,
    },
    Calibration(Vec<FaderCalibration>),
    MidiIn(MidiMessage),
    MidiOut(MidiMessage),
}

impl FaderEvent {
    pub fn tier(&self) -> EventTier {
        match self {
            FaderEvent::MoveStepStart(_)
            | FaderEvent::MoveStepComplete { .. }
            | FaderEvent::MidiIn(_)
            | FaderEvent::MidiOut(_) => EventTier::Diagnostic,
            _ => EventTier::Public,
        }
    }

    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            FaderEvent::Touch(_) => "touch",
            FaderEvent::Untouch(_) => "untouch",
            FaderEvent::Move(_) => "move",
            FaderEvent::MoveStart { .. } => "move/start",
            FaderEvent::MoveComplete(_) => "move/complete",
            FaderEvent::MoveStepStart(_) => "move/step/start",
            FaderEvent::MoveStepComplete { .. } => "move/step/complete",
            FaderEvent::ConfigChange(_) => "configChange",
            FaderEvent::Error(_) => "error",
            FaderEvent::Ready { .. } => "ready",
            FaderEvent::Calibration(_) => "calibration",
            FaderEvent::MidiIn(_) => "midi/in",
            FaderEvent::MidiOut(_) => "midi/out",
        }
    }
}

/// Callback type for event subscribers
pub type EventCallback = Arc<dyn Fn(&FaderEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Sink {
    Callback(EventCallback),
    Channel(mpsc::UnboundedSender<FaderEvent>),
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    sink: Arc<Sink>,
}

/// Synchronous, registration-ordered event dispatcher
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&FaderEvent) + Send + Sync + 'static,
    {
        self.register(filter, Sink::Callback(Arc::new(callback)))
    }

    /// Register a channel; the subscription ends when the receiver is dropped
    pub fn subscribe_channel(&self, filter: EventFilter) -> mpsc::UnboundedReceiver<FaderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(filter, Sink::Channel(tx));
        rx
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every interested subscriber
    pub fn emit(&self, event: FaderEvent) {
        match event.tier() {
            EventTier::Public => debug!("event {}: {:?}", event.name(), event),
            EventTier::Diagnostic => trace!("event {}: {:?}", event.name(), event),
        }

        // Snapshot so callbacks may subscribe or emit without deadlocking
        let targets: Vec<(SubscriptionId, Arc<Sink>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.filter.accepts(event.tier()))
            .map(|s| (s.id, Arc::clone(&s.sink)))
            .collect();

        let mut closed = Vec::new();
        for (id, sink) in targets {
            match sink.as_ref() {
                Sink::Callback(callback) => callback(&event),
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers.write().retain(|s| !closed.contains(&s.id));
        }
    }

    fn register(&self, filter: EventFilter, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            filter,
            sink: Arc::new(sink),
        });
        id
    }
}
