//! Fader controller - orchestration of the whole control layer
//!
//! The controller owns the fader set, the outgoing queue, the feedback
//! tracker and the serial transport. Each instance is self-contained, so
//! several controllers (e.g. against mock ports in tests) can coexist.
//!
//! Lifecycle: constructed -> serial-connected -> device-ready -> running -> stopped.

mod inbound;
mod movement;

#[cfg(test)]
mod tests;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{FaderError, Result};
use crate::events::{EventBus, FaderEvent};
use crate::fader::{Fader, FaderInfo, FaderMove};
use crate::midi::READY_PAYLOADS;
use crate::queue::{FeedbackStrategy, FeedbackTracker, MidiQueue, QueueSink};
use crate::transport::{PortOpener, SerialSettings, SerialTransport, SystemPortOpener};

/// Recent PROGRAM_CHANGE frames kept for readiness polling
pub const READY_CACHE_LEN: usize = 8;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Constructed,
    SerialConnected,
    DeviceReady,
    Running,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Constructed => "constructed",
            ControllerState::SerialConnected => "serial-connected",
            ControllerState::DeviceReady => "device-ready",
            ControllerState::Running => "running",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared controller state
struct Inner {
    config: ControllerConfig,
    faders: RwLock<BTreeMap<u8, Fader>>,
    queue: Arc<MidiQueue>,
    transport: Arc<SerialTransport>,
    events: EventBus,
    state: Mutex<ControllerState>,
    /// (program, payload) of recent PROGRAM_CHANGE frames
    ready_cache: Mutex<VecDeque<(u8, u8)>>,
    /// Guards the enqueue section of `move_faders`
    send_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set while `stop` runs so link closes are not treated as failures
    stopping: AtomicBool,
}

/// Handle to a fader controller; clones share the same controller
#[derive(Clone)]
pub struct FaderController {
    inner: Arc<Inner>,
}

impl FaderController {
    /// Controller on real serial ports
    pub fn new(config: ControllerConfig) -> Result<Self> {
        Self::with_opener(config, Arc::new(SystemPortOpener))
    }

    /// Controller on a custom port opener (mock ports in tests)
    pub fn with_opener(config: ControllerConfig, opener: Arc<dyn PortOpener>) -> Result<Self> {
        config.validate()?;

        let faders = config
            .fader_indexes
            .iter()
            .map(|index| (*index, Fader::new(*index)))
            .collect();

        let strategy = if config.feedback_midi {
            FeedbackStrategy::Hardware
        } else {
            FeedbackStrategy::Software
        };
        let feedback = Arc::new(FeedbackTracker::new(
            strategy,
            config.feedback_tolerance,
            config.feedback_timeout(),
        ));
        let queue = Arc::new(MidiQueue::new(config.queue_config(), feedback));

        debug!(
            "Fader controller for {:?} ({:?} feedback)",
            config.fader_indexes, strategy
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                faders: RwLock::new(faders),
                queue,
                transport: Arc::new(SerialTransport::new(opener)),
                events: EventBus::new(),
                state: Mutex::new(ControllerState::Constructed),
                ready_cache: Mutex::new(VecDeque::with_capacity(READY_CACHE_LEN)),
                send_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    /// Open the port from the `serial` config section
    pub async fn connect(&self) -> Result<()> {
        self.setup_serial(self.inner.config.serial.settings()).await
    }

    /// Open the serial link and start the inbound and queue tasks
    pub async fn setup_serial(&self, settings: SerialSettings) -> Result<()> {
        let inner = &self.inner;
        inner.stopping.store(false, Ordering::SeqCst);
        inner.abort_tasks();
        inner.ready_cache.lock().clear();

        let rx = match inner.transport.setup(settings).await {
            Ok(rx) => rx,
            Err(e) => {
                inner.events.emit(FaderEvent::Error(e.clone()));
                return Err(e);
            }
        };

        let inbound = tokio::spawn(inbound::run_link(Arc::downgrade(inner), rx));
        let sink: Arc<dyn QueueSink> = inner.clone();
        let processor = inner.queue.spawn(Arc::downgrade(&sink));
        inner.tasks.lock().extend([inbound, processor]);

        inner.set_state(ControllerState::SerialConnected);
        Ok(())
    }

    /// Wait for the readiness beacon, optionally calibrate, then run
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.transport.is_open() {
            return Err(FaderError::ConnectionFailed {
                port: inner.transport.port().unwrap_or_default(),
                attempts: 0,
                reason: "serial port is not open".to_string(),
            });
        }
        if inner.state() == ControllerState::Running {
            return Ok(());
        }

        let attempts = inner.config.ready_max_attempts.max(1);
        let mut payload = None;
        for attempt in 1..=attempts {
            payload = inner.ready_payload();
            if payload.is_some() {
                debug!("Device ready after {} poll(s)", attempt);
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(inner.config.ready_poll_interval()).await;
            }
        }

        let Some(payload) = payload else {
            let error = FaderError::DeviceNotReady { attempts };
            warn!("{}", error);
            inner.events.emit(FaderEvent::Error(error.clone()));
            return Err(error);
        };

        inner.set_state(ControllerState::DeviceReady);
        inner.events.emit(FaderEvent::Ready { payload });

        if inner.config.calibrate_on_start {
            if let Err(e) = self.calibrate_basic().await {
                warn!("Startup calibration failed: {}", e);
                inner.events.emit(FaderEvent::Error(e));
            }
        }

        inner.set_state(ControllerState::Running);
        Ok(())
    }

    /// Reset faders, then release everything. Never fails.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.state() == ControllerState::Stopped && !inner.transport.is_open() {
            return;
        }

        if inner.transport.is_open() {
            let indexes = self.fader_indexes();
            match FaderMove::new(&indexes, 0.0, inner.config.medium_speed()) {
                Ok(reset) => {
                    let outcome =
                        tokio::time::timeout(inner.config.stop_timeout(), self.move_faders(&reset, true, true)).await;
                    match outcome {
                        Ok(Ok(_)) => debug!("Faders reset"),
                        Ok(Err(e)) => warn!("Fader reset failed: {}", e),
                        Err(_) => warn!("Fader reset did not finish within {:?}", inner.config.stop_timeout()),
                    }
                }
                Err(e) => warn!("Fader reset skipped: {}", e),
            }
        }

        inner.stopping.store(true, Ordering::SeqCst);
        inner.shutdown();
        info!("Fader controller stopped");
    }

    /// Release the link without resetting faders
    pub fn close(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.shutdown();
    }

    pub fn set_fader_progression_map(&self, index: u8, min: f64, max: f64) -> Result<()> {
        let event = self.inner.with_fader(index, |fader| fader.set_progression_map(min, max))??;
        self.inner.events.emit(event);
        Ok(())
    }

    pub fn set_faders_movement_speed_factor(&self, index: u8, factor: f64) -> Result<()> {
        let event = self.inner.with_fader(index, |fader| fader.set_speed_factor(factor))??;
        self.inner.events.emit(event);
        Ok(())
    }

    pub fn set_fader_echo_mode(&self, index: u8, enabled: bool) -> Result<()> {
        let event = self.inner.with_fader(index, |fader| fader.set_echo_mode(enabled))?;
        self.inner.events.emit(event);
        Ok(())
    }

    pub fn fader_info(&self, index: u8) -> Result<FaderInfo> {
        self.inner.with_fader(index, |fader| fader.info())
    }

    pub fn faders_info(&self) -> Vec<FaderInfo> {
        self.inner.faders.read().values().map(Fader::info).collect()
    }

    pub fn fader_indexes(&self) -> Vec<u8> {
        self.inner.config.fader_indexes.clone()
    }

    pub fn state(&self) -> ControllerState {
        self.inner.state()
    }

    pub fn feedback_strategy(&self) -> FeedbackStrategy {
        self.inner.queue.feedback().strategy()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_open()
    }

    /// Subscribe here for touch, move, error and the other events
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Steps waiting to be written
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }
}

impl Inner {
    fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ControllerState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            info!("Fader controller {} -> {}", previous, state);
        }
    }

    fn with_fader<T>(&self, index: u8, f: impl FnOnce(&mut Fader) -> T) -> Result<T> {
        let mut faders = self.faders.write();
        let fader = faders.get_mut(&index).ok_or(FaderError::FaderNotFound { index })?;
        Ok(f(fader))
    }

    /// First readiness payload in the cache
    fn ready_payload(&self) -> Option<u8> {
        self.ready_cache.lock().iter().find_map(|(program, payload)| {
            if READY_PAYLOADS.contains(payload) {
                Some(*payload)
            } else if READY_PAYLOADS.contains(program) {
                Some(*program)
            } else {
                None
            }
        })
    }

    fn remember_program_change(&self, program: u8, payload: u8) {
        let mut cache = self.ready_cache.lock();
        if cache.len() == READY_CACHE_LEN {
            cache.pop_front();
        }
        cache.push_back((program, payload));
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Stop processing and close the link
    fn shutdown(&self) {
        self.queue.shutdown();
        self.transport.close();
        self.abort_tasks();
        self.set_state(ControllerState::Stopped);
    }
}
