//! Inbound MIDI dispatch and the queue's view of the controller

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::Inner;
use crate::error::{FaderError, Result};
use crate::events::FaderEvent;
use crate::midi::{MidiFramer, MidiMessage};
use crate::queue::{QueueSink, StepInfo, StepOutcome};
use crate::transport::LinkEvent;

/// Decode the link into messages and handle unexpected closes
pub(super) async fn run_link(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<LinkEvent>) {
    let mut framer = MidiFramer::new();

    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            LinkEvent::Data(bytes) => {
                for message in framer.push(&bytes) {
                    inner.handle_message(message);
                }
            }
            LinkEvent::Closed => {
                framer.reset();
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }

                warn!("Serial link lost, reconnecting");
                if let Err(e) = inner.transport.reconnect().await {
                    error!("Giving up on serial link: {}", e);
                    inner.events.emit(FaderEvent::Error(e));
                    inner.stopping.store(true, Ordering::SeqCst);
                    inner.shutdown();
                    break;
                }
            }
        }
    }

    trace!("Serial link task exited (discarded {} stray bytes)", framer.discarded());
}

impl Inner {
    pub(super) fn handle_message(&self, message: MidiMessage) {
        self.events.emit(FaderEvent::MidiIn(message));

        match message {
            MidiMessage::PitchBend { channel, value } => self.handle_position(channel, value),
            MidiMessage::NoteOn { .. } | MidiMessage::NoteOff { .. } => {
                let touched = matches!(message, MidiMessage::NoteOn { .. });
                match message.fader_channel() {
                    Some(channel) => self.handle_touch(channel, touched),
                    None => trace!("Ignoring note without fader channel: {}", message),
                }
            }
            MidiMessage::ProgramChange { program, payload, .. } => {
                if message.is_ready_beacon() {
                    debug!("Readiness beacon: {}", message);
                }
                self.remember_program_change(program, payload);
            }
            other => trace!("Ignoring {} frame: {}", other.kind().as_str(), other),
        }
    }

    fn handle_position(&self, channel: u8, value: u16) {
        let observation = self.queue.feedback().observe(channel, value);

        let (event, write_back) = {
            let mut faders = self.faders.write();
            let Some(fader) = faders.get_mut(&channel) else {
                trace!("Position for unmanaged channel {}", channel);
                return;
            };

            if !fader.is_touched() && observation.is_correlated() {
                fader.update_position_feedback(value);
                (None, false)
            } else {
                // Only a changed position is written back, so our own write
                // echoed by the device does not loop
                let changed = fader.raw_position() != value;
                let event = fader.update_position_user(value);
                (event, fader.echo_mode() && changed)
            }
        };

        if write_back {
            let message = MidiMessage::position(channel, value);
            match self.transport.write(&message.encode()) {
                Ok(()) => self.events.emit(FaderEvent::MidiOut(message)),
                Err(e) => debug!("Echo write-back on ch{} failed: {}", channel, e),
            }
        }
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    fn handle_touch(&self, channel: u8, touched: bool) {
        let event = {
            let mut faders = self.faders.write();
            match faders.get_mut(&channel) {
                Some(fader) => fader.update_touch_state(touched),
                None => {
                    trace!("Touch for unmanaged channel {}", channel);
                    return;
                }
            }
        };

        if touched {
            let flushed = self.queue.flush(Some(&[channel]));
            if flushed > 0 {
                info!("Fader {} grabbed, dropped {} queued step(s)", channel, flushed);
            }
        } else {
            self.queue.notify();
        }

        if let Some(event) = event {
            self.events.emit(event);
        }
    }
}

#[async_trait]
impl QueueSink for Inner {
    fn is_touched(&self, channel: u8) -> bool {
        self.faders.read().get(&channel).is_some_and(|f| f.is_touched())
    }

    fn current_position(&self, channel: u8) -> u16 {
        self.faders.read().get(&channel).map_or(0, |f| f.raw_position())
    }

    async fn write_message(&self, message: &MidiMessage) -> Result<()> {
        // Serial writes block on the OS port; keep them off the runtime threads
        let transport = Arc::clone(&self.transport);
        let bytes = message.encode();
        let written = tokio::task::spawn_blocking(move || transport.write(&bytes))
            .await
            .map_err(|e| FaderError::movement(&[], format!("write task failed: {}", e)))?;
        written?;
        self.events.emit(FaderEvent::MidiOut(*message));
        Ok(())
    }

    fn step_started(&self, step: &StepInfo) {
        self.events.emit(FaderEvent::MoveStepStart(*step));
    }

    fn step_finished(&self, step: &StepInfo, outcome: &StepOutcome) {
        // Without an echo the written position is the best knowledge we have
        if let StepOutcome::Completed { confirmed: None } = outcome {
            if let Some(fader) = self.faders.write().get_mut(&step.channel) {
                fader.update_position_feedback(step.position);
            }
        }
        self.events.emit(FaderEvent::MoveStepComplete {
            step: *step,
            outcome: outcome.clone(),
        });
    }

    fn report_error(&self, error: FaderError) {
        self.events.emit(FaderEvent::Error(error));
    }
}
