//! Tests for the fader controller against in-memory ports

use super::*;
use crate::events::EventFilter;
use crate::fader::progression_to_position;
use crate::midi::MidiMessage;
use crate::transport::mock::MockPort;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.fader_indexes = vec![0, 1];
    config.message_delay_ms = 0;
    config.feedback_midi = false;
    config.feedback_timeout_ms = 80;
    config.command_timeout_ms = 500;
    config.lock_timeout_ms = 500;
    config.ready_poll_interval_ms = 5;
    config.ready_max_attempts = 20;
    config.stop_timeout_ms = 1000;
    config.serial.port = "mock0".to_string();
    config.serial.retries = 2;
    config.serial.retry_interval_ms = 5;
    config.serial.reconnect_attempts = 3;
    config.serial.reconnect_interval_ms = 5;
    config.calibration.resolutions = vec![1.0, 0.5];
    config.calibration.speed_steps = 2;
    config.calibration.min_speed = 50.0;
    config.calibration.max_speed = 100.0;
    config.calibration.warmup_runs = 0;
    config.calibration.measured_runs = 2;
    config.calibration.run_delay_ms = 0;
    config
}

fn hardware_config() -> ControllerConfig {
    let mut config = test_config();
    config.feedback_midi = true;
    config
}

async fn connected(port: &MockPort, config: ControllerConfig) -> FaderController {
    let controller = FaderController::with_opener(config, Arc::new(port.clone())).unwrap();
    controller.connect().await.unwrap();
    controller
}

/// Next event with the given name, skipping others
async fn next_named(rx: &mut UnboundedReceiver<FaderEvent>, name: &str) -> FaderEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(event) if event.name() == name => return event,
                Some(_) => continue,
                None => panic!("event bus closed while waiting for '{}'", name),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .unwrap_or_else(|_| panic!("no '{}' event", name))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn drain_names(rx: &mut UnboundedReceiver<FaderEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    names
}

#[test]
fn test_construct_rejects_invalid_config() {
    let mut config = test_config();
    config.fader_indexes = vec![1, 1];
    let result = FaderController::with_opener(config, Arc::new(MockPort::new()));
    assert!(matches!(result, Err(FaderError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_controllers_are_independent() {
    let a_port = MockPort::new();
    let b_port = MockPort::new();
    let a = connected(&a_port, test_config()).await;
    let b = connected(&b_port, test_config()).await;

    a.set_fader_echo_mode(0, true).unwrap();
    assert!(a.fader_info(0).unwrap().echo_mode);
    assert!(!b.fader_info(0).unwrap().echo_mode);

    a.move_faders(&FaderMove::single(0, 100.0, 100.0).unwrap(), false, false)
        .await
        .unwrap();
    assert!(b_port.written().is_empty());
}

#[tokio::test]
async fn test_setup_serial_failure() {
    let port = MockPort::new();
    port.fail_next_opens(5);
    let controller = FaderController::with_opener(test_config(), Arc::new(port)).unwrap();
    let mut errors = controller.events().subscribe_channel(EventFilter::Public);

    match controller.connect().await {
        Err(FaderError::ConnectionFailed { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected ConnectionFailed, got {:?}", other),
    }
    assert!(matches!(next_named(&mut errors, "error").await, FaderEvent::Error(_)));
    assert_eq!(controller.state(), ControllerState::Constructed);
}

#[tokio::test]
async fn test_start_requires_open_transport() {
    let controller = FaderController::with_opener(test_config(), Arc::new(MockPort::new())).unwrap();
    assert!(matches!(
        controller.start().await,
        Err(FaderError::ConnectionFailed { .. })
    ));
}

#[tokio::test]
async fn test_start_without_beacon_fails() {
    let mut config = test_config();
    config.ready_max_attempts = 3;
    let controller = connected(&MockPort::new(), config).await;

    match controller.start().await {
        Err(FaderError::DeviceNotReady { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected DeviceNotReady, got {:?}", other),
    }
    assert_eq!(controller.state(), ControllerState::SerialConnected);
}

#[tokio::test]
async fn test_start_after_beacon() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    // Unrelated program changes do not count
    port.inject_message(MidiMessage::ProgramChange {
        channel: 0,
        program: 1,
        payload: 2,
    });
    port.inject_message(MidiMessage::ProgramChange {
        channel: 0,
        program: 116,
        payload: 0,
    });

    controller.start().await.unwrap();
    assert_eq!(controller.state(), ControllerState::Running);
    match next_named(&mut events, "ready").await {
        FaderEvent::Ready { payload } => assert_eq!(payload, 116),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_touch_and_untouch() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    port.touch(0, true);
    match next_named(&mut events, "touch").await {
        FaderEvent::Touch(info) => {
            assert_eq!(info.index, 0);
            assert!(info.touch);
        }
        other => panic!("unexpected {:?}", other),
    }

    port.touch(0, false);
    match next_named(&mut events, "untouch").await {
        FaderEvent::Untouch(info) => assert!(!info.touch),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_user_move_only_while_touched() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    port.inject_message(MidiMessage::position(1, 3000));
    wait_until(|| controller.fader_info(1).unwrap().raw_position == 3000).await;

    port.touch(1, true);
    port.inject_message(MidiMessage::position(1, 6000));
    match next_named(&mut events, "move").await {
        FaderEvent::Move(info) => assert_eq!(info.raw_position, 6000),
        other => panic!("unexpected {:?}", other),
    }
    // the untouched report raised nothing
    assert!(!drain_names(&mut events).contains(&"move"));
}

#[tokio::test]
async fn test_move_full_travel() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    let report = controller
        .move_faders(&FaderMove::single(0, 100.0, 50.0).unwrap(), false, false)
        .await
        .unwrap();

    let channel = report.channel(0).unwrap();
    assert!(channel.steps_queued >= 2);
    assert!(report.is_complete());

    let written = port.written_positions(0);
    assert_eq!(written.len(), channel.steps_queued);
    assert_eq!(*written.last().unwrap(), progression_to_position(100.0));
    assert_eq!(controller.fader_info(0).unwrap().raw_position, 16383);

    let names = drain_names(&mut events);
    assert_eq!(names.iter().filter(|n| **n == "move/start").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "move/complete").count(), 1);
}

#[tokio::test]
async fn test_step_events_are_diagnostic() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut diagnostic = controller.events().subscribe_channel(EventFilter::Diagnostic);

    controller
        .move_faders(&FaderMove::single(1, 100.0, 100.0).unwrap(), false, false)
        .await
        .unwrap();

    let names = drain_names(&mut diagnostic);
    assert!(names.contains(&"move/step/start"));
    assert!(names.contains(&"move/step/complete"));
    assert!(names.contains(&"midi/out"));
    assert!(!names.contains(&"move/complete"));
}

#[tokio::test]
async fn test_unknown_fader() {
    let controller = connected(&MockPort::new(), test_config()).await;
    let result = controller
        .move_faders(&FaderMove::single(3, 50.0, 50.0).unwrap(), false, false)
        .await;
    assert!(matches!(result, Err(FaderError::FaderNotFound { index: 3 })));
    assert!(controller.set_fader_echo_mode(2, true).is_err());
}

#[tokio::test]
async fn test_hardware_echo_confirms_steps() {
    let port = MockPort::echoing();
    let controller = connected(&port, hardware_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    let report = controller
        .move_faders(&FaderMove::single(0, 75.0, 80.0).unwrap(), false, false)
        .await
        .unwrap();

    let channel = report.channel(0).unwrap();
    assert_eq!(channel.steps_confirmed, channel.steps_queued);
    assert_eq!(controller.feedback_strategy(), FeedbackStrategy::Hardware);
    assert_eq!(
        controller.fader_info(0).unwrap().raw_position,
        progression_to_position(75.0)
    );
    // correlated echoes never surface as user moves
    assert!(!drain_names(&mut events).contains(&"move"));
}

#[tokio::test]
async fn test_missing_echo_falls_back_to_software() {
    let port = MockPort::new();
    let controller = connected(&port, hardware_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    let first = controller
        .move_faders(&FaderMove::single(0, 100.0, 100.0).unwrap(), false, false)
        .await
        .unwrap();
    assert_eq!(first.channel(0).unwrap().steps_timed_out, 1);

    match next_named(&mut events, "error").await {
        FaderEvent::Error(e) => assert_eq!(e.code(), "MIDI_FEEDBACK_ERROR"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(controller.feedback_strategy(), FeedbackStrategy::Software);

    let second = controller
        .move_faders(&FaderMove::single(0, 0.0, 100.0).unwrap(), false, false)
        .await
        .unwrap();
    assert!(second.is_complete());
    assert_eq!(second.channel(0).unwrap().steps_confirmed, 0);
}

#[tokio::test]
async fn test_touched_fader_is_never_driven() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;

    port.touch(1, true);
    wait_until(|| controller.fader_info(1).unwrap().touch).await;

    let mover = controller.clone();
    let pending = tokio::spawn(async move {
        mover
            .move_faders(&FaderMove::single(1, 100.0, 100.0).unwrap(), false, false)
            .await
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(port.written_positions(1).is_empty());
    assert!(controller.queue_len() > 0);

    port.touch(1, false);
    let report = pending.await.unwrap().unwrap();
    assert!(report.is_complete());
    assert_eq!(*port.written_positions(1).last().unwrap(), 16383);
}

#[tokio::test]
async fn test_touch_flushes_pending_steps() {
    let mut config = test_config();
    config.message_delay_ms = 10;
    let port = MockPort::new();
    let controller = connected(&port, config).await;

    let mover = controller.clone();
    let pending = tokio::spawn(async move {
        mover
            .move_faders(&FaderMove::single(0, 100.0, 5.0).unwrap(), false, false)
            .await
    });
    wait_until(|| !port.written_positions(0).is_empty()).await;

    port.touch(0, true);
    let report = pending.await.unwrap().unwrap();
    assert!(report.channel(0).unwrap().steps_cancelled > 0);
    assert_eq!(controller.queue_len(), 0);
}

#[tokio::test]
async fn test_interrupt_replaces_stale_backlog() {
    let mut config = test_config();
    config.message_delay_ms = 10;
    let port = MockPort::new();
    let controller = connected(&port, config).await;

    let mover = controller.clone();
    let slow = tokio::spawn(async move {
        mover
            .move_faders(&FaderMove::single(0, 100.0, 5.0).unwrap(), false, false)
            .await
    });
    wait_until(|| !port.written_positions(0).is_empty()).await;

    let fresh = controller
        .move_faders(&FaderMove::single(0, 0.0, 100.0).unwrap(), true, false)
        .await
        .unwrap();
    assert!(fresh.is_complete());

    let stale = slow.await.unwrap().unwrap();
    assert!(stale.channel(0).unwrap().steps_cancelled > 0);
    assert_eq!(*port.written_positions(0).last().unwrap(), 0);
}

#[tokio::test]
async fn test_queue_overflow_is_reported() {
    let mut config = test_config();
    config.max_queue_len = 4;
    let port = MockPort::new();
    let controller = connected(&port, config).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    port.touch(0, true);
    wait_until(|| controller.fader_info(0).unwrap().touch).await;

    let mover = controller.clone();
    let pending = tokio::spawn(async move {
        mover
            .move_faders(&FaderMove::single(0, 100.0, 10.0).unwrap(), false, false)
            .await
    });

    match next_named(&mut events, "error").await {
        FaderEvent::Error(FaderError::QueueOverflow { channel, limit, .. }) => {
            assert_eq!(channel, 0);
            assert_eq!(limit, 4);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(controller.queue_len() <= 4);

    port.touch(0, false);
    let report = pending.await.unwrap().unwrap();
    let channel = report.channel(0).unwrap();
    assert_eq!(channel.steps_completed, 4);
    assert_eq!(channel.steps_cancelled, channel.steps_queued - 4);
}

#[tokio::test]
async fn test_trim_map_presentation_and_commands() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    controller.set_fader_progression_map(0, 10.0, 90.0).unwrap();
    assert!(matches!(
        next_named(&mut events, "configChange").await,
        FaderEvent::ConfigChange(_)
    ));
    assert!(controller.set_fader_progression_map(0, 90.0, 10.0).is_err());

    port.inject_message(MidiMessage::position(0, 0));
    port.inject_message(MidiMessage::position(0, 16383));
    wait_until(|| controller.fader_info(0).unwrap().raw_position == 16383).await;
    assert!((controller.fader_info(0).unwrap().progression - 90.0).abs() < 1e-9);

    controller
        .move_faders(&FaderMove::single(0, 0.0, 100.0).unwrap(), false, false)
        .await
        .unwrap();
    assert_eq!(*port.written_positions(0).last().unwrap(), progression_to_position(10.0));
    assert_eq!(controller.fader_info(0).unwrap().raw_position, progression_to_position(10.0));
}

#[tokio::test]
async fn test_echo_mode_writes_back_user_positions() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;

    port.inject_message(MidiMessage::position(0, 5000));
    wait_until(|| controller.fader_info(0).unwrap().raw_position == 5000).await;
    assert!(port.written_positions(0).is_empty());

    controller.set_fader_echo_mode(0, true).unwrap();
    port.inject_message(MidiMessage::position(0, 7000));
    wait_until(|| port.written_positions(0) == vec![7000]).await;

    // the device repeating the same position is not written again
    port.inject_message(MidiMessage::position(0, 7000));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(port.written_positions(0), vec![7000]);
}

#[tokio::test]
async fn test_speed_factor_scales_ramp() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;

    controller
        .move_faders(&FaderMove::single(0, 100.0, 10.0).unwrap(), false, false)
        .await
        .unwrap();
    let plain = port.written_positions(0).len();

    assert!(controller.set_faders_movement_speed_factor(1, 0.0).is_err());
    controller.set_faders_movement_speed_factor(1, 2.0).unwrap();
    controller
        .move_faders(&FaderMove::single(1, 100.0, 10.0).unwrap(), false, false)
        .await
        .unwrap();
    let scaled = port.written_positions(1).len();

    assert!(scaled < plain, "{} !< {}", scaled, plain);
}

#[tokio::test]
async fn test_combined_move_drives_all_channels() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;

    let combined = controller
        .combine_moves(&[
            FaderMove::single(0, 25.0, 100.0).unwrap(),
            FaderMove::single(1, 75.0, 100.0).unwrap(),
            FaderMove::single(0, 99.0, 100.0).unwrap(),
        ])
        .unwrap();
    assert_eq!(combined.indexes(), &[0, 1]);

    let report = controller.move_faders(&combined, false, false).await.unwrap();
    assert_eq!(report.channels.len(), 2);
    assert_eq!(*port.written_positions(0).last().unwrap(), progression_to_position(25.0));
    assert_eq!(*port.written_positions(1).last().unwrap(), progression_to_position(75.0));
}

#[tokio::test]
async fn test_link_loss_reconnects() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;

    port.disconnect();
    wait_until(|| port.open_count() == 2 && controller.is_connected()).await;

    controller
        .move_faders(&FaderMove::single(0, 50.0, 100.0).unwrap(), false, false)
        .await
        .unwrap();
    assert_eq!(controller.state(), ControllerState::SerialConnected);
}

#[tokio::test]
async fn test_write_failure_reconnects_and_recovers() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);
    let full_travel = FaderMove::single(0, 100.0, 50.0).unwrap();

    port.fail_writes(true);
    let report = controller.move_faders(&full_travel, true, false).await.unwrap();
    let channel = report.channel(0).unwrap();
    assert!(channel.steps_queued >= 2);
    assert_eq!(channel.steps_completed, 0);
    assert_eq!(channel.steps_failed, channel.steps_queued);
    port.fail_writes(false);

    wait_until(|| port.open_count() == 2 && controller.is_connected()).await;
    let names = drain_names(&mut events);
    assert_eq!(names.iter().filter(|name| **name == "error").count(), 1);
    assert_eq!(controller.state(), ControllerState::SerialConnected);

    let report = controller.move_faders(&full_travel, true, false).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(*port.written_positions(0).last().unwrap(), progression_to_position(100.0));
}

#[tokio::test]
async fn test_link_loss_exhaustion_is_fatal() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    port.fail_next_opens(10);
    port.disconnect();

    match next_named(&mut events, "error").await {
        FaderEvent::Error(e) => {
            assert!(e.is_fatal());
            assert_eq!(e.code(), "CONNECTION_FAILED");
        }
        other => panic!("unexpected {:?}", other),
    }
    wait_until(|| controller.state() == ControllerState::Stopped).await;
    assert!(!controller.is_connected());
}

#[tokio::test]
async fn test_stop_resets_and_closes() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;
    controller
        .move_faders(&FaderMove::new(&[0, 1], 100.0, 100.0).unwrap(), false, false)
        .await
        .unwrap();

    controller.stop().await;
    assert_eq!(*port.written_positions(0).last().unwrap(), 0);
    assert_eq!(*port.written_positions(1).last().unwrap(), 0);
    assert!(!controller.is_connected());
    assert_eq!(controller.state(), ControllerState::Stopped);

    // idempotent
    controller.stop().await;
}

#[tokio::test]
async fn test_stop_closes_even_when_reset_cannot_run() {
    let port = MockPort::new();
    let controller = connected(&port, test_config()).await;

    port.touch(0, true);
    wait_until(|| controller.fader_info(0).unwrap().touch).await;

    // the reset of fader 0 can never be written while it is held
    let started = std::time::Instant::now();
    controller.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(!controller.is_connected());
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn test_stop_without_connection() {
    let controller = FaderController::with_opener(test_config(), Arc::new(MockPort::new())).unwrap();
    controller.stop().await;
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn test_calibration_requires_hardware_feedback() {
    let controller = connected(&MockPort::new(), test_config()).await;
    assert!(matches!(
        controller.run_calibration(&[0]).await,
        Err(FaderError::CalibrationFailed { .. })
    ));
    assert!(matches!(
        controller.run_calibration(&[3]).await,
        Err(FaderError::FaderNotFound { index: 3 })
    ));
}

#[tokio::test]
async fn test_calibrate_applies_results() {
    let port = MockPort::echoing();
    let controller = connected(&port, hardware_config()).await;
    let mut events = controller.events().subscribe_channel(EventFilter::Public);

    let results = controller.calibrate(&[1]).await.unwrap();
    let result = &results[&1];
    assert_eq!(result.cells.len(), 4);
    assert!([1.0, 0.5].contains(&result.optimal_resolution));
    // corrected towards the reference speed read as units per second
    let settings = &controller.config().calibration;
    let expected = (settings.reference_speed / result.effective_speed)
        .clamp(settings.min_speed_factor, settings.max_speed_factor);
    assert!((result.speed_factor - expected).abs() < 1e-9);
    assert_eq!(controller.fader_info(1).unwrap().speed_factor, result.speed_factor);

    match next_named(&mut events, "calibration").await {
        FaderEvent::Calibration(list) => assert_eq!(list.len(), 1),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_start_runs_basic_calibration() {
    let mut config = test_config();
    config.calibrate_on_start = true;
    let port = MockPort::new();
    let controller = connected(&port, config).await;

    port.signal_ready();
    controller.start().await.unwrap();

    let written = port.written_positions(0);
    assert!(written.contains(&16383));
    assert_eq!(*written.last().unwrap(), 0);
    assert_eq!(controller.state(), ControllerState::Running);
}
