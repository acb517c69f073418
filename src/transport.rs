//! Serial link lifecycle
//!
//! Opens the port with a fixed-interval retry, forwards inbound bytes from a
//! dedicated reader thread into a tokio channel, and reconnects with a
//! bounded, growing delay when the link drops mid-session.

pub mod mock;

use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::error::{FaderError, Result};
use crate::midi::format_hex;

/// Read timeout of the OS port; a timeout is just an idle line
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Upper bound of a single reconnect delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Connection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Open attempts during setup
    pub retries: u32,
    pub retry_interval: Duration,
    /// Attempts after an unexpected close
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
}

/// Delay before reconnect attempt `attempt` (1-based)
pub fn reconnect_delay(interval: Duration, attempt: u32) -> Duration {
    interval.saturating_mul(attempt.max(1)).min(MAX_RECONNECT_DELAY)
}

/// What the reader thread reports
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Data(Vec<u8>),
    /// EOF or hard read error; the connection is gone
    Closed,
}

/// Both halves of an opened port
pub struct PortHandles {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Opens ports. The OS implementation and the in-memory mock both sit behind it.
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<PortHandles>;
}

/// Real serial ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<PortHandles> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(io::Error::from)?;
        let reader = port.try_clone().map_err(io::Error::from)?;
        Ok(PortHandles {
            reader: Box::new(reader),
            writer: Box::new(port),
        })
    }
}

/// Names of the serial ports the OS reports
pub fn list_ports() -> io::Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Single-connection serial transport
pub struct SerialTransport {
    opener: Arc<dyn PortOpener>,
    settings: Mutex<Option<SerialSettings>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Stop flag of the current reader thread
    reader_stop: Mutex<Option<Arc<AtomicBool>>>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    closing: AtomicBool,
}

impl SerialTransport {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            settings: Mutex::new(None),
            writer: Mutex::new(None),
            reader_stop: Mutex::new(None),
            events: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Open the port, retrying at a fixed interval.
    ///
    /// Returns the receiver for inbound link events. It stays valid across
    /// reconnects and ends once the transport is closed.
    pub async fn setup(&self, settings: SerialSettings) -> Result<mpsc::UnboundedReceiver<LinkEvent>> {
        self.close();
        self.closing.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        *self.settings.lock() = Some(settings.clone());

        let attempts = settings.retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.connect(&settings) {
                Ok(()) => {
                    info!(
                        "Serial port '{}' open at {} baud (attempt {}/{})",
                        settings.port, settings.baud_rate, attempt, attempts
                    );
                    return Ok(rx);
                }
                Err(e) => {
                    warn!(
                        "Serial open '{}' failed (attempt {}/{}): {}",
                        settings.port, attempt, attempts, e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                sleep(settings.retry_interval).await;
            }
        }

        self.close();
        Err(FaderError::ConnectionFailed {
            port: settings.port,
            attempts,
            reason: last_error,
        })
    }

    /// Re-open after an unexpected close, with a bounded growing delay
    pub async fn reconnect(&self) -> Result<()> {
        let Some(settings) = self.settings.lock().clone() else {
            return Err(FaderError::ConnectionFailed {
                port: String::new(),
                attempts: 0,
                reason: "transport was never set up".to_string(),
            });
        };

        self.drop_connection();

        let attempts = settings.reconnect_attempts;
        let mut last_error = "no reconnect attempts configured".to_string();
        for attempt in 1..=attempts {
            let delay = reconnect_delay(settings.reconnect_interval, attempt);
            warn!(
                "Serial reconnect #{} for '{}' in {}ms",
                attempt,
                settings.port,
                delay.as_millis()
            );
            sleep(delay).await;

            if self.closing.load(Ordering::SeqCst) {
                last_error = "transport closed while reconnecting".to_string();
                break;
            }

            match self.connect(&settings) {
                Ok(()) => {
                    info!("Serial port '{}' reconnected", settings.port);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Serial reconnect failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        error!("Serial port '{}' lost: {}", settings.port, last_error);
        Err(FaderError::ConnectionFailed {
            port: settings.port,
            attempts,
            reason: last_error,
        })
    }

    /// Write one buffer. Blocks for at most the port timeout.
    ///
    /// A failed write drops the connection and reports the link as closed,
    /// so the owner reconnects exactly as after a read-side close.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let Some(port) = writer.as_mut() else {
            trace!("TX skipped (not connected): {}", format_hex(bytes));
            return Err(self.not_connected("not connected"));
        };

        trace!("TX -> {}", format_hex(bytes));
        match port.write_all(bytes).and_then(|_| port.flush()) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Serial write failed: {}", e);
                *writer = None;
                drop(writer);
                self.link_lost();
                Err(self.not_connected(&e.to_string()))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.lock().is_some()
    }

    pub fn port(&self) -> Option<String> {
        self.settings.lock().as_ref().map(|s| s.port.clone())
    }

    /// Close the link. Safe to call any number of times.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let was_open = self.writer.lock().is_some();
        self.drop_connection();
        // Ends the receiver handed out by `setup`
        self.events.lock().take();
        if was_open {
            info!("Serial port closed");
        }
    }

    fn connect(&self, settings: &SerialSettings) -> io::Result<()> {
        let handles = self.opener.open(&settings.port, settings.baud_rate)?;
        let Some(tx) = self.events.lock().clone() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        };

        let stop = Arc::new(AtomicBool::new(false));
        spawn_reader(handles.reader, tx, stop.clone(), settings.port.clone())?;

        if let Some(previous) = self.reader_stop.lock().replace(stop) {
            previous.store(true, Ordering::SeqCst);
        }
        *self.writer.lock() = Some(handles.writer);
        Ok(())
    }

    /// Stop the reader quietly and emit a single `Closed`
    fn link_lost(&self) {
        if let Some(stop) = self.reader_stop.lock().take() {
            stop.store(true, Ordering::SeqCst);
        }
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(LinkEvent::Closed);
        }
    }

    fn drop_connection(&self) {
        if let Some(stop) = self.reader_stop.lock().take() {
            stop.store(true, Ordering::SeqCst);
        }
        self.writer.lock().take();
    }

    fn not_connected(&self, reason: &str) -> FaderError {
        FaderError::ConnectionFailed {
            port: self.port().unwrap_or_default(),
            attempts: 0,
            reason: reason.to_string(),
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<LinkEvent>,
    stop: Arc<AtomicBool>,
    port: String,
) -> io::Result<()> {
    thread::Builder::new()
        .name("faderlink-serial-rx".to_string())
        .spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        if !stop.load(Ordering::SeqCst) {
                            debug!("Serial '{}' reached EOF", port);
                            let _ = tx.send(LinkEvent::Closed);
                        }
                        break;
                    }
                    Ok(n) => {
                        trace!("RX <- {}", format_hex(&buf[..n]));
                        if tx.send(LinkEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        if !stop.load(Ordering::SeqCst) {
                            warn!("Serial '{}' read failed: {}", port, e);
                            let _ = tx.send(LinkEvent::Closed);
                        }
                        break;
                    }
                }
            }
            trace!("Serial reader for '{}' exited", port);
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::*;

    fn settings() -> SerialSettings {
        SerialSettings {
            port: "mock0".to_string(),
            baud_rate: 115_200,
            retries: 3,
            retry_interval: Duration::from_millis(5),
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_reconnect_delay_is_bounded() {
        let base = Duration::from_millis(250);
        assert_eq!(reconnect_delay(base, 1), Duration::from_millis(250));
        assert_eq!(reconnect_delay(base, 4), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(base, 1000), MAX_RECONNECT_DELAY);
    }

    #[tokio::test]
    async fn test_setup_retries_then_succeeds() {
        let port = MockPort::new();
        port.fail_next_opens(2);
        let transport = SerialTransport::new(Arc::new(port.clone()));

        let _rx = transport.setup(settings()).await.unwrap();
        assert!(transport.is_open());
        assert_eq!(port.open_count(), 1);
    }

    #[tokio::test]
    async fn test_setup_exhaustion_reports_attempts() {
        let port = MockPort::new();
        port.fail_next_opens(10);
        let transport = SerialTransport::new(Arc::new(port));

        match transport.setup(settings()).await {
            Err(FaderError::ConnectionFailed { attempts, port, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(port, "mock0");
            }
            other => panic!("expected ConnectionFailed, got {:?}", other.map(|_| ())),
        }
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let port = MockPort::new();
        let transport = SerialTransport::new(Arc::new(port.clone()));
        let mut rx = transport.setup(settings()).await.unwrap();

        transport.write(&[0xE0, 0x00, 0x40]).unwrap();
        assert_eq!(port.written(), vec![0xE0, 0x00, 0x40]);

        port.inject(&[0x90, 0x7F, 104]);
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(LinkEvent::Data(bytes))) => assert_eq!(bytes, vec![0x90, 0x7F, 104]),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let port = MockPort::new();
        let transport = SerialTransport::new(Arc::new(port.clone()));
        let mut rx = transport.setup(settings()).await.unwrap();

        port.disconnect();
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(LinkEvent::Closed)) => {}
            other => panic!("expected close, got {:?}", other),
        }

        transport.reconnect().await.unwrap();
        assert!(transport.is_open());
        assert_eq!(port.open_count(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_drops_writer() {
        let port = MockPort::new();
        let transport = SerialTransport::new(Arc::new(port.clone()));
        let _rx = transport.setup(settings()).await.unwrap();

        port.fail_writes(true);
        assert!(transport.write(&[0xE0, 0, 0]).is_err());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_write_failure_reports_one_close() {
        let port = MockPort::new();
        let transport = SerialTransport::new(Arc::new(port.clone()));
        let mut rx = transport.setup(settings()).await.unwrap();

        port.fail_writes(true);
        assert!(transport.write(&[0xE0, 0, 0]).is_err());
        assert!(transport.write(&[0xE0, 0, 0]).is_err());

        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(LinkEvent::Closed)) => {}
            other => panic!("expected close, got {:?}", other),
        }
        // the stopped reader must not add a second close
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());

        port.fail_writes(false);
        transport.reconnect().await.unwrap();
        transport.write(&[0xE0, 0x00, 0x40]).unwrap();
        assert_eq!(port.written(), vec![0xE0, 0x00, 0x40]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let port = MockPort::new();
        let transport = SerialTransport::new(Arc::new(port));
        let mut rx = transport.setup(settings()).await.unwrap();

        transport.close();
        transport.close();
        assert!(!transport.is_open());
        assert!(transport.write(&[0xE0, 0, 0]).is_err());
        // the reader thread may still hold a sender for one read cycle
        let ended = tokio::time::timeout(Duration::from_secs(1), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
    }
}
