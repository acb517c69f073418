//! faderlink - motorized fader controller
//!
//! Command-line front end: port discovery, bus sniffing, one-off moves,
//! calibration, and a long-running controller that logs its events.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use faderlink::events::{EventFilter, FaderEvent};
use faderlink::sniffer::{self, SnifferEvent};
use faderlink::transport::mock::MockPort;
use faderlink::{ControllerConfig, FaderController, FaderMove, PortOpener, SystemPortOpener};

/// faderlink - drive motorized touch faders over MIDI-over-serial
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults are used when it does not exist)
    #[arg(short, long, default_value = "faderlink.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serial port, overrides the config file
    #[arg(short, long, env = "FADERLINK_PORT")]
    port: Option<String>,

    /// Baud rate, overrides the config file
    #[arg(short, long)]
    baud: Option<u32>,

    /// Use an in-memory echoing device instead of a serial port
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    ListPorts,
    /// Print every frame seen on the port
    Sniff,
    /// Move one fader and report how it went
    Move {
        #[arg(short, long)]
        fader: u8,
        /// Target progression (0-100)
        #[arg(short, long)]
        to: f64,
        /// Speed (0-100], defaults to the medium preset
        #[arg(short, long)]
        speed: Option<f64>,
    },
    /// Run the advanced calibration and print the results as JSON
    Calibrate {
        /// Faders to calibrate, defaults to all
        #[arg(short, long, value_delimiter = ',')]
        faders: Vec<u8>,
    },
    /// Connect, start and log events until Ctrl+C
    Run {
        /// Also print wire-level traffic
        #[arg(long)]
        sniff: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    if let Command::ListPorts = args.command {
        sniffer::list_ports_formatted();
        return Ok(());
    }

    let config = load_config(&args).await?;
    let mock = args.mock.then(MockPort::echoing);
    let opener: Arc<dyn PortOpener> = match &mock {
        Some(port) => Arc::new(port.clone()),
        None => Arc::new(SystemPortOpener),
    };

    match args.command {
        Command::ListPorts => Ok(()),
        Command::Sniff => sniffer::run_cli_sniffer(config.serial.settings(), opener).await,
        Command::Move { fader, to, speed } => {
            let controller = connect(config, opener, mock.as_ref()).await?;
            let speed = speed.unwrap_or_else(|| controller.config().medium_speed());
            let fader_move = FaderMove::single(fader, to, speed)?;
            let report = controller.move_faders(&fader_move, true, false).await;
            controller.close();
            let report = report?;
            for channel in &report.channels {
                println!(
                    "fader {}: {}/{} step(s) completed ({} confirmed) in {:?}",
                    channel.index,
                    channel.steps_completed,
                    channel.steps_queued,
                    channel.steps_confirmed,
                    channel.duration
                );
            }
            Ok(())
        }
        Command::Calibrate { faders } => {
            let controller = connect(config, opener, mock.as_ref()).await?;
            let indexes = if faders.is_empty() {
                controller.fader_indexes()
            } else {
                faders
            };
            let results = controller.run_calibration(&indexes).await;
            controller.stop().await;
            let results = results?;
            println!(
                "{}",
                serde_json::to_string_pretty(&results).context("Failed to serialize calibration")?
            );
            Ok(())
        }
        Command::Run { sniff } => {
            let controller = connect(config, opener, mock.as_ref()).await?;
            run_app(controller, sniff, shutdown_signal()).await
        }
    }
}

async fn load_config(args: &Args) -> Result<ControllerConfig> {
    let mut config = if Path::new(&args.config).exists() {
        let config = ControllerConfig::load(&args.config).await?;
        info!("Configuration loaded from {}", args.config);
        config
    } else {
        info!("No configuration at {}, using defaults", args.config);
        ControllerConfig::default()
    };

    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if args.mock {
        config.serial.port = "mock".to_string();
    }
    config.validate()?;
    Ok(config)
}

/// Build a controller and bring it to running
async fn connect(
    config: ControllerConfig,
    opener: Arc<dyn PortOpener>,
    mock: Option<&MockPort>,
) -> Result<FaderController> {
    let port = config.serial.port.clone();
    let controller = FaderController::with_opener(config, opener)?;
    controller
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", port))?;

    if let Some(mock) = mock {
        mock.signal_ready();
    }
    controller.start().await.context("Device did not become ready")?;
    info!("Controller running on {}", port);
    Ok(controller)
}

async fn run_app(
    controller: FaderController,
    sniff: bool,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let filter = if sniff { EventFilter::All } else { EventFilter::Public };
    let port = controller.config().serial.port.clone();
    let start_time = Instant::now();

    controller.events().subscribe(filter, move |event| match event {
        FaderEvent::MidiIn(_) | FaderEvent::MidiOut(_) => {
            let elapsed = start_time.elapsed().as_millis() as u64;
            if let Some(line) = SnifferEvent::from_fader_event(event, elapsed, &port) {
                sniffer::print_event(&line);
            }
        }
        FaderEvent::Error(e) => warn!("[{}] {}", e.code(), e),
        FaderEvent::Touch(info) | FaderEvent::Untouch(info) | FaderEvent::Move(info) => {
            info!("{} fader {} at {:.1}%", event.name(), info.index, info.progression)
        }
        other => info!("{}", other.name()),
    });

    shutdown.await;

    controller.stop().await;
    info!("faderlink shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
