use anyhow::Context;
use clap::Parser;
use printerlink::{
    default_config_path, init_logging, Config, EngineConfig, PositionSample, PrinterCommunicator,
    PrinterListener, PrinterStatus, TemperatureSample,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Interval between M105 polls
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Connect to a printer, log what it reports and forward typed commands
#[derive(Parser, Debug)]
#[command(name = "printerlink", version, about)]
struct Args {
    /// Serial port, or "Auto"
    #[arg(short, long, env = "PRINTERLINK_PORT")]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unacknowledged lines allowed in flight
    #[arg(short, long)]
    window: Option<usize>,
}

struct LogListener;

impl PrinterListener for LogListener {
    fn on_state_change(&self, status: &PrinterStatus) {
        match &status.error_message {
            Some(message) => tracing::info!("State: {} ({})", status.state, message),
            None => tracing::info!("State: {}", status.state),
        }
    }

    fn on_temperature_update(&self, sample: &TemperatureSample) {
        let tools: Vec<String> = sample
            .tools
            .iter()
            .map(|(name, t)| format!("{} {:.1}/{:.1}", name, t.actual, t.target))
            .collect();
        match sample.bed {
            Some(bed) => tracing::info!(
                "Temperature: {} bed {:.1}/{:.1}",
                tools.join(" "),
                bed.actual,
                bed.target
            ),
            None => tracing::info!("Temperature: {}", tools.join(" ")),
        }
    }

    fn on_position_update(&self, position: &PositionSample) {
        tracing::info!("Position: {}", position);
    }

    fn on_response(&self, line: &str) {
        tracing::info!("< {}", line);
    }

    fn on_error(&self, message: &str) {
        tracing::error!("Printer error: {}", message);
    }
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut settings = Config::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(window) = args.window {
        settings.transmission.window_size = window;
    }
    settings.validate()?;
    Ok(EngineConfig::from(&settings))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = Args::parse();
    tracing::info!("PrinterLink {} ({})", printerlink::VERSION, printerlink::BUILD_DATE);

    let config = load_config(&args)?;
    let communicator = Arc::new(PrinterCommunicator::new(config));
    communicator.add_listener(Arc::new(LogListener));

    let connecting = communicator.clone();
    let port = args.port.clone();
    tokio::task::spawn_blocking(move || connecting.connect(port.as_deref(), args.baud))
        .await??;
    tracing::info!(
        "Connected on {} ({:?} mode)",
        communicator.port().unwrap_or_default(),
        communicator.link_mode()
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = communicator.send_command(line, false) {
                    tracing::warn!("Could not send {}: {}", line, e);
                }
            }
            _ = poll.tick() => {
                if communicator.is_connected() {
                    if let Err(e) = communicator.send_command("M105", false) {
                        tracing::warn!("Temperature poll failed: {}", e);
                    }
                }
            }
        }
    }

    let closing = communicator.clone();
    tokio::task::spawn_blocking(move || closing.disconnect()).await?;
    Ok(())
}
