use clap::Parser;
use color_eyre::Result;
use sala_monitor::{ConnectionState, Installation, MqttConfig, Snapshot};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Monitors the room installation over MQTT and optionally sends commands.
#[derive(Parser, Debug, Default)]
#[command(name = "sala-monitor", version, about)]
struct Cli {
    /// Start the artwork once connected
    #[arg(long, conflicts_with = "stop")]
    start: bool,

    /// Stop the artwork once connected
    #[arg(long)]
    stop: bool,

    /// Publish a set of sample sensor readings once connected
    #[arg(long)]
    simulate: bool,
}

impl Cli {
    fn wants_commands(&self) -> bool {
        self.start || self.stop || self.simulate
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let config = MqttConfig::load()?;
    let connect_timeout = config.connect_timeout();

    let installation = Installation::init(config);
    installation.connect();

    if cli.wants_commands() {
        send_commands(&installation, &cli, connect_timeout).await;
    }

    monitor(&installation).await;
    installation.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Waits for the first connection, then issues the requested commands once.
async fn send_commands(installation: &Installation, cli: &Cli, timeout: Duration) {
    let mut status = installation.subscribe_status();
    let connected = time::timeout(
        timeout,
        status.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .map(|result| result.is_ok())
    .unwrap_or(false);
    if !connected {
        warn!("Broker not reachable, commands not sent");
        return;
    }

    if cli.simulate {
        installation.commands().publish_sample_readings();
    }
    if cli.start {
        installation.start_artwork();
    }
    if cli.stop {
        installation.stop_artwork();
    }
}

/// Logs changes, alerts and periodic metrics until Ctrl-C.
async fn monitor(installation: &Installation) {
    let mut changes = installation.subscribe_changes();
    let mut snapshots = installation.subscribe();
    let mut messages = installation.subscribe_messages();
    let mut metrics_tick = time::interval(METRICS_INTERVAL);
    let mut alerts = installation.snapshot().alerts();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
            _ = metrics_tick.tick() => {
                info!("MQTT {}", installation.connection_metrics());
            }
            change = changes.recv() => match change {
                Ok(change) => debug!("{:?} updated at {}", change.signal, change.at),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} change notifications", skipped),
                Err(RecvError::Closed) => break,
            },
            message = messages.recv() => match message {
                Ok(message) => debug!("{}", message.render()),
                Err(RecvError::Lagged(skipped)) => debug!("Missed {} monitored messages", skipped),
                Err(RecvError::Closed) => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let current = snapshot.alerts();
                if current != alerts {
                    report_alerts(&snapshot);
                    alerts = current;
                }
            }
        }
    }
}

fn report_alerts(snapshot: &Snapshot) {
    let alerts = snapshot.alerts();
    if !alerts.any() {
        info!("All readings back within thresholds");
        return;
    }
    if alerts.temperature {
        warn!(
            "Temperature {} outside [{}, {}]",
            snapshot.temperature, snapshot.temp_min, snapshot.temp_max
        );
    }
    if alerts.humidity {
        warn!(
            "Humidity {} outside [{}, {}]",
            snapshot.humidity, snapshot.hum_min, snapshot.hum_max
        );
    }
}
