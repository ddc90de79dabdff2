//! Installation handle - the surface the dashboard talks to.
//!
//! Wires the subsystems together once and owns them until `shutdown()`:
//!
//! ```text
//! ConnectionManager ─[MQTTMessage]→ dispatch task → MessageRouter → StateProjector
//!        │                                               ▲                │
//!        └─[ConnectionState]→ status task ───────────────┼────────────────┘ (mqtt_online)
//!                                                        │
//!                                 CommandEmitter ────────┘ publish
//! ```
//!
//! The dispatch task is the only writer of the snapshot. Every operation
//! here reports failures as data (snapshot and metrics fields) and never
//! returns an error.

use crate::command::{ArtworkAction, CommandEmitter, ThresholdKind};
use crate::mqtt::config::MqttConfig;
use crate::mqtt::message_manager::MQTTMessage;
use crate::mqtt::metrics::{ConnectionMetrics, MetricsCollector};
use crate::mqtt::mqtt_handler::{ConnectionManager, ConnectionState};
use crate::mqtt::router::{Handler, MessageRouter};
use crate::mqtt::topics::TopicName;
use crate::projection::{SignalChange, Snapshot, StateProjector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MANUAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct Installation {
    connection: Arc<ConnectionManager>,
    router: Arc<MessageRouter>,
    projector: Arc<StateProjector>,
    metrics: MetricsCollector,
    commands: CommandEmitter,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Installation {
    /// Builds every component and spawns the dispatch and status tasks.
    /// Must be called from within a tokio runtime. Does not connect.
    pub fn init(config: MqttConfig) -> Self {
        info!("Initializing installation core");
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));

        let connection = ConnectionManager::new(config, inbound_tx);
        let router = Arc::new(MessageRouter::new(connection.clone()));
        let projector = Arc::new(StateProjector::new());
        projector.install(&router);
        router.on_message(
            TopicName::ArtworkAlert.topic(),
            Handler::raw(|payload| warn!("Installation alert: {}", payload.to_text())),
        );

        let metrics = MetricsCollector::new(connection.clone());
        let commands = CommandEmitter::new(router.clone());
        let shutdown = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(run_dispatch(
                inbound_rx,
                router.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_status(
                connection.subscribe_status(),
                projector.clone(),
                shutdown.clone(),
            )),
        ];

        Self {
            connection,
            router,
            projector,
            metrics,
            commands,
            shutdown,
            tasks,
        }
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Drops the current session and opens a fresh one after a short pause.
    pub async fn reconnect(&self) {
        info!("Manual reconnect requested");
        self.connection.disconnect();
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(MANUAL_RECONNECT_DELAY) => self.connection.connect(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.projector.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.projector.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<SignalChange> {
        self.projector.subscribe_changes()
    }

    /// Every inbound message, for debug views
    pub fn subscribe_messages(&self) -> broadcast::Receiver<MQTTMessage> {
        self.router.subscribe_monitor()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_status()
    }

    pub fn start_artwork(&self) {
        self.commands.control_artwork(ArtworkAction::Start);
    }

    pub fn stop_artwork(&self) {
        self.commands.control_artwork(ArtworkAction::Stop);
    }

    pub fn publish_threshold(&self, kind: ThresholdKind, value: f64) {
        self.commands.set_threshold(kind, value);
    }

    pub fn commands(&self) -> &CommandEmitter {
        &self.commands
    }

    pub fn connection_metrics(&self) -> ConnectionMetrics {
        self.metrics.collect()
    }

    pub fn connection_status(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Disconnects and stops the background tasks.
    pub async fn shutdown(self) {
        info!("Shutting down installation core");
        self.connection.disconnect();
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

async fn run_dispatch(
    mut inbound: mpsc::Receiver<MQTTMessage>,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) {
    debug!("Dispatch task started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => router.dispatch(message),
                None => break,
            },
        }
    }
    debug!("Dispatch task stopped");
}

async fn run_status(
    mut status: watch::Receiver<ConnectionState>,
    projector: Arc<StateProjector>,
    shutdown: CancellationToken,
) {
    projector.set_online(*status.borrow_and_update() == ConnectionState::Connected);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *status.borrow_and_update();
                projector.set_online(state == ConnectionState::Connected);
            }
        }
    }
    debug!("Status task stopped");
}
