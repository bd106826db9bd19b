use anyhow::Result;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use tracker_device::broker::MqttConnector;
use tracker_device::logging::{init_logging, LogFormat};
use tracker_device::net::HttpProbe;
use tracker_device::simulate::SimulatedSensor;
use tracker_device::storage::{QueueStore, SqliteStore};
use tracker_device::{
    AgentController, AgentEvent, AgentSettings, Command, ControllerOptions, EventSink,
};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AgentSettings::from_env();
    init_logging(&settings.log_level, LogFormat::parse(&settings.log_format));
    info!(
        device_id = %settings.device_id,
        store = %settings.store_path.display(),
        "Tracker agent starting"
    );

    let store = SqliteStore::open(&settings.store_path)?;
    let queue = QueueStore::new(Box::new(store));
    info!(pending = queue.len(), "Opened offline queue");

    let (events, mut event_rx) = EventSink::channel();
    let mut controller = AgentController::new(
        Arc::new(SimulatedSensor::new(52.520008, 13.404954)),
        Arc::new(MqttConnector::new(Duration::from_secs(settings.publish_timeout_secs))),
        Arc::new(HttpProbe::new(
            settings.probe_url.clone(),
            Duration::from_secs(settings.probe_timeout_secs),
        )),
        queue,
        events,
        ControllerOptions::from_settings(&settings),
    );
    controller.resume_saved().await;

    // Events go out as one JSON object per line on stdout.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = write_event(&mut stdout, &event).await {
                error!(error = %e, "Failed to write event");
            }
        }
    });

    let (command_tx, command_rx) = mpsc::channel::<Command>(32);
    spawn_command_reader(command_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    controller.run(command_rx, shutdown_rx).await;
    signal.abort();

    // the event sink went away with the controller, so the writer drains and ends
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    info!("Tracker agent stopped");
    Ok(())
}

/// Reads newline-delimited JSON commands from stdin on a plain thread, so a
/// pending read never holds up runtime shutdown. EOF closes the channel.
fn spawn_command_reader(tx: mpsc::Sender<Command>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to read command input");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Command>(&line) {
                Ok(command) => {
                    if tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed command"),
            }
        }
        info!("Command input closed");
    });
}

async fn write_event(stdout: &mut tokio::io::Stdout, event: &AgentEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
