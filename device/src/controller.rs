//! Top-level agent state machine.
//!
//! `Idle --configure--> Active --stop--> Idle`. The controller owns the
//! active configuration, the ticker, the connection manager and the offline
//! queue, and is driven from a single task: commands, connection events and
//! ticks are handled one at a time, so none of them race each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerConnector;
use crate::config::{AgentSettings, ConfigureRequest, TrackerConfig};
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionOutcome, ConnectionState};
use crate::error::ConfigError;
use crate::flush::{flush, FlushReport};
use crate::net::ReachabilityProbe;
use crate::scheduler::Ticker;
use crate::sensor::{SampleProducer, SensorSource};
use crate::storage::QueueStore;
use crate::types::{Command, EventSink, QueuedPayload, StatusEvent, StatusKind};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Used when a configure request carries no device id.
    pub default_device_id: String,
    pub connect_timeout: Duration,
    pub sensor_timeout: Duration,
    /// Pause before redialling after a transport drop.
    pub reconnect_delay: Duration,
    /// Where the active configuration is kept for resuming after a restart.
    pub config_file: Option<PathBuf>,
}

impl ControllerOptions {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        ControllerOptions {
            default_device_id: settings.device_id.clone(),
            connect_timeout: settings.connect_timeout(),
            sensor_timeout: Duration::from_secs(settings.sensor_timeout_secs),
            reconnect_delay: settings.reconnect_delay(),
            config_file: Some(settings.config_file_path()),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        ControllerOptions {
            default_device_id: "device".to_string(),
            connect_timeout: Duration::from_secs(10),
            sensor_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::ZERO,
            config_file: None,
        }
    }
}

pub struct AgentController {
    producer: SampleProducer,
    probe: Arc<dyn ReachabilityProbe>,
    queue: QueueStore,
    conn: ConnectionManager,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ticker: Ticker,
    config: Option<Arc<TrackerConfig>>,
    events: EventSink,
    options: ControllerOptions,
}

impl AgentController {
    pub fn new(
        sensor: Arc<dyn SensorSource>,
        connector: Arc<dyn BrokerConnector>,
        probe: Arc<dyn ReachabilityProbe>,
        queue: QueueStore,
        events: EventSink,
        options: ControllerOptions,
    ) -> Self {
        let (conn, conn_rx) = ConnectionManager::new(connector, options.connect_timeout);
        AgentController {
            producer: SampleProducer::new(sensor, options.sensor_timeout),
            probe,
            queue,
            conn,
            conn_rx,
            ticker: Ticker::new(),
            config: None,
            events,
            options,
        }
    }

    pub fn active_config(&self) -> Option<&TrackerConfig> {
        self.config.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.config.is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn epoch(&self) -> u64 {
        self.conn.epoch()
    }

    pub fn ticker_armed(&self) -> bool {
        self.ticker.is_armed()
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    /// Drives the agent until the command channel closes or `shutdown`
    /// flips. Either way the activation is torn down but its saved
    /// configuration is kept.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Agent controller running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown requested");
                    self.shutdown().await;
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("Command channel closed, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.conn_rx.recv() => self.handle_connection_event(event).await,
                _ = self.ticker.next() => self.tick().await,
            }
        }
    }

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Configure(request) => {
                if let Err(e) = self.configure(request).await {
                    debug!(error = %e, "Configure command ignored");
                }
            }
            Command::Stop => self.stop().await,
        }
    }

    /// Validates `request` and activates it. An invalid request leaves the
    /// current activation untouched.
    pub async fn configure(&mut self, request: ConfigureRequest) -> Result<(), ConfigError> {
        match TrackerConfig::from_request(request, &self.options.default_device_id) {
            Ok(config) => {
                self.activate(config).await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Rejected configuration");
                self.events
                    .status(StatusEvent::new(StatusKind::InvalidConfig).with_error(&e));
                Err(e)
            }
        }
    }

    /// Reactivates the configuration saved by a previous run, if any.
    pub async fn resume_saved(&mut self) -> bool {
        let Some(path) = self.options.config_file.clone() else {
            return false;
        };
        match TrackerConfig::load_from_file(&path) {
            Ok(Some(config)) => {
                info!(
                    path = %path.display(),
                    topic = %config.topic,
                    "Resuming saved configuration"
                );
                self.activate(config).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "Ignoring unreadable saved configuration"
                );
                false
            }
        }
    }

    async fn activate(&mut self, config: TrackerConfig) {
        if self.config.is_some() {
            self.teardown().await;
        }

        let config = Arc::new(config);
        self.persist(&config);

        let epoch = self.conn.advance_epoch();
        self.conn.enable_reconnect();
        self.config = Some(config.clone());

        info!(
            epoch,
            device_id = %config.device_id,
            broker = %config.broker,
            port = config.port,
            topic = %config.topic,
            interval_secs = config.interval_seconds,
            "Tracking started"
        );
        self.events
            .status(StatusEvent::new(StatusKind::Started).with_topic(config.topic.clone()));

        self.tick().await;
        self.ticker.arm(config.interval());
    }

    /// Stops tracking and forgets the saved configuration. Calling it while
    /// idle is harmless.
    pub async fn stop(&mut self) {
        self.teardown().await;
        if let Some(path) = &self.options.config_file {
            if let Err(e) = TrackerConfig::clear_file(path) {
                warn!(error = %e, "Failed to clear saved configuration");
            }
        }
    }

    /// Stops tracking but keeps the saved configuration, so the next start resumes.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.conn.disable_reconnect();
        self.ticker.cancel();
        self.conn.close().await;
        let previous = self.config.take();
        let epoch = self.conn.advance_epoch();

        if let Some(config) = previous {
            info!(epoch, topic = %config.topic, "Tracking stopped");
        }
        self.events.status(StatusEvent::new(StatusKind::Stopped));
    }

    fn persist(&self, config: &TrackerConfig) {
        if let Some(path) = &self.options.config_file {
            if let Err(e) = config.save_to_file(path) {
                warn!(error = %e, path = %path.display(), "Failed to save configuration");
            }
        }
    }

    /// One sample, enqueue, flush cycle.
    pub async fn tick(&mut self) {
        let Some(config) = self.config.clone() else {
            return;
        };

        if !self.conn.is_connected() && self.conn.ensure_connected(Some(&config), Duration::ZERO) {
            self.events
                .status(StatusEvent::new(StatusKind::Connecting).with_topic(config.topic.clone()));
        }

        let sample = match self.producer.capture(&config).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Sample capture failed, skipping tick");
                self.events
                    .status(StatusEvent::new(StatusKind::SensorError).with_error(&e));
                return;
            }
        };

        let payload = QueuedPayload::pending(sample);
        // provisional: sent_at stays null until a flush publishes it
        self.events.last_payload(payload.clone());

        // persisted before any publish attempt
        let pending = match self.queue.enqueue(payload) {
            Ok(len) => len,
            Err(e) => {
                error!(error = %e, "Failed to enqueue sample");
                self.events
                    .status(StatusEvent::new(StatusKind::StoreError).with_error(&e));
                return;
            }
        };

        if !self.is_online().await {
            info!(pending, "Offline, buffering sample");
            self.events.status(
                StatusEvent::new(StatusKind::Buffering)
                    .with_topic(config.topic.clone())
                    .with_pending(pending),
            );
            return;
        }

        self.flush_now(&config).await;
    }

    async fn is_online(&self) -> bool {
        self.conn.is_connected() && self.probe.is_reachable().await
    }

    async fn flush_now(&mut self, config: &TrackerConfig) -> Option<FlushReport> {
        let session = self.conn.session()?;
        match flush(&mut self.queue, session.as_ref(), config, &self.events).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Failed to rewrite queue after flush");
                self.events
                    .status(StatusEvent::new(StatusKind::StoreError).with_error(&e));
                None
            }
        }
    }

    pub async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match self.conn.handle_event(event).await {
            ConnectionOutcome::Adopted => {
                let Some(config) = self.config.clone() else {
                    return;
                };
                self.events.status(
                    StatusEvent::new(StatusKind::Connected).with_topic(config.topic.clone()),
                );
                // a failed flush leaves the queue for the next tick
                self.flush_now(&config).await;
            }
            ConnectionOutcome::Failed(reason) => {
                self.events
                    .status(StatusEvent::new(StatusKind::ConnectFailed).with_error(reason));
            }
            ConnectionOutcome::Lost { reason, reconnect } => {
                self.events
                    .status(StatusEvent::new(StatusKind::Disconnected).with_error(reason));
                if reconnect
                    && self
                        .conn
                        .ensure_connected(self.config.as_ref(), self.options.reconnect_delay)
                {
                    self.events.status(StatusEvent::new(StatusKind::Connecting));
                }
            }
            ConnectionOutcome::Discarded | ConnectionOutcome::Ignored => {}
        }
    }

    /// Waits for the next connection event and applies it.
    pub async fn pump_connection_event(&mut self) -> bool {
        match self.conn_rx.recv().await {
            Some(event) => {
                self.handle_connection_event(event).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::KeyValueStore;
    use crate::testing::{configure_request, ConnectBehavior, Harness};
    use crate::types::AgentEvent;

    /// Store whose writes always fail.
    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn get_list(&self, _key: &str) -> Result<Option<Vec<String>>, StoreError> {
            Ok(None)
        }

        fn set_list(&mut self, _key: &str, _values: &[String]) -> Result<(), StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery))
        }
    }

    #[tokio::test]
    async fn test_configure_runs_immediate_tick_and_arms_ticker() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();

        assert!(h.controller.is_active());
        assert!(h.controller.ticker_armed());
        assert_eq!(h.sensor.reads(), 1);
        assert_eq!(h.controller.queue().len(), 1);

        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::LastPayload(p) if p.sent_at.is_none())));
    }

    #[tokio::test]
    async fn test_offline_ticks_report_growing_pending_counts() {
        let mut h = Harness::new();
        h.connector.set_behavior(ConnectBehavior::Fail("broker unreachable".to_string()));

        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.tick().await;
        h.controller.tick().await;

        let pending: Vec<usize> = h
            .statuses()
            .iter()
            .filter(|s| s.status == StatusKind::Buffering)
            .filter_map(|s| s.pending)
            .collect();
        assert_eq!(pending, vec![1, 2, 3]);
        assert_eq!(h.controller.queue().len(), 3);
    }

    #[tokio::test]
    async fn test_adoption_flushes_buffered_samples() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        assert_eq!(h.controller.queue().len(), 1);

        assert!(h.controller.pump_connection_event().await);
        assert_eq!(h.controller.connection_state(), ConnectionState::Connected);
        assert!(h.controller.queue().is_empty());

        let session = &h.connector.sessions()[0];
        let sent = session.published_payloads();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].sent_at.is_some());

        let statuses = h.statuses();
        assert!(statuses.iter().any(|s| s.status == StatusKind::Connected));
        assert!(statuses
            .iter()
            .any(|s| s.status == StatusKind::Drained && s.pending == Some(0)));
    }

    #[tokio::test]
    async fn test_connected_tick_publishes_immediately() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.pump_connection_event().await;
        h.drain_events();

        h.controller.tick().await;

        assert!(h.controller.queue().is_empty());
        assert_eq!(h.connector.sessions()[0].published().len(), 2);
        assert!(h
            .statuses()
            .iter()
            .any(|s| s.status == StatusKind::Drained && s.topic.as_deref() == Some("fleet/a")));
    }

    #[tokio::test]
    async fn test_unreachable_network_buffers_while_connected() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.pump_connection_event().await;
        h.probe.set(false);
        h.drain_events();

        h.controller.tick().await;

        assert_eq!(h.controller.queue().len(), 1);
        assert_eq!(h.connector.sessions()[0].published().len(), 1);
        let statuses = h.statuses();
        assert_eq!(statuses.last().unwrap().status, StatusKind::Buffering);
        assert_eq!(statuses.last().unwrap().pending, Some(1));
    }

    #[tokio::test]
    async fn test_sensor_failure_skips_enqueue() {
        let mut h = Harness::new();
        h.sensor.set_enabled(false);

        h.controller.configure(configure_request("fleet/a")).await.unwrap();

        assert!(h.controller.queue().is_empty());
        let statuses = h.statuses();
        let sensor_error = statuses
            .iter()
            .find(|s| s.status == StatusKind::SensorError)
            .unwrap();
        assert!(sensor_error.error.as_deref().unwrap().contains("disabled"));
        assert!(!statuses.iter().any(|s| s.status == StatusKind::Buffering));
    }

    #[tokio::test]
    async fn test_partial_flush_keeps_remainder() {
        let mut h = Harness::new();
        h.connector.set_behavior(ConnectBehavior::Fail("down".to_string()));
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.tick().await;
        h.controller.tick().await;
        // consume the failed attempt, then let the next one succeed
        h.controller.pump_connection_event().await;
        h.connector.set_behavior(ConnectBehavior::Succeed);

        h.controller.tick().await;
        h.controller.pump_connection_event().await;
        assert!(h.controller.queue().is_empty());
        assert_eq!(h.connector.sessions()[0].published().len(), 4);

        h.drain_events();
        h.connector.sessions()[0].fail_after(0);
        h.controller.tick().await;

        assert_eq!(h.controller.queue().len(), 1);
        let last = h.statuses().pop().unwrap();
        assert_eq!(last.status, StatusKind::Pending);
        assert_eq!(last.pending, Some(1));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.pump_connection_event().await;

        h.controller.stop().await;
        h.controller.stop().await;

        assert!(!h.controller.is_active());
        assert!(h.controller.active_config().is_none());
        assert!(!h.controller.ticker_armed());
        assert_eq!(h.controller.connection_state(), ConnectionState::Disconnected);
        assert!(h.connector.sessions()[0].is_closed());

        let stopped = h.statuses().iter().filter(|s| s.status == StatusKind::Stopped).count();
        assert_eq!(stopped, 2);
    }

    #[tokio::test]
    async fn test_tick_while_idle_does_nothing() {
        let mut h = Harness::new();
        h.controller.tick().await;
        assert_eq!(h.sensor.reads(), 0);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_connect_discards_late_connection() {
        let mut h = Harness::new();
        let gate = h.connector.hold_connects();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        let epoch = h.controller.epoch();

        h.controller.stop().await;
        assert!(h.controller.epoch() > epoch);
        gate.release(1);
        h.controller.pump_connection_event().await;

        assert_eq!(h.controller.connection_state(), ConnectionState::Disconnected);
        assert!(h.connector.sessions()[0].is_closed());
        assert!(!h.statuses().iter().any(|s| s.status == StatusKind::Connected));
    }

    #[tokio::test]
    async fn test_reconfigure_tears_down_previous_activation() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.pump_connection_event().await;
        let first_epoch = h.controller.epoch();

        h.controller.configure(configure_request("fleet/b")).await.unwrap();

        assert!(h.controller.epoch() > first_epoch);
        assert_eq!(h.controller.active_config().unwrap().topic, "fleet/b");
        assert!(h.connector.sessions()[0].is_closed());

        h.controller.pump_connection_event().await;
        assert_eq!(h.controller.connection_state(), ConnectionState::Connected);
        let configs = h.connector.connected_configs();
        assert_eq!(configs.last().unwrap().topic, "fleet/b");

        let kinds: Vec<StatusKind> = h.statuses().iter().map(|s| s.status).collect();
        let stopped = kinds.iter().position(|k| *k == StatusKind::Stopped).unwrap();
        let restarted = kinds.iter().rposition(|k| *k == StatusKind::Started).unwrap();
        assert!(stopped < restarted);
    }

    #[tokio::test]
    async fn test_transport_drop_triggers_reconnect() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.pump_connection_event().await;

        h.connector.drop_connection(0, "connection reset");
        h.controller.pump_connection_event().await;
        assert_ne!(h.controller.connection_state(), ConnectionState::Connected);

        h.controller.pump_connection_event().await;
        assert_eq!(h.controller.connection_state(), ConnectionState::Connected);
        assert_eq!(h.connector.connect_count(), 2);

        let statuses = h.statuses();
        let disconnected = statuses
            .iter()
            .find(|s| s.status == StatusKind::Disconnected)
            .unwrap();
        assert_eq!(disconnected.error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut h = Harness::new();
        h.connector.set_behavior(ConnectBehavior::Fail("not authorized".to_string()));
        h.controller.configure(configure_request("fleet/a")).await.unwrap();
        h.controller.pump_connection_event().await;

        let failed = h
            .statuses()
            .into_iter()
            .find(|s| s.status == StatusKind::ConnectFailed)
            .unwrap();
        assert!(failed.error.unwrap().contains("not authorized"));
        assert_eq!(h.controller.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_current_activation() {
        let mut h = Harness::new();
        h.controller.configure(configure_request("fleet/a")).await.unwrap();

        let mut bad = configure_request("fleet/b");
        bad.broker = None;
        assert!(h.controller.configure(bad).await.is_err());

        assert_eq!(h.controller.active_config().unwrap().topic, "fleet/a");
        assert!(h
            .statuses()
            .iter()
            .any(|s| s.status == StatusKind::InvalidConfig && s.error.is_some()));
    }

    #[tokio::test]
    async fn test_saved_config_resumes_and_stop_forgets_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker_config.json");
        let options = ControllerOptions {
            config_file: Some(path.clone()),
            ..Default::default()
        };

        let mut h = Harness::with_options(options.clone());
        h.controller.configure(configure_request("fleet/saved")).await.unwrap();
        h.controller.shutdown().await;
        assert!(path.exists());

        let mut resumed = Harness::with_options(options);
        assert!(resumed.controller.resume_saved().await);
        assert_eq!(resumed.controller.active_config().unwrap().topic, "fleet/saved");

        resumed.controller.stop().await;
        assert!(!path.exists());
        assert!(!resumed.controller.resume_saved().await);
    }

    #[tokio::test]
    async fn test_store_failure_still_reports_fresh_sample() {
        let queue = QueueStore::new(Box::new(ReadOnlyStore));
        let mut h = Harness::with_queue(queue, ControllerOptions::default());

        h.controller.configure(configure_request("fleet/a")).await.unwrap();

        let events = h.drain_events();
        let payload_at = events
            .iter()
            .position(|e| matches!(e, AgentEvent::LastPayload(p) if p.sent_at.is_none()))
            .expect("fresh sample announced");
        let store_error_at = events
            .iter()
            .position(|e| {
                matches!(e, AgentEvent::Status(s) if s.status == StatusKind::StoreError)
            })
            .expect("store error reported");
        assert!(payload_at < store_error_at);
        assert!(!events.iter().any(|e| {
            matches!(e, AgentEvent::Status(s) if s.status == StatusKind::Buffering)
        }));
    }

    #[tokio::test]
    async fn test_invalid_configure_command_is_reported_not_applied() {
        let mut h = Harness::new();
        h.controller
            .handle_command(Command::Configure(configure_request("fleet/a")))
            .await;

        let mut bad = configure_request("fleet/b");
        bad.interval_seconds = Some(0);
        h.controller.handle_command(Command::Configure(bad)).await;

        assert_eq!(h.controller.active_config().unwrap().topic, "fleet/a");
        let invalid = h
            .statuses()
            .into_iter()
            .find(|s| s.status == StatusKind::InvalidConfig)
            .unwrap();
        assert!(invalid.error.unwrap().contains("interval"));
    }
}
