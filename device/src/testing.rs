//! Mock collaborators for exercising the pipeline without hardware, a
//! broker, or a network.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Semaphore;

use crate::broker::{BrokerConnector, BrokerSession, DisconnectSignal};
use crate::config::{ConfigureRequest, QosLevel, TrackerConfig};
use crate::controller::{AgentController, ControllerOptions};
use crate::error::{ConnectError, PublishError, SensorError};
use crate::net::ReachabilityProbe;
use crate::sensor::SensorSource;
use crate::storage::{QueueStore, SqliteStore};
use crate::types::{AgentEvent, EventSink, PositionFix, QueuedPayload, StatusEvent};

/// Sensor returning a slowly moving fix and 75% battery.
#[derive(Debug, Default)]
pub struct MockSensor {
    disabled: AtomicBool,
    battery_fails: AtomicBool,
    reads: AtomicUsize,
    position_delay: Mutex<Duration>,
    battery_delay: Mutex<Duration>,
    service_delay: Mutex<Duration>,
}

impl MockSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::SeqCst);
    }

    pub fn set_battery_fails(&self, fails: bool) {
        self.battery_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_position_delay(&self, delay: Duration) {
        set_delay(&self.position_delay, delay);
    }

    pub fn set_battery_delay(&self, delay: Duration) {
        set_delay(&self.battery_delay, delay);
    }

    /// Delays the service check, standing in for a location stack that hangs.
    pub fn set_service_delay(&self, delay: Duration) {
        set_delay(&self.service_delay, delay);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorSource for MockSensor {
    async fn service_enabled(&self) -> bool {
        wait(&self.service_delay).await;
        !self.disabled.load(Ordering::SeqCst)
    }

    async fn position(&self) -> Result<PositionFix, SensorError> {
        wait(&self.position_delay).await;
        let n = self.reads.fetch_add(1, Ordering::SeqCst) as f64;
        Ok(PositionFix {
            latitude: 40.0 + n * 0.001,
            longitude: -74.0,
            accuracy: 5.0,
            speed: 3.5,
            bearing: 90.0,
        })
    }

    async fn battery(&self) -> Result<u8, SensorError> {
        wait(&self.battery_delay).await;
        if self.battery_fails.load(Ordering::SeqCst) {
            return Err(SensorError::Read("battery service unavailable".to_string()));
        }
        Ok(75)
    }
}

fn set_delay(slot: &Mutex<Duration>, delay: Duration) {
    if let Ok(mut guard) = slot.lock() {
        *guard = delay;
    }
}

async fn wait(slot: &Mutex<Duration>) {
    let delay = slot.lock().map(|d| *d).unwrap_or_default();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Session recording every publish. Can be told to start failing after a
/// number of successful publishes.
#[derive(Debug, Default)]
pub struct MockSession {
    published: Mutex<Vec<(String, QosLevel, Vec<u8>)>>,
    fail_after: Mutex<Option<usize>>,
    acks_lost: AtomicBool,
    closed: AtomicBool,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `n` more publishes succeed, then fails every publish.
    pub fn fail_after(&self, n: usize) {
        let already = self.published.lock().map(|p| p.len()).unwrap_or(0);
        if let Ok(mut guard) = self.fail_after.lock() {
            *guard = Some(already + n);
        }
    }

    pub fn recover(&self) {
        if let Ok(mut guard) = self.fail_after.lock() {
            *guard = None;
        }
        self.acks_lost.store(false, Ordering::SeqCst);
    }

    /// Publishes still reach the wire but the transport drops before the
    /// broker acknowledges them.
    pub fn lose_acks(&self) {
        self.acks_lost.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, QosLevel, Vec<u8>)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn published_payloads(&self) -> Vec<QueuedPayload> {
        self.published()
            .iter()
            .filter_map(|(_, _, body)| serde_json::from_slice(body).ok())
            .collect()
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::NotConnected);
        }
        let limit = self.fail_after.lock().map(|g| *g).unwrap_or(None);
        let mut published = self
            .published
            .lock()
            .map_err(|_| PublishError::Client("mock poisoned".to_string()))?;
        if limit.is_some_and(|limit| published.len() >= limit) {
            return Err(PublishError::Client("mock publish failure".to_string()));
        }
        published.push((topic.to_string(), qos, payload));
        if self.acks_lost.load(Ordering::SeqCst) {
            return Err(PublishError::Unacknowledged);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail(String),
}

/// Holds connect attempts until released, one permit per attempt.
#[derive(Debug, Clone)]
pub struct ConnectGate {
    permits: Arc<Semaphore>,
}

impl ConnectGate {
    pub fn release(&self, attempts: usize) {
        self.permits.add_permits(attempts);
    }
}

#[derive(Debug)]
struct ConnectorInner {
    behavior: Mutex<ConnectBehavior>,
    gate: Mutex<Option<ConnectGate>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    signals: Mutex<Vec<Option<DisconnectSignal>>>,
    configs: Mutex<Vec<TrackerConfig>>,
}

/// Connector handing out `MockSession`s. Clones share state.
#[derive(Debug, Clone)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        MockConnector {
            inner: Arc::new(ConnectorInner {
                behavior: Mutex::new(ConnectBehavior::Succeed),
                gate: Mutex::new(None),
                sessions: Mutex::new(Vec::new()),
                signals: Mutex::new(Vec::new()),
                configs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        if let Ok(mut guard) = self.inner.behavior.lock() {
            *guard = behavior;
        }
    }

    /// Makes every following connect wait for a `ConnectGate::release`.
    pub fn hold_connects(&self) -> ConnectGate {
        let gate = ConnectGate {
            permits: Arc::new(Semaphore::new(0)),
        };
        if let Ok(mut guard) = self.inner.gate.lock() {
            *guard = Some(gate.clone());
        }
        gate
    }

    pub fn connect_count(&self) -> usize {
        self.inner.configs.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn connected_configs(&self) -> Vec<TrackerConfig> {
        self.inner.configs.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.inner.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Fires the transport drop callback of the `index`th session.
    pub fn drop_connection(&self, index: usize, reason: &str) {
        let signal = self
            .inner
            .signals
            .lock()
            .ok()
            .and_then(|mut signals| signals.get_mut(index).and_then(Option::take));
        if let Some(signal) = signal {
            signal.fire(reason);
        }
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(
        &self,
        config: &TrackerConfig,
        on_drop: DisconnectSignal,
    ) -> Result<Arc<dyn BrokerSession>, ConnectError> {
        if let Ok(mut configs) = self.inner.configs.lock() {
            configs.push(config.clone());
        }

        let gate = self.inner.gate.lock().ok().and_then(|g| g.clone());
        if let Some(gate) = gate {
            let permit = gate
                .permits
                .acquire()
                .await
                .map_err(|_| ConnectError::Aborted)?;
            permit.forget();
        }

        let behavior = self
            .inner
            .behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(ConnectBehavior::Succeed);
        if let ConnectBehavior::Fail(reason) = behavior {
            return Err(ConnectError::Rejected(reason));
        }

        let session = Arc::new(MockSession::new());
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.push(session.clone());
        }
        if let Ok(mut signals) = self.inner.signals.lock() {
            signals.push(Some(on_drop));
        }
        Ok(session as Arc<dyn BrokerSession>)
    }
}

/// Reachability probe with a settable answer.
#[derive(Debug)]
pub struct StaticProbe {
    reachable: AtomicBool,
}

impl StaticProbe {
    pub fn new(reachable: bool) -> Self {
        StaticProbe {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// A configure request pointing at a test broker.
pub fn configure_request(topic: &str) -> ConfigureRequest {
    ConfigureRequest {
        device_id: Some("test-device".to_string()),
        user: Some("tester".to_string()),
        broker: Some("broker.test".to_string()),
        topic: Some(topic.to_string()),
        interval_seconds: Some(10),
        ..Default::default()
    }
}

/// Controller wired to mocks and an in-memory queue, with handles to
/// every mock and the event receiver.
pub struct Harness {
    pub controller: AgentController,
    pub connector: MockConnector,
    pub sensor: Arc<MockSensor>,
    pub probe: Arc<StaticProbe>,
    pub events: UnboundedReceiver<AgentEvent>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(ControllerOptions::default())
    }

    pub fn with_options(options: ControllerOptions) -> Self {
        let store = SqliteStore::open_in_memory().expect("in-memory sqlite");
        Self::with_queue(QueueStore::new(Box::new(store)), options)
    }

    pub fn with_queue(queue: QueueStore, options: ControllerOptions) -> Self {
        let connector = MockConnector::new();
        let sensor = Arc::new(MockSensor::new());
        let probe = Arc::new(StaticProbe::new(true));
        let (sink, events) = EventSink::channel();

        let controller = AgentController::new(
            sensor.clone(),
            Arc::new(connector.clone()),
            probe.clone(),
            queue,
            sink,
            options,
        );

        Harness {
            controller,
            connector,
            sensor,
            probe,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Drains pending events, keeping only status events.
    pub fn statuses(&mut self) -> Vec<StatusEvent> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                AgentEvent::Status(status) => Some(status),
                AgentEvent::LastPayload(_) => None,
            })
            .collect()
    }
}
