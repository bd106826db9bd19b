//! Broker client seam and its MQTT binding.
//!
//! `BrokerConnector` dials one session per connect attempt. The session
//! reports a transport drop exactly once through the `DisconnectSignal`
//! handed to `connect`; a deliberate `close()` reports nothing.
//!
//! A publish only succeeds once the broker has acknowledged it (PUBACK for
//! QoS 1, PUBCOMP for QoS 2). Each connect starts a clean session, so
//! anything unacknowledged when the transport drops is gone with it and
//! must stay in the caller's queue.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{QosLevel, TrackerConfig};
use crate::error::{ConnectError, PublishError};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_millis(500);
const REQUEST_CAPACITY: usize = 64;

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        payload: Vec<u8>,
    ) -> Result<(), PublishError>;

    /// Tears the session down. Safe to call more than once.
    async fn close(&self);
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        config: &TrackerConfig,
        on_drop: DisconnectSignal,
    ) -> Result<Arc<dyn BrokerSession>, ConnectError>;
}

/// One-shot transport drop notification. Dropping it unfired means the
/// session went away deliberately.
#[derive(Debug)]
pub struct DisconnectSignal {
    tx: oneshot::Sender<String>,
}

impl DisconnectSignal {
    pub fn pair() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (DisconnectSignal { tx }, rx)
    }

    pub fn fire(self, reason: impl Into<String>) {
        let _ = self.tx.send(reason.into());
    }
}

pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Clean session, keep-alive, optional credentials and an "offline" last
/// will on `<topic>/status`.
pub fn build_options(config: &TrackerConfig) -> Result<MqttOptions, ConnectError> {
    if config.client_id.is_empty() || config.client_id.starts_with(' ') {
        return Err(ConnectError::InvalidOptions(format!(
            "invalid client id {:?}",
            config.client_id
        )));
    }
    if config.broker.is_empty() {
        return Err(ConnectError::InvalidOptions("empty broker host".to_string()));
    }

    let mut options =
        MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    let will = json!({ "device_id": config.device_id, "status": "offline" });
    options.set_last_will(LastWill::new(
        format!("{}/status", config.topic),
        will.to_string(),
        to_mqtt_qos(config.qos),
        false,
    ));

    Ok(options)
}

pub struct MqttConnector {
    publish_timeout: Duration,
}

impl MqttConnector {
    pub fn new(publish_timeout: Duration) -> Self {
        MqttConnector { publish_timeout }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(
        &self,
        config: &TrackerConfig,
        on_drop: DisconnectSignal,
    ) -> Result<Arc<dyn BrokerSession>, ConnectError> {
        let options = build_options(config)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        // Only a ConnAck counts as connected; anything before it is handshake noise.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(ConnectError::Rejected(format!("{:?}", ack.code)));
                }
                Ok(event) => debug!(?event, "MQTT handshake event"),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(ConnectError::Rejected(format!("{code:?}")));
                }
                Err(e) => return Err(ConnectError::Transport(e.to_string())),
            }
        }

        info!(
            broker = %config.broker,
            port = config.port,
            client_id = %config.client_id,
            "MQTT session established"
        );

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive_event_loop(eventloop, delivery_tx, on_drop));
        Ok(Arc::new(MqttSession {
            client,
            driver: Mutex::new(Some(driver)),
            deliveries: tokio::sync::Mutex::new(DeliveryTracker::new(delivery_rx)),
            publish_timeout: self.publish_timeout,
        }))
    }
}

/// Publish progress reported by the event loop driver, keyed by packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent(u16),
    Acked(u16),
    Completed(u16),
}

/// Matches publish requests to the broker's acknowledgements.
///
/// rumqttc writes requests in order, so the packet id of a request is the
/// one on the `Sent` event that follows every earlier request still
/// waiting to go out. Requests abandoned by a timed-out publish stay
/// counted in `unsent` and their acks are ignored.
#[derive(Debug)]
pub struct DeliveryTracker {
    rx: mpsc::UnboundedReceiver<Delivery>,
    unsent: usize,
}

impl DeliveryTracker {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        DeliveryTracker { rx, unsent: 0 }
    }

    /// Records that one more publish request was handed to the client.
    pub fn note_queued(&mut self) {
        self.unsent += 1;
    }

    /// Waits for the broker to confirm the most recently queued request. A
    /// closed channel means the driver stopped and the packet is lost.
    pub async fn await_ack(&mut self, qos: QosLevel) -> Result<(), PublishError> {
        let mut sent = None;
        while let Some(delivery) = self.rx.recv().await {
            match delivery {
                Delivery::Sent(pkid) => {
                    self.unsent = self.unsent.saturating_sub(1);
                    if self.unsent == 0 {
                        sent = Some(pkid);
                    }
                }
                Delivery::Acked(pkid) if sent == Some(pkid) && qos == QosLevel::AtLeastOnce => {
                    return Ok(());
                }
                Delivery::Completed(pkid) if sent == Some(pkid) => return Ok(()),
                other => debug!(?other, "Ignoring unrelated delivery event"),
            }
        }
        Err(PublishError::Unacknowledged)
    }
}

/// Keeps the event loop polled so publishes and pings flow, forwarding
/// publish progress to the session. Ends on the first transport error,
/// taking the event loop (and the request channel) down with it.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    deliveries: mpsc::UnboundedSender<Delivery>,
    on_drop: DisconnectSignal,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = deliveries.send(Delivery::Sent(pkid));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = deliveries.send(Delivery::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                let _ = deliveries.send(Delivery::Completed(comp.pkid));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent DISCONNECT");
                on_drop.fire("broker closed the session");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT transport dropped");
                on_drop.fire(e.to_string());
                return;
            }
        }
    }
}

pub struct MqttSession {
    client: AsyncClient,
    driver: Mutex<Option<JoinHandle<()>>>,
    // held across the whole publish, so publishes on one session never interleave
    deliveries: tokio::sync::Mutex<DeliveryTracker>,
    publish_timeout: Duration,
}

impl MqttSession {
    fn is_live(&self) -> bool {
        self.driver
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        if !self.is_live() {
            return Err(PublishError::NotConnected);
        }

        let confirmed = async {
            let mut deliveries = self.deliveries.lock().await;
            self.client
                .publish(topic, to_mqtt_qos(qos), false, payload)
                .await
                .map_err(|e| PublishError::Client(e.to_string()))?;
            deliveries.note_queued();
            deliveries.await_ack(qos).await
        };

        match tokio::time::timeout(self.publish_timeout, confirmed).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.publish_timeout.as_secs())),
        }
    }

    async fn close(&self) {
        let handle = self.driver.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut handle) = handle else {
            return;
        };

        let _ = tokio::time::timeout(CLOSE_GRACE, self.client.disconnect()).await;
        // let the driver flush DISCONNECT before pulling the plug
        if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
            handle.abort();
        }
        debug!("MQTT session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigureRequest;

    fn config() -> TrackerConfig {
        TrackerConfig::from_request(
            ConfigureRequest {
                broker: Some("127.0.0.1".to_string()),
                topic: Some("fleet/truck-1".to_string()),
                client_id: Some("tracker-test".to_string()),
                ..Default::default()
            },
            "truck-1",
        )
        .unwrap()
    }

    #[test]
    fn test_build_options_basics() {
        let options = build_options(&config()).unwrap();

        assert_eq!(options.client_id(), "tracker-test");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert!(options.clean_session());
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(options.credentials().is_none());
        assert!(options.last_will().is_some());
    }

    #[test]
    fn test_build_options_with_credentials() {
        let mut config = config();
        config.username = Some("fleet".to_string());
        config.password = Some("secret".to_string());

        let options = build_options(&config).unwrap();
        assert_eq!(
            options.credentials(),
            Some(("fleet".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_build_options_rejects_bad_client_id() {
        let mut config = config();
        config.client_id = String::new();
        assert!(matches!(build_options(&config), Err(ConnectError::InvalidOptions(_))));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_mqtt_qos(QosLevel::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(QosLevel::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn test_disconnect_signal_delivers_reason() {
        let (signal, mut rx) = DisconnectSignal::pair();
        signal.fire("socket reset");
        assert_eq!(rx.try_recv().unwrap(), "socket reset");
    }

    #[test]
    fn test_unfired_signal_closes_channel() {
        let (signal, mut rx) = DisconnectSignal::pair();
        drop(signal);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config();
        config.port = port;
        let (signal, _rx) = DisconnectSignal::pair();

        let result = MqttConnector::new(Duration::from_secs(1)).connect(&config, signal).await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
    }

    fn tracker() -> (mpsc::UnboundedSender<Delivery>, DeliveryTracker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, DeliveryTracker::new(rx))
    }

    #[tokio::test]
    async fn test_puback_confirms_qos1_publish() {
        let (tx, mut tracker) = tracker();
        tracker.note_queued();
        tx.send(Delivery::Sent(7)).unwrap();
        tx.send(Delivery::Acked(7)).unwrap();

        assert!(tracker.await_ack(QosLevel::AtLeastOnce).await.is_ok());
    }

    #[tokio::test]
    async fn test_qos2_waits_for_pubcomp() {
        let (tx, mut tracker) = tracker();
        tracker.note_queued();
        tx.send(Delivery::Sent(3)).unwrap();
        tx.send(Delivery::Acked(3)).unwrap();
        drop(tx);

        // a bare PUBACK does not finish an exactly-once delivery
        assert!(matches!(
            tracker.await_ack(QosLevel::ExactlyOnce).await,
            Err(PublishError::Unacknowledged)
        ));

        let (tx, mut tracker) = self::tracker();
        tracker.note_queued();
        tx.send(Delivery::Sent(3)).unwrap();
        tx.send(Delivery::Completed(3)).unwrap();
        assert!(tracker.await_ack(QosLevel::ExactlyOnce).await.is_ok());
    }

    #[tokio::test]
    async fn test_ack_of_abandoned_request_does_not_confirm_the_next() {
        let (tx, mut tracker) = tracker();
        // an earlier publish timed out before its request was written
        tracker.note_queued();
        tracker.note_queued();
        tx.send(Delivery::Sent(4)).unwrap();
        tx.send(Delivery::Acked(4)).unwrap();
        tx.send(Delivery::Sent(5)).unwrap();
        drop(tx);

        assert!(matches!(
            tracker.await_ack(QosLevel::AtLeastOnce).await,
            Err(PublishError::Unacknowledged)
        ));
    }

    #[tokio::test]
    async fn test_ack_for_other_packet_is_ignored() {
        let (tx, mut tracker) = tracker();
        tracker.note_queued();
        tx.send(Delivery::Sent(9)).unwrap();
        tx.send(Delivery::Acked(8)).unwrap();
        tx.send(Delivery::Acked(9)).unwrap();

        assert!(tracker.await_ack(QosLevel::AtLeastOnce).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_before_ack_fails_publish() {
        let (tx, mut tracker) = tracker();
        tracker.note_queued();
        tx.send(Delivery::Sent(1)).unwrap();
        // the driver ends when the transport drops
        drop(tx);

        assert!(matches!(
            tracker.await_ack(QosLevel::AtLeastOnce).await,
            Err(PublishError::Unacknowledged)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_wait_on_a_full_request_channel() {
        let (client, _eventloop) = AsyncClient::new(build_options(&config()).unwrap(), 1);
        client
            .try_publish("fleet/truck-1", QoS::AtLeastOnce, false, vec![1])
            .unwrap();
        let (_tx, tracker) = tracker();
        let session = MqttSession {
            client,
            driver: Mutex::new(Some(tokio::spawn(std::future::pending::<()>()))),
            deliveries: tokio::sync::Mutex::new(tracker),
            publish_timeout: Duration::from_secs(1),
        };

        tokio::time::timeout(Duration::from_secs(5), session.close())
            .await
            .expect("close should give up on a stalled request channel");
        assert!(!session.is_live());
    }
}
