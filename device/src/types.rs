use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;

use crate::config::{ConfigureRequest, TrackerConfig};

/// Battery charge as reported by the sensor source.
///
/// Serialized as an integer percentage, or the string `"unknown"` when the
/// battery could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    Percent(u8),
    Unknown,
}

impl BatteryLevel {
    pub fn from_percent(value: u8) -> Self {
        BatteryLevel::Percent(value.min(100))
    }
}

impl Serialize for BatteryLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BatteryLevel::Percent(p) => serializer.serialize_u8(*p),
            BatteryLevel::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for BatteryLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Percent(u8),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Percent(p) if p <= 100 => Ok(BatteryLevel::Percent(p)),
            Raw::Percent(p) => Err(D::Error::custom(format!(
                "battery percentage out of range: {p}"
            ))),
            Raw::Text(s) if s == "unknown" => Ok(BatteryLevel::Unknown),
            Raw::Text(s) => Err(D::Error::custom(format!("unexpected battery value: {s}"))),
        }
    }
}

/// A single position fix from the location subsystem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub bearing: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    pub user: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub bearing: f64,
    pub battery: BatteryLevel,
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: i64,
    /// Capture time in RFC 3339 form.
    pub date: String,
    pub topic: String,
}

impl TelemetrySample {
    pub fn new(
        config: &TrackerConfig,
        fix: PositionFix,
        battery: BatteryLevel,
        captured_at: DateTime<Utc>,
    ) -> Self {
        TelemetrySample {
            device_id: config.device_id.clone(),
            user: config.user.clone(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            speed: fix.speed,
            bearing: fix.bearing,
            battery,
            timestamp: captured_at.timestamp(),
            date: captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            topic: config.topic.clone(),
        }
    }
}

/// A sample waiting in the offline queue. `sent_at` stays `None` until a
/// flush stamps it right before publishing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueuedPayload {
    #[serde(flatten)]
    pub sample: TelemetrySample,
    pub sent_at: Option<String>,
}

impl QueuedPayload {
    pub fn pending(sample: TelemetrySample) -> Self {
        QueuedPayload { sample, sent_at: None }
    }

    pub fn stamp_sent(&mut self, at: DateTime<Utc>) {
        self.sent_at = Some(at.to_rfc3339_opts(SecondsFormat::Millis, true));
    }

    pub fn to_record(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_record(record: &str) -> serde_json::Result<Self> {
        serde_json::from_str(record)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Started,
    Connecting,
    Connected,
    ConnectFailed,
    Disconnected,
    SensorError,
    StoreError,
    Buffering,
    Drained,
    Pending,
    InvalidConfig,
    Stopped,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn new(status: StatusKind) -> Self {
        StatusEvent {
            status,
            topic: None,
            pending: None,
            error: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_pending(mut self, pending: usize) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Outbound events for the presentation layer.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Status(StatusEvent),
    LastPayload(QueuedPayload),
}

/// Inbound commands from the presentation layer.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Configure(ConfigureRequest),
    Stop,
}

/// Sending half of the event channel. A closed receiver is not an error:
/// the agent keeps running headless.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        EventSink { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(tx), rx)
    }

    pub fn status(&self, event: StatusEvent) {
        let _ = self.tx.send(AgentEvent::Status(event));
    }

    pub fn last_payload(&self, payload: QueuedPayload) {
        let _ = self.tx.send(AgentEvent::LastPayload(payload));
    }
}
