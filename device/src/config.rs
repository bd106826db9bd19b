use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_INTERVAL_SECS: u64 = 10;
const CONFIG_FILE_NAME: &str = "tracker_config.json";

/// Process-level settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub device_id: String,
    pub store_path: PathBuf,
    pub config_dir: PathBuf,
    pub probe_url: String,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub sensor_timeout_secs: u64,
    pub log_format: String,
    pub log_level: String,
}

impl AgentSettings {
    pub fn from_env() -> Self {
        let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let store_path =
            env::var("STORE_PATH").unwrap_or_else(|_| "./tracker_queue.db".to_string());
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        let probe_url = env::var("PROBE_URL")
            .unwrap_or_else(|_| "http://clients3.google.com/generate_204".to_string());

        AgentSettings {
            device_id,
            store_path: PathBuf::from(store_path),
            config_dir: PathBuf::from(config_dir),
            probe_url,
            probe_timeout_secs: get_env_var_u64("PROBE_TIMEOUT_SECS", 3),
            connect_timeout_secs: get_env_var_u64("CONNECT_TIMEOUT_SECS", 10),
            publish_timeout_secs: get_env_var_u64("PUBLISH_TIMEOUT_SECS", 5),
            reconnect_delay_secs: get_env_var_u64("RECONNECT_DELAY_SECS", 2),
            sensor_timeout_secs: get_env_var_u64("SENSOR_TIMEOUT_SECS", 15),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Delivery level requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(ConfigError::InvalidQos(other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> u8 {
        match qos {
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Raw `configure` command payload. Every field is optional on the wire;
/// `TrackerConfig::from_request` fills defaults and validates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigureRequest {
    pub device_id: Option<String>,
    pub user: Option<String>,
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub topic: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub interval_seconds: Option<u64>,
    pub qos: Option<u8>,
}

/// The configuration of one activation. Immutable once adopted; a new
/// `configure` replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub device_id: String,
    pub user: String,
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub interval_seconds: u64,
    pub qos: QosLevel,
}

impl TrackerConfig {
    pub fn from_request(
        request: ConfigureRequest,
        default_device_id: &str,
    ) -> Result<Self, ConfigError> {
        let broker = non_empty(request.broker).ok_or(ConfigError::MissingField("broker"))?;
        let topic = non_empty(request.topic).ok_or(ConfigError::MissingField("topic"))?;

        let interval_seconds = request.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval_seconds == 0 {
            return Err(ConfigError::InvalidInterval(interval_seconds));
        }

        let qos = match request.qos {
            Some(raw) => QosLevel::try_from(raw)?,
            None => QosLevel::AtLeastOnce,
        };

        Ok(TrackerConfig {
            device_id: non_empty(request.device_id)
                .unwrap_or_else(|| default_device_id.to_string()),
            user: request.user.unwrap_or_default(),
            broker,
            port: request.port.unwrap_or(DEFAULT_PORT),
            topic,
            client_id: non_empty(request.client_id).unwrap_or_else(generate_client_id),
            username: non_empty(request.username),
            password: request.password,
            interval_seconds,
            qos,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: TrackerConfig = serde_json::from_str(&contents)?;
        Ok(Some(config))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        // Ensure the directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = open_private(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    pub fn clear_file(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Client ids must be unique per session; brokers kick the older
/// connection when two clients share one.
pub fn generate_client_id() -> String {
    format!("tracker-{}", Uuid::new_v4().simple())
}

/// Opens `path` for writing, readable by the owner only: the file holds
/// broker credentials.
#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<fs::File> {
    fs::File::create(path)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
