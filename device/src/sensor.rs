use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::error::SensorError;
use crate::types::{BatteryLevel, PositionFix, TelemetrySample};

/// Source of position fixes and battery readings.
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Whether the location subsystem is switched on.
    async fn service_enabled(&self) -> bool;

    /// Best-accuracy position fix.
    async fn position(&self) -> Result<PositionFix, SensorError>;

    async fn battery(&self) -> Result<u8, SensorError>;
}

pub struct SampleProducer {
    source: Arc<dyn SensorSource>,
    read_timeout: Duration,
}

impl SampleProducer {
    pub fn new(source: Arc<dyn SensorSource>, read_timeout: Duration) -> Self {
        SampleProducer {
            source,
            read_timeout,
        }
    }

    /// Reads one fresh sample for `config`. Every sensor call is bounded by
    /// the read timeout. A failed or hung battery read degrades to
    /// `BatteryLevel::Unknown`; a failed position read fails the capture.
    pub async fn capture(&self, config: &TrackerConfig) -> Result<TelemetrySample, SensorError> {
        if !self.bounded(self.source.service_enabled()).await? {
            return Err(SensorError::Unavailable);
        }

        let fix = self.bounded(self.source.position()).await??;
        let captured_at = Utc::now();

        let battery = match self.bounded(self.source.battery()).await {
            Ok(Ok(level)) => BatteryLevel::from_percent(level),
            Ok(Err(e)) | Err(e) => {
                warn!(error = %e, "Battery read failed, reporting unknown");
                BatteryLevel::Unknown
            }
        };

        debug!(
            latitude = fix.latitude,
            longitude = fix.longitude,
            accuracy = fix.accuracy,
            ?battery,
            "Captured sample"
        );
        Ok(TelemetrySample::new(config, fix, battery, captured_at))
    }

    async fn bounded<T>(&self, read: impl Future<Output = T>) -> Result<T, SensorError> {
        tokio::time::timeout(self.read_timeout, read)
            .await
            .map_err(|_| SensorError::Timeout(self.read_timeout.as_secs()))
    }
}
