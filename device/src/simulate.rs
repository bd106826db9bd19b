use async_trait::async_trait;
use rand::Rng;
use std::sync::Mutex;

use crate::error::SensorError;
use crate::sensor::SensorSource;
use crate::types::PositionFix;

const METERS_PER_DEGREE: f64 = 111_320.0;

struct WalkState {
    latitude: f64,
    longitude: f64,
    battery: f64,
}

/// Sensor source that drifts a position around a starting point and slowly
/// drains the battery. Stands in for real location hardware.
pub struct SimulatedSensor {
    state: Mutex<WalkState>,
}

impl SimulatedSensor {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        SimulatedSensor {
            state: Mutex::new(WalkState {
                latitude,
                longitude,
                battery: 100.0,
            }),
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    async fn service_enabled(&self) -> bool {
        true
    }

    async fn position(&self) -> Result<PositionFix, SensorError> {
        let mut rng = rand::thread_rng();
        let speed: f64 = rng.gen_range(0.0..15.0); // m/s
        let bearing: f64 = rng.gen_range(0.0..360.0);
        let accuracy: f64 = rng.gen_range(3.0..25.0);

        let mut state = self
            .state
            .lock()
            .map_err(|_| SensorError::Read("simulator state poisoned".to_string()))?;

        // advance roughly ten seconds of travel
        let distance = speed * 10.0;
        let radians = bearing.to_radians();
        state.latitude += distance * radians.cos() / METERS_PER_DEGREE;
        let meters_per_lon_degree = METERS_PER_DEGREE * state.latitude.to_radians().cos().max(0.01);
        state.longitude += distance * radians.sin() / meters_per_lon_degree;

        log::debug!("Simulated fix at {:.6},{:.6}", state.latitude, state.longitude);

        Ok(PositionFix {
            latitude: state.latitude,
            longitude: state.longitude,
            accuracy,
            speed,
            bearing,
        })
    }

    async fn battery(&self) -> Result<u8, SensorError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SensorError::Read("simulator state poisoned".to_string()))?;
        state.battery = (state.battery - rand::random::<f64>() * 0.2).max(0.0);
        Ok(state.battery.round() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_position_stays_near_start() {
        let sensor = SimulatedSensor::new(48.137, 11.575);
        let mut last = sensor.position().await.unwrap();
        for _ in 0..20 {
            last = sensor.position().await.unwrap();
        }
        assert!((last.latitude - 48.137).abs() < 0.5);
        assert!((last.longitude - 11.575).abs() < 0.5);
        assert!((0.0..360.0).contains(&last.bearing));
    }

    #[tokio::test]
    async fn test_battery_drains_monotonically() {
        let sensor = SimulatedSensor::new(0.0, 0.0);
        let first = sensor.battery().await.unwrap();
        let mut previous = first;
        for _ in 0..50 {
            let level = sensor.battery().await.unwrap();
            assert!(level <= previous);
            previous = level;
        }
        assert!(first <= 100);
    }
}
