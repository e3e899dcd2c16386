//! Host-side stand-ins for the phone's hardware collaborators.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::collect::{DeviceInfoProvider, DeviceStateProvider, LocationSource};
use crate::types::{DeviceInfo, DeviceState, LocationFix};

pub struct HostDeviceInfo {
    info: DeviceInfo,
}

impl HostDeviceInfo {
    pub fn new(model: Option<String>) -> Self {
        Self {
            info: DeviceInfo {
                model: model.unwrap_or_else(|| std::env::consts::ARCH.to_string()),
                brand: "generic".to_string(),
                os_version: std::env::consts::OS.to_string(),
                sdk_int: 0,
                manufacturer: "unknown".to_string(),
            },
        }
    }
}

impl DeviceInfoProvider for HostDeviceInfo {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }
}

/// Battery that drains one percent per reading and recharges from 15%.
pub struct SimulatedDeviceState {
    readings: AtomicU32,
    network_type: String,
}

impl SimulatedDeviceState {
    pub fn new(network_type: impl Into<String>) -> Self {
        Self {
            readings: AtomicU32::new(0),
            network_type: network_type.into(),
        }
    }
}

impl DeviceStateProvider for SimulatedDeviceState {
    fn snapshot(&self) -> DeviceState {
        let n = self.readings.fetch_add(1, Ordering::SeqCst);
        // 100 down to 15 while discharging, then 85 readings on the charger.
        let phase = n % 170;
        let (battery_pct, charging) = if phase < 86 {
            (100 - phase, false)
        } else {
            (15 + (phase - 86), true)
        };
        DeviceState {
            battery_pct: battery_pct.min(100) as u8,
            charging,
            network_type: self.network_type.clone(),
        }
    }
}

/// Location source reporting small random movements around a fixed point.
pub struct SimulatedLocationSource {
    name: String,
    origin: (f64, f64),
    accuracy_m: f32,
    timeout: Duration,
}

impl SimulatedLocationSource {
    pub fn new(name: impl Into<String>, origin: (f64, f64), accuracy_m: f32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            origin,
            accuracy_m,
            timeout,
        }
    }
}

#[async_trait]
impl LocationSource for SimulatedLocationSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn current_fix(&self) -> Option<LocationFix> {
        // Roughly +/- 50 m.
        let jitter = || (rand::random::<f64>() - 0.5) * 0.001;
        Some(LocationFix {
            lat: self.origin.0 + jitter(),
            lon: self.origin.1 + jitter(),
            accuracy_m: self.accuracy_m,
            speed_mps: rand::random::<f32>() * 1.5,
        })
    }
}
