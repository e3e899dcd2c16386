use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Stable per-installation identity, produced once by
/// [`CredentialStore::ensure_initialized`](crate::storage::CredentialStore::ensure_initialized).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_secret: String,
}

/// Static hardware/OS descriptor sent with registration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub brand: String,
    pub os_version: String,
    pub sdk_int: u32,
    pub manufacturer: String,
}

/// Battery and connectivity reading taken at the start of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub battery_pct: u8,
    pub charging: bool,
    pub network_type: String,
}

// Field order is the wire order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub collected_at: String,
    pub battery_pct: u8,
    pub charging: bool,
    pub network_type: String,
    pub app_version: String,
}

impl HeartbeatPayload {
    pub fn new(state: DeviceState, collected_at: DateTime<Utc>) -> Self {
        Self {
            collected_at: iso_timestamp(collected_at),
            battery_pct: state.battery_pct.min(100),
            charging: state.charging,
            network_type: state.network_type,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A single position fix as produced by a location source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f32,
    pub speed_mps: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    pub collected_at: String,
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f32,
    pub speed_mps: f32,
}

impl LocationPayload {
    pub fn new(fix: LocationFix, collected_at: DateTime<Utc>) -> Self {
        Self {
            collected_at: iso_timestamp(collected_at),
            lat: fix.lat,
            lon: fix.lon,
            accuracy_m: fix.accuracy_m,
            speed_mps: fix.speed_mps,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest<'a> {
    pub device_id: &'a str,
    pub secret: &'a str,
    pub info: &'a DeviceInfo,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub device_id: &'a str,
    pub secret: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct LoginResponse {
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub token: Option<String>,
}

/// Reads a string, number, or boolean as its string form; `null` and
/// containers are treated as absent.
fn scalar_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
