use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::net::normalize_base_url;

pub const DEFAULT_BACKEND_URL: &str = "https://guard.example.com/";
const CONFIG_FILE: &str = "device_config.json";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub backend_url: String,
    #[serde(default)]
    pub admin_key: Option<String>,
    #[serde(default)]
    pub platform_id: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub device_model: Option<String>,
    #[serde(default = "default_network_type")]
    pub network_type: String,
    /// Origin for simulated location fixes; no fixes are produced without it.
    #[serde(default)]
    pub sim_latitude: Option<f64>,
    #[serde(default)]
    pub sim_longitude: Option<f64>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    15
}

fn default_cycle_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network_type() -> String {
    "WIFI".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            admin_key: None,
            platform_id: None,
            data_dir: default_data_dir(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            cycle_timeout_secs: default_cycle_timeout(),
            log_level: default_log_level(),
            log_json: false,
            device_model: None,
            network_type: default_network_type(),
            sim_latitude: None,
            sim_longitude: None,
        }
    }
}

impl Config {
    /// Config file if one exists, environment otherwise.
    pub fn load() -> Result<Self> {
        let config = if Self::get_config_file_path().exists() {
            Self::load_from_file()?
        } else {
            Self::from_env()?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Config {
            backend_url: env::var("BACKEND_URL").unwrap_or(defaults.backend_url),
            admin_key: env::var("ADMIN_KEY").ok(),
            platform_id: env::var("PLATFORM_ID").ok(),
            data_dir: env::var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            heartbeat_interval_secs: get_env_var_u64("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval_secs),
            request_timeout_secs: get_env_var_u64("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cycle_timeout_secs: get_env_var_u64("CYCLE_TIMEOUT_SECS", defaults.cycle_timeout_secs),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: env::var("LOG_JSON").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false),
            device_model: env::var("DEVICE_MODEL").ok(),
            network_type: env::var("NETWORK_TYPE").unwrap_or(defaults.network_type),
            sim_latitude: get_env_var_f64("SIM_LATITUDE")?,
            sim_longitude: get_env_var_f64("SIM_LONGITUDE")?,
        })
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join(CONFIG_FILE)
    }

    pub fn load_from_file() -> Result<Self> {
        let contents = fs::read_to_string(Self::get_config_file_path())?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save_to_file(&self) -> Result<()> {
        let config_file_path = Self::get_config_file_path();
        if let Some(parent) = config_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(&config_file_path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        normalize_base_url(&self.backend_url)?;
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be > 0");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be > 0");
        }
        if self.cycle_timeout_secs == 0 {
            bail!("cycle_timeout_secs must be > 0");
        }
        if self.sim_latitude.is_some() != self.sim_longitude.is_some() {
            bail!("sim_latitude and sim_longitude must be set together");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(crate::storage::DB_FILE)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn sim_origin(&self) -> Option<(f64, f64)> {
        self.sim_latitude.zip(self.sim_longitude)
    }

    /// Configured platform id, else the host machine id, else a random one.
    pub fn resolve_platform_id(&self) -> String {
        if let Some(id) = self.platform_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        if let Ok(machine_id) = fs::read_to_string("/etc/machine-id") {
            let machine_id = machine_id.trim();
            if !machine_id.is_empty() {
                return machine_id.chars().take(16).collect();
            }
        }
        Uuid::new_v4().simple().to_string().chars().take(8).collect()
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn get_env_var_f64(key: &str) -> Result<Option<f64>> {
    parse_f64_var(key, env::var(key).ok().as_deref())
}

/// Unset or blank is `None`; anything else must parse.
fn parse_f64_var(key: &str, raw: Option<&str>) -> Result<Option<f64>> {
    match raw.map(str::trim).filter(|val| !val.is_empty()) {
        None => Ok(None),
        Some(val) => val
            .parse()
            .map(Some)
            .with_context(|| format!("{key} is not a number: {val:?}")),
    }
}
