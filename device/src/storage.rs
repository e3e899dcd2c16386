use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::types::DeviceIdentity;

pub const DB_FILE: &str = "device_storage.db";

const KEY_SERVER_BASE_URL: &str = "serverBaseUrl";
const KEY_DEVICE_ID: &str = "deviceId";
const KEY_DEVICE_SECRET: &str = "deviceSecret";
const KEY_ADMIN_KEY: &str = "adminKey";
const KEY_TOKEN: &str = "token";

/// Durable key-value store for the device identity and its settings.
///
/// Values are written through to SQLite and cached in-process; the last
/// written value wins. The plain accessors never fail: a storage error is
/// logged and the cached value (or an empty string) is returned. Identity
/// initialization instead stops on a read error.
pub struct CredentialStore {
    inner: Mutex<Inner>,
}

struct Inner {
    conn: Connection,
    cache: HashMap<String, String>,
}

impl CredentialStore {
    pub fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Opening credential store");
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS prefs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                cache: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the cache half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generates the device id and secret on first use and returns the
    /// identity. Later calls return the persisted values unchanged.
    pub fn ensure_initialized(&self, platform_id: &str) -> Result<DeviceIdentity> {
        let mut inner = self.lock();

        let device_id = match inner.try_get(KEY_DEVICE_ID)? {
            Some(id) => id,
            None => {
                let id = format!("dev_{platform_id}");
                inner.put(KEY_DEVICE_ID, &id)?;
                info!(device_id = %id, "Generated device id");
                id
            }
        };

        let device_secret = match inner.try_get(KEY_DEVICE_SECRET)? {
            Some(secret) => secret,
            None => {
                let secret = generate_secret();
                inner.put(KEY_DEVICE_SECRET, &secret)?;
                info!(device_id = %device_id, "Generated device secret");
                secret
            }
        };

        Ok(DeviceIdentity {
            device_id,
            device_secret,
        })
    }

    pub fn device_id(&self) -> Option<String> {
        self.lock().get(KEY_DEVICE_ID)
    }

    pub fn device_secret(&self) -> Option<String> {
        self.lock().get(KEY_DEVICE_SECRET)
    }

    pub fn server_base_url(&self) -> String {
        self.lock().get(KEY_SERVER_BASE_URL).unwrap_or_default()
    }

    pub fn set_server_base_url(&self, url: &str) -> Result<()> {
        self.lock().put(KEY_SERVER_BASE_URL, url)
    }

    /// Stores `url` only if no server address has been saved yet.
    pub fn seed_server_base_url(&self, url: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.try_get(KEY_SERVER_BASE_URL)?.is_none() {
            inner.put(KEY_SERVER_BASE_URL, url)?;
        }
        Ok(())
    }

    pub fn admin_key(&self) -> String {
        self.lock().get(KEY_ADMIN_KEY).unwrap_or_default()
    }

    pub fn set_admin_key(&self, key: &str) -> Result<()> {
        self.lock().put(KEY_ADMIN_KEY, key)
    }

    pub fn token(&self) -> String {
        self.lock().get(KEY_TOKEN).unwrap_or_default()
    }

    pub fn set_token(&self, token: &str) -> Result<()> {
        self.lock().put(KEY_TOKEN, token)
    }
}

impl Inner {
    /// Non-blank value for `key`, from the cache or the database. Read
    /// errors are logged and reported as unset.
    fn get(&mut self, key: &str) -> Option<String> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, key = key, "Failed to read preference");
                None
            }
        }
    }

    /// Like [`Inner::get`], but a read error is returned instead of being
    /// mistaken for a missing value.
    fn try_get(&mut self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(non_blank(value.clone()));
        }

        let loaded = self
            .conn
            .query_row(
                "SELECT value FROM prefs WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("reading preference {key}"))?;

        Ok(loaded.and_then(|value| {
            self.cache.insert(key.to_string(), value.clone());
            non_blank(value)
        }))
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO prefs (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        self.cache.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// 16 lowercase hex characters.
fn generate_secret() -> String {
    format!("{:016x}", rand::random::<u64>())
}
