//! Background tracking client for an anti-loss server.
//!
//! The device registers once with an operator-supplied admin key, logs in
//! with its generated secret to obtain a bearer token, then periodically
//! submits HMAC-signed heartbeat and location reports.

pub mod api;
pub mod collect;
pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod signing;
pub mod simulate;
pub mod storage;
pub mod tracker;
pub mod types;

pub use api::{ApiClient, EnrollOutcome};
pub use config::Config;
pub use error::{ApiError, ApiResult, TransportError};
pub use storage::CredentialStore;
pub use tracker::Tracker;
