//! Platform collaborators: where device info, battery/network state, and
//! location fixes come from.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::types::{DeviceInfo, DeviceState, LocationFix};

pub const FUSED_TIMEOUT: Duration = Duration::from_secs(5);
pub const NATIVE_TIMEOUT: Duration = Duration::from_secs(4);

#[cfg_attr(test, mockall::automock)]
pub trait DeviceInfoProvider: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
}

#[cfg_attr(test, mockall::automock)]
pub trait DeviceStateProvider: Send + Sync {
    fn snapshot(&self) -> DeviceState;
}

/// One way of obtaining a position (fused, GPS, network, ...).
#[async_trait]
pub trait LocationSource: Send + Sync {
    fn name(&self) -> &str;

    /// Upper bound on a single acquisition attempt.
    fn timeout(&self) -> Duration;

    /// Best-effort fix; `None` when the source is disabled or has nothing.
    async fn current_fix(&self) -> Option<LocationFix>;
}

/// Tries each source in order and returns the first fix obtained within
/// that source's timeout.
#[derive(Default)]
pub struct FallbackLocator {
    sources: Vec<Box<dyn LocationSource>>,
}

impl FallbackLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Box<dyn LocationSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub async fn locate(&self) -> Option<LocationFix> {
        for source in &self.sources {
            match tokio::time::timeout(source.timeout(), source.current_fix()).await {
                Ok(Some(fix)) => {
                    debug!(source = source.name(), lat = fix.lat, lon = fix.lon, "Location fix acquired");
                    return Some(fix);
                }
                Ok(None) => debug!(source = source.name(), "No fix from source"),
                Err(_) => debug!(source = source.name(), "Location source timed out"),
            }
        }
        None
    }
}
