//! # Tracking loop
//!
//! Every period the tracker takes a battery/network snapshot, submits a
//! heartbeat, asks the locator for a fix and, if there is one, submits the
//! location. The two submissions are independent: either may fail without
//! affecting the other or the loop.
//!
//! Cycles never overlap. The loop awaits each cycle (bounded by the cycle
//! timeout) before waiting for the next tick, and a tick missed while a
//! cycle ran is delayed rather than burst.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::ApiClient;
use crate::collect::{DeviceStateProvider, FallbackLocator};
use crate::error::{ApiError, ApiResult};
use crate::events::LogSink;
use crate::net::HttpTransport;
use crate::types::{HeartbeatPayload, LocationPayload};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Consecutive heartbeat failures after which they are logged as errors.
const FAILURE_ESCALATION: u32 = 3;

#[derive(Debug)]
pub enum LocationOutcome {
    Sent,
    Failed(ApiError),
    /// No source produced a fix this cycle.
    Unavailable,
}

#[derive(Debug)]
pub struct CycleReport {
    pub heartbeat: ApiResult<()>,
    pub location: LocationOutcome,
}

pub struct Tracker<T: HttpTransport> {
    api: Arc<ApiClient<T>>,
    state: Arc<dyn DeviceStateProvider>,
    locator: FallbackLocator,
    sink: Arc<dyn LogSink>,
    interval: Duration,
    cycle_timeout: Duration,
}

impl<T: HttpTransport> Tracker<T> {
    pub fn new(
        api: Arc<ApiClient<T>>,
        state: Arc<dyn DeviceStateProvider>,
        locator: FallbackLocator,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            api,
            state,
            locator,
            sink,
            interval: DEFAULT_INTERVAL,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cycle_timeout(mut self, cycle_timeout: Duration) -> Self {
        self.cycle_timeout = cycle_timeout;
        self
    }

    /// One heartbeat and at most one location submission.
    pub async fn run_cycle(&self) -> CycleReport {
        self.sink.on_log_event("Starting upload cycle");

        let heartbeat = HeartbeatPayload::new(self.state.snapshot(), Utc::now());
        let heartbeat_result = self.api.send_heartbeat(&heartbeat).await;
        match &heartbeat_result {
            Ok(()) => self.sink.on_log_event("Heartbeat sent"),
            Err(e) => self.sink.on_log_event(&format!("Heartbeat failed: {e}")),
        }

        let location = match self.locator.locate().await {
            Some(fix) => {
                let payload = LocationPayload::new(fix, Utc::now());
                match self.api.send_location(&payload).await {
                    Ok(()) => {
                        self.sink
                            .on_log_event(&format!("Location sent: {}, {}", payload.lat, payload.lon));
                        LocationOutcome::Sent
                    }
                    Err(e) => {
                        self.sink.on_log_event(&format!("Location failed: {e}"));
                        LocationOutcome::Failed(e)
                    }
                }
            }
            None => {
                self.sink
                    .on_log_event("No location fix available; check that location sources are enabled");
                LocationOutcome::Unavailable
            }
        };

        CycleReport {
            heartbeat: heartbeat_result,
            location,
        }
    }

    /// Runs cycles on the configured period until `cancel` fires. Cancelling
    /// drops any in-flight request.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            device_id = %self.api.identity().device_id,
            "Tracker started"
        );
        self.sink
            .on_log_event(&format!("Tracking started (interval: {}s)", self.interval.as_secs()));

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = tokio::time::timeout(self.cycle_timeout, self.run_cycle());
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = cycle => outcome,
            };

            match outcome {
                Ok(report) => match report.heartbeat {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        if failures >= FAILURE_ESCALATION {
                            error!(error = %e, failures, "Heartbeat failed");
                        } else {
                            warn!(error = %e, failures, "Heartbeat failed");
                        }
                    }
                },
                Err(_) => {
                    warn!(timeout_secs = self.cycle_timeout.as_secs(), "Tracking cycle timed out");
                    self.sink.on_log_event(&format!(
                        "Tracking cycle timed out after {}s",
                        self.cycle_timeout.as_secs()
                    ));
                }
            }
        }

        info!("Tracker stopping");
        self.sink.on_log_event("Tracking stopped");
    }
}
