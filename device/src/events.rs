//! Operator-facing log events.
//!
//! The tracker reports progress through a [`LogSink`] so the protocol core
//! never depends on how (or whether) messages are shown to a person.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub trait LogSink: Send + Sync {
    fn on_log_event(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl LogEvent {
    /// `[HH:MM:SS] message`, local time.
    pub fn display_line(&self) -> String {
        let local = self.at.with_timezone(&chrono::Local);
        format!("[{}] {}", local.format("%H:%M:%S"), self.message)
    }
}

/// Forwards events to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn on_log_event(&self, message: &str) {
        info!(target: "guard_device::events", "{}", message);
    }
}

/// Queues events for a consumer task. Events are dropped once the receiver
/// is gone.
#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl ChannelLogSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLogSink {
    fn on_log_event(&self, message: &str) {
        let _ = self.tx.send(LogEvent {
            at: Utc::now(),
            message: message.to_string(),
        });
    }
}

/// Delivers every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutLogSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl LogSink for FanoutLogSink {
    fn on_log_event(&self, message: &str) {
        for sink in &self.sinks {
            sink.on_log_event(message);
        }
    }
}
