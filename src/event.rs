//! Structured events emitted by the engine on every task-state mutation.
//!
//! Consumers subscribe to the event stream to build dashboards or push
//! updates to a UI. Events are the engine's voice; `Bus::log` carries
//! operator-facing log lines alongside them. Publishing is fire-and-forget.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{TargetId, TaskState};

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskState(TaskState),
    Progress {
        target_id: TargetId,
        purchased_qty: u32,
        target_qty: u32,
        order_id: String,
    },
    TargetDisabled {
        target_id: TargetId,
        reason: DisableReason,
    },
}

impl EventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::TaskState(_) => "task_state",
            EventKind::Progress { .. } => "progress",
            EventKind::TargetDisabled { .. } => "target_disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    Completed,
    Expired,
}

impl std::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisableReason::Completed => "completed",
            DisableReason::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Observability sink. Implementations must not block.
pub trait Bus: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, fields: serde_json::Value);
    fn publish(&self, kind: EventKind);
}

/// Forwards everything to `tracing`.
#[derive(Debug, Default)]
pub struct TracingBus;

impl Bus for TracingBus {
    fn log(&self, level: LogLevel, message: &str, fields: serde_json::Value) {
        match level {
            LogLevel::Debug => tracing::debug!(%fields, "{message}"),
            LogLevel::Info => tracing::info!(%fields, "{message}"),
            LogLevel::Warn => tracing::warn!(%fields, "{message}"),
            LogLevel::Error => tracing::error!(%fields, "{message}"),
        }
    }

    fn publish(&self, kind: EventKind) {
        tracing::debug!(topic = kind.topic(), ?kind, "event");
    }
}

/// A log line as seen by bus subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub fields: serde_json::Value,
}

/// Fans events and log lines out to any number of subscribers.
///
/// Slow subscribers lag and drop; publishers never wait.
#[derive(Debug)]
pub struct BroadcastBus {
    seq: AtomicU64,
    events: broadcast::Sender<Event>,
    logs: broadcast::Sender<LogLine>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (logs, _) = broadcast::channel(capacity.max(1));
        Self {
            seq: AtomicU64::new(0),
            events,
            logs,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.logs.subscribe()
    }
}

impl Bus for BroadcastBus {
    fn log(&self, level: LogLevel, message: &str, fields: serde_json::Value) {
        let _ = self.logs.send(LogLine {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            fields,
        });
    }

    fn publish(&self, kind: EventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.events.send(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}
