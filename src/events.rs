//! Result events for real-time subscribers
//!
//! The bus is a `tokio::sync::broadcast` channel. Publishing never blocks and
//! never fails when nobody is listening; slow subscribers lose the oldest
//! events rather than holding up a probe.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::catalog::ConnectionType;
use crate::model::RunStatus;
use crate::probe::ProbeResult;

const DEFAULT_CAPACITY: usize = 256;

/// What started a probe or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Operator test of a stored or unsaved connection
    Manual,
    /// Timer loop
    Scheduled,
    /// Operator "run now" on a schedule
    RunNow,
}

/// One completed probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeEvent {
    /// Absent for unsaved (ad-hoc) connections
    pub connection_id: Option<String>,
    pub application_id: String,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub schedule_id: Option<String>,
    pub trigger: Trigger,
    pub result: ProbeResult,
    pub at: DateTime<Utc>,
}

/// Counts for one scheduled run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub connected: usize,
    pub failed: usize,
    /// Ineligible connections (custom strings)
    pub skipped: usize,
}

impl RunSummary {
    /// Success only if every eligible connection connected
    pub fn status(&self) -> RunStatus {
        if self.failed == 0 {
            RunStatus::Success
        } else {
            RunStatus::Failed
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} connected, {} failed, {} skipped",
            self.connected, self.failed, self.skipped
        )
    }
}

/// One finished schedule run
#[derive(Debug, Clone, Serialize)]
pub struct RunCompleted {
    pub schedule_id: String,
    pub application_id: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ProbeCompleted(ProbeEvent),
    RunCompleted(RunCompleted),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ProbeCompleted(_) => "probe_completed",
            Event::RunCompleted(_) => "run_completed",
        }
    }

    pub fn application_id(&self) -> &str {
        match self {
            Event::ProbeCompleted(e) => &e.application_id,
            Event::RunCompleted(e) => &e.application_id,
        }
    }
}

/// Broadcast bus shared by the tester and the scheduler
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let name = event.name();
        // Err only means there are no subscribers right now
        if self.tx.send(event).is_err() {
            trace!(event = name, "No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
