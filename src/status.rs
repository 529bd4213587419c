//! Latest user-visible status line.
//!
//! A single overwritable slot. Writers are the connection manager and the
//! capture pipeline, readers are the UI (polling `current()` or awaiting
//! `subscribe()`). There is no history: last write wins.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub message: String,
    pub observed_at: DateTime<Local>,
}

impl StatusRecord {
    fn now(message: String) -> Self {
        Self {
            message,
            observed_at: Local::now(),
        }
    }
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.observed_at.format("%H:%M:%S"), self.message)
    }
}

#[derive(Debug)]
pub struct StatusReporter {
    slot: watch::Sender<StatusRecord>,
}

impl StatusReporter {
    pub fn new(initial: impl Into<String>) -> Self {
        let (slot, _) = watch::channel(StatusRecord::now(initial.into()));
        Self { slot }
    }

    /// Overwrites the current record. Safe from any task or thread.
    pub fn set(&self, message: impl Into<String>) {
        let record = StatusRecord::now(message.into());
        info!("Status: {}", record.message);
        // send_replace succeeds even without receivers
        self.slot.send_replace(record);
    }

    pub fn current(&self) -> StatusRecord {
        self.slot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusRecord> {
        self.slot.subscribe()
    }
}
