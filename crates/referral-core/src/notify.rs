//! Boundary to whatever delivers notifications (push, e-mail, inbox).
//!
//! The engine persists every notification with the event that produced it
//! and only hands it to the sink after the batch has committed.

use parking_lot::Mutex;
use tracing::info;

use crate::model::Notification;

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &Notification);
}

/// Writes notifications to the `tracing` pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, notification: &Notification) {
        info!(
            target: "referral::notify",
            user = notification.user,
            kind = ?notification.kind,
            title = %notification.title,
            "{}",
            notification.message
        );
    }
}

/// Collects notifications in memory. Useful for tests and batch callers.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.delivered.lock())
    }
}

impl NotificationSink for MemorySink {
    fn deliver(&self, notification: &Notification) {
        self.delivered.lock().push(notification.clone());
    }
}
