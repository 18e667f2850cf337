//! ==============================================================================
//! notify.rs - disconnect and status notifications
//! ==============================================================================
//!
//! purpose:
//!     sessions and the manager report connection loss and status changes
//!     through the `NotificationSink` trait. nothing here knows about a ui.
//!
//! relationships:
//!     - used by: session (disconnects, "connected"), manager (warnings)
//!     - used by: api.rs (recent history for GET /api/notifications)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Default number of notifications kept for late readers
pub const DEFAULT_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Something an operator should see
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Disconnected {
        address: String,
        at: DateTime<Utc>,
    },
    Status {
        text: String,
        severity: Severity,
        at: DateTime<Utc>,
    },
}

/// Consumer of session notifications
pub trait NotificationSink: Send + Sync {
    fn on_disconnected(&self, device_address: &str);
    fn on_status_message(&self, text: &str, severity: Severity);
}

/// Broadcasts notifications to subscribers and keeps a short history
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
    recent: Mutex<VecDeque<Notification>>,
    history: usize,
}

impl NotificationHub {
    pub fn new(history: usize) -> Self {
        let (tx, _) = broadcast::channel(history.max(1));
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(history)),
            history,
        }
    }

    /// Live feed; lagging receivers lose the oldest messages
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Most recent notifications, oldest first
    pub fn recent(&self) -> Vec<Notification> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().cloned().collect()
    }

    fn publish(&self, notification: Notification) {
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() == self.history {
                recent.pop_front();
            }
            if self.history > 0 {
                recent.push_back(notification.clone());
            }
        }
        // no subscribers is fine
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl NotificationSink for NotificationHub {
    fn on_disconnected(&self, device_address: &str) {
        tracing::warn!(address = %device_address, "Sensor disconnected");
        self.publish(Notification::Disconnected {
            address: device_address.to_string(),
            at: Utc::now(),
        });
    }

    fn on_status_message(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Error => tracing::error!(message = %text, "Status"),
            Severity::Warning => tracing::warn!(message = %text, "Status"),
            Severity::Info | Severity::Success => tracing::info!(message = %text, "Status"),
        }
        self.publish(Notification::Status {
            text: text.to_string(),
            severity,
            at: Utc::now(),
        });
    }
}
