//! User-facing error channel.

use log::error;
use serde::Serialize;
use tokio::sync::broadcast;

const NOTIFICATION_CAPACITY: usize = 64;

/// A short title plus the underlying fault description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserNotification {
    pub title: String,
    pub message: String,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<UserNotification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserNotification> {
        self.tx.subscribe()
    }

    pub fn notify(&self, title: impl Into<String>, message: impl Into<String>) {
        let notification = UserNotification {
            title: title.into(),
            message: message.into(),
        };
        error!("{}: {}", notification.title, notification.message);

        if self.tx.send(notification).is_err() {
            log::debug!("No one is listening for user notifications.");
        }
    }

    /// Surfaces an error with its full context chain.
    pub fn notify_error(&self, title: &str, err: &anyhow::Error) {
        self.notify(title, format!("{:#}", err));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
