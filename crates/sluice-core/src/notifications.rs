//! Status notifications.
//!
//! Fire-and-forget events about listener state and finished exchanges,
//! fanned out to any number of subscribers (a UI, a log sink, tests).
//!
//! ## Delivery
//!
//! - Events are dropped when notifications are disabled
//! - Events are dropped when nobody is subscribed
//! - Slow subscribers lag and lose the oldest events, senders never block

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events buffered per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    /// Never started.
    #[default]
    None,
    /// Bound and accepting.
    Running,
    /// Stopped after running.
    Closed,
    /// Could not bind.
    Failure,
}

impl ListenerState {
    pub fn name(&self) -> &'static str {
        match self {
            ListenerState::None => "none",
            ListenerState::Running => "running",
            ListenerState::Closed => "closed",
            ListenerState::Failure => "failure",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something worth telling a front end about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StatusEvent {
    /// A listener changed state.
    Listener {
        name: String,
        address: String,
        state: ListenerState,
        note: Option<String>,
    },
    /// An exchange finished.
    Traffic {
        session_id: String,
        host: String,
        upload_bytes: u64,
        download_bytes: u64,
    },
}

impl StatusEvent {
    pub fn listener(
        name: impl Into<String>,
        address: impl Into<String>,
        state: ListenerState,
        note: Option<String>,
    ) -> Self {
        StatusEvent::Listener {
            name: name.into(),
            address: address.into(),
            state,
            note,
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Whether notifications are enabled.
    pub enabled: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl NotificationSettings {
    /// Creates new settings with notifications enabled.
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    /// Creates new settings with notifications disabled.
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Result of attempting to publish an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationResult {
    /// Delivered to this many subscribers.
    Sent(usize),
    /// No one is listening.
    NoSubscribers,
    /// Notifications are disabled.
    Disabled,
}

impl NotificationResult {
    /// Returns true if at least one subscriber got the event.
    pub fn was_sent(&self) -> bool {
        matches!(self, NotificationResult::Sent(_))
    }

    /// Returns true if notifications are disabled.
    pub fn was_disabled(&self) -> bool {
        matches!(self, NotificationResult::Disabled)
    }
}

/// Broadcasts [`StatusEvent`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<StatusEvent>,
    enabled: Arc<AtomicBool>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    /// Creates an enabled notifier.
    pub fn new() -> Self {
        Self::with_settings(NotificationSettings::default())
    }

    /// Creates a notifier with the given settings.
    pub fn with_settings(settings: NotificationSettings) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            enabled: Arc::new(AtomicBool::new(settings.enabled)),
        }
    }

    /// Returns a new receiver for subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Gets a copy of the current settings.
    pub fn settings(&self) -> NotificationSettings {
        NotificationSettings {
            enabled: self.is_enabled(),
        }
    }

    /// Publishes an event without waiting on anyone.
    pub fn notify(&self, event: StatusEvent) -> NotificationResult {
        if !self.is_enabled() {
            return NotificationResult::Disabled;
        }
        match self.tx.send(event) {
            Ok(n) => NotificationResult::Sent(n),
            Err(_) => NotificationResult::NoSubscribers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traffic() -> StatusEvent {
        StatusEvent::Traffic {
            session_id: "1-0001".into(),
            host: "example.com".into(),
            upload_bytes: 1000,
            download_bytes: 2000,
        }
    }

    // ==================== NotificationSettings Tests ====================

    #[test]
    fn settings_default_is_enabled() {
        assert!(NotificationSettings::default().enabled);
        assert!(!NotificationSettings::disabled().enabled);
    }

    // ==================== Notifier Tests ====================

    #[test]
    fn no_subscribers() {
        let notifier = Notifier::new();
        assert_eq!(notifier.notify(traffic()), NotificationResult::NoSubscribers);
    }

    #[test]
    fn disabled_drops_events() {
        let notifier = Notifier::with_settings(NotificationSettings::disabled());
        let mut rx = notifier.subscribe();
        assert!(notifier.notify(traffic()).was_disabled());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let notifier = Notifier::new();
        let mut a = notifier.subscribe();
        let mut b = notifier.clone().subscribe();

        let event = StatusEvent::listener("loopback", "127.0.0.1:8888", ListenerState::Running, None);
        assert_eq!(notifier.notify(event.clone()), NotificationResult::Sent(2));
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn toggle_enabled() {
        let notifier = Notifier::new();
        notifier.set_enabled(false);
        assert!(!notifier.settings().enabled);
        notifier.set_enabled(true);
        assert!(notifier.is_enabled());
    }

    #[test]
    fn event_json_is_tagged() {
        let json = serde_json::to_string(&traffic()).unwrap();
        assert!(json.contains(r#""type":"traffic""#));
    }
}
