//! Shared error/event channel
//!
//! Every component reports noteworthy conditions here. The listener
//! supervisor watches for `Severity::Fatal` and tears the listeners down;
//! everything else is observational.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Capacity of each subscriber's queue. Slow subscribers lag rather than
/// block publishers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How serious an event is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    /// Requires every running listener to be closed
    Fatal,
}

impl Severity {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Severity::Fatal)
    }
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ListenerStarted,
    ListenerStopped,
    StartupFailure,
    SniFailure,
    DispatchFailure,
    Shutdown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ListenerStarted => "listener_started",
            EventKind::ListenerStopped => "listener_stopped",
            EventKind::StartupFailure => "startup_failure",
            EventKind::SniFailure => "sni_failure",
            EventKind::DispatchFailure => "dispatch_failure",
            EventKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event on the bus
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub severity: Severity,
    pub message: String,
    pub cause: Option<String>,
    pub info: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            cause: None,
            info: BTreeMap::new(),
        }
    }

    pub fn info(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Info, message)
    }

    pub fn warning(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Warning, message)
    }

    pub fn fatal(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Fatal, message)
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_info(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.info.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity.is_fatal()
    }
}

/// Fan-out publish/subscribe channel for [`Event`]s.
///
/// Cloning the bus yields another handle onto the same channel. The first
/// fatal event is also latched, so a receiver that lagged or subscribed
/// late can still observe it through [`EventBus::watch_fatal`].
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    first_fatal: Arc<watch::Sender<Option<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (first_fatal, _) = watch::channel(None);
        Self {
            tx,
            first_fatal: Arc::new(first_fatal),
        }
    }

    /// Enqueue an event for every current subscriber. Never blocks; an event
    /// published with no subscribers is not queued anywhere, but a fatal one
    /// is still latched.
    pub fn publish(&self, event: Event) {
        let fatal = event.is_fatal().then(|| event.clone());
        let _ = self.tx.send(event);

        // Latched after the broadcast so subscribers already hold the event
        // when anything watching the latch reacts to it
        if let Some(event) = fatal {
            self.first_fatal.send_if_modified(|first| {
                if first.is_none() {
                    *first = Some(event);
                    true
                } else {
                    false
                }
            });
        }
    }

    /// First fatal event ever published on this bus
    pub fn first_fatal(&self) -> Option<Event> {
        self.first_fatal.borrow().clone()
    }

    pub fn watch_fatal(&self) -> watch::Receiver<Option<Event>> {
        self.first_fatal.subscribe()
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
        Self::new()
    }
}
