//! Publishes events for objects
use async_trait::async_trait;
use chrono::Utc;
use keeper_core::{ErrorResponse, ObjectReference, Result, Time};
use parking_lot::Mutex;
use std::sync::Arc;

/// Required information to publish a new event via [`EventRecorder::publish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    /// The action that was taken (either successfully or unsuccessfully) against
    /// the referenced object.
    ///
    /// `action` must be machine-readable.
    pub action: String,
    /// The reason explaining why the `action` was taken.
    ///
    /// `reason` must be machine-readable, e.g. `Reconciled` or `CleanupFailed`.
    pub reason: String,
    /// A optional description of the status of the `action`.
    ///
    /// `note` must be human-readable.
    pub note: Option<String>,
    /// The event severity.
    pub event_type: EventType,
}

impl NewEvent {
    /// A [`EventType::Normal`] event
    pub fn normal(action: &str, reason: &str, note: impl Into<String>) -> Self {
        Self::new(EventType::Normal, action, reason, note.into())
    }

    /// A [`EventType::Warning`] event
    pub fn warning(action: &str, reason: &str, note: impl Into<String>) -> Self {
        Self::new(EventType::Warning, action, reason, note.into())
    }

    fn new(event_type: EventType, action: &str, reason: &str, note: String) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
            note: Some(note).filter(|n| !n.is_empty()),
            event_type,
        }
    }
}

/// The event severity or type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    /// An event took place - nothing to worry about.
    Normal,
    /// Something is not working as expected - it might be worth to have a look.
    Warning,
}

/// Details about the event emitter.
///
/// ```rust
/// use keeper_runtime::events::Reporter;
///
/// let reporter = Reporter::from("guestbook-controller");
/// assert_eq!(reporter.controller, "guestbook-controller");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reporter {
    /// The name of the controller publishing the event.
    ///
    /// E.g. `guestbook-controller`.
    pub controller: String,

    /// The name of the controller instance publishing the event.
    ///
    /// E.g. `guestbook-controller-abcdef`. Defaults to the hostname when it can be read
    /// from the environment.
    pub instance: Option<String>,
}

impl From<String> for Reporter {
    fn from(controller: String) -> Self {
        Self {
            controller,
            instance: std::env::var("HOSTNAME").ok(),
        }
    }
}

impl From<&str> for Reporter {
    fn from(controller: &str) -> Self {
        Self::from(controller.to_owned())
    }
}

/// A publisher abstraction to emit events about resources.
///
/// Publishing is fire-and-forget from the point of view of a reconciler: a failed publish
/// is logged and never fails the reconcile.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publish a new event about `regarding`.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`](keeper_core::Error) if the event sink rejected the event.
    async fn publish(&self, regarding: &ObjectReference, event: NewEvent) -> Result<()>;
}

/// An [`EventRecorder`] that turns events into `tracing` records
///
/// Normal events are logged at `info`, warnings at `warn`.
#[derive(Clone, Debug)]
pub struct TracingRecorder {
    reporter: Reporter,
}

impl TracingRecorder {
    /// Record events on behalf of `reporter`
    #[must_use]
    pub fn new(reporter: Reporter) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl EventRecorder for TracingRecorder {
    async fn publish(&self, regarding: &ObjectReference, event: NewEvent) -> Result<()> {
        let kind = regarding.kind.as_deref().unwrap_or_default();
        let name = regarding.name.as_deref().unwrap_or_default();
        let namespace = regarding.namespace.as_deref().unwrap_or_default();
        let note = event.note.as_deref().unwrap_or_default();
        let controller = self.reporter.controller.as_str();
        let instance = self.reporter.instance.as_deref().unwrap_or_default();
        match event.event_type {
            EventType::Normal => tracing::info!(
                target: "keeper::events",
                kind, name, namespace, controller, instance,
                action = %event.action, reason = %event.reason,
                "{note}"
            ),
            EventType::Warning => tracing::warn!(
                target: "keeper::events",
                kind, name, namespace, controller, instance,
                action = %event.action, reason = %event.reason,
                "{note}"
            ),
        }
        Ok(())
    }
}

/// An event captured by a [`MemoryRecorder`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// The object the event is about
    pub regarding: ObjectReference,
    /// The event itself
    pub event: NewEvent,
    /// When the event was published
    pub time: Time,
}

/// An [`EventRecorder`] that keeps every event in memory
///
/// Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    failures: Arc<Mutex<usize>>,
}

impl MemoryRecorder {
    /// An empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// The reasons of everything published so far, oldest first
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event.reason.clone()).collect()
    }

    /// Reject the next `count` publishes with a 503
    pub fn fail_next(&self, count: usize) {
        *self.failures.lock() += count;
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(&self, regarding: &ObjectReference, event: NewEvent) -> Result<()> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ErrorResponse::unavailable("event sink unavailable").into());
            }
        }
        self.events.lock().push(RecordedEvent {
            regarding: regarding.clone(),
            event,
            time: Utc::now(),
        });
        Ok(())
    }
}
