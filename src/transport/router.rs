//! Event router
//!
//! Keeps the subscriber registry and fans notifications out to handlers.
//! Dispatch runs on the driver task, one notification at a time, so handlers
//! observe events in line order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::events::{Event, EventKind};
use crate::protocol::Notification;

pub(crate) type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by `Connection::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A handler failure, or a payload that failed validation
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub event: String,
    pub message: String,
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.event, self.message)
    }
}

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
pub(crate) struct EventRouter {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl EventRouter {
    pub fn subscribe(&mut self, kind: EventKind, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.push(Subscription { id, kind, handler });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.subscriptions.iter().any(|s| s.kind == kind)
    }

    /// Handlers for `kind` in registration order
    fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        self.subscriptions
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }
}

pub(crate) fn lock(router: &Mutex<EventRouter>) -> MutexGuard<'_, EventRouter> {
    // Handlers never run under the lock, so a poisoned registry is still consistent
    router.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deliver one notification to every subscriber of its kind.
///
/// The registry lock is released before any handler runs, so handlers may
/// subscribe or unsubscribe. A failing or panicking handler does not stop
/// delivery to the rest.
pub(crate) fn dispatch(router: &Mutex<EventRouter>, notification: &Notification) -> Vec<HandlerError> {
    let Some(kind) = EventKind::from_wire(&notification.name) else {
        log::debug!("dropping unknown notification `{}`", notification.name);
        return Vec::new();
    };

    let handlers = lock(router).handlers_for(kind);
    if handlers.is_empty() {
        log::trace!("no subscribers for `{}`", notification.name);
        return Vec::new();
    }

    let event = match Event::from_notification(notification) {
        Ok(event) => event,
        Err(e) => {
            return vec![HandlerError {
                event: notification.name.clone(),
                message: e.to_string(),
            }];
        }
    };

    let mut errors = Vec::new();
    for handler in handlers {
        let message = match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };
        errors.push(HandlerError {
            event: notification.name.clone(),
            message,
        });
    }
    errors
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
