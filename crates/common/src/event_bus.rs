//! Synchronous publish/subscribe bus with listener failure isolation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::event::{Event, EventKind, EventListener};

/// Delivers events to listeners registered for their kind.
///
/// Cloning the bus yields another handle to the same listener table; the
/// orchestrator and every plugin adapter share one bus.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Rc<RefCell<HashMap<EventKind, Vec<EventListener>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener` to the list for `kind`.
    ///
    /// Registering the same listener twice makes it run twice per event.
    pub fn add_event_listener(&self, kind: EventKind, listener: EventListener) {
        self.listeners
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Remove the first registration of `listener` for `kind`, if any.
    pub fn remove_event_listener(&self, kind: EventKind, listener: &EventListener) {
        let mut listeners = self.listeners.borrow_mut();
        if let Some(registered) = listeners.get_mut(&kind) {
            if let Some(index) = registered.iter().position(|l| l == listener) {
                registered.remove(index);
            }
        }
    }

    /// Number of listeners currently registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.borrow().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to a snapshot of the listeners for its kind.
    ///
    /// Listeners run in registration order. A listener error is re-emitted as
    /// [`Event::EventListenerError`], except when the failing listener was
    /// itself handling an `EventListenerError`; that failure is dropped.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let snapshot = match self.listeners.borrow().get(&kind) {
            Some(listeners) if !listeners.is_empty() => listeners.clone(),
            _ => return,
        };

        for listener in snapshot {
            let Err(error) = listener.invoke(&event) else {
                continue;
            };

            if kind == EventKind::EventListenerError {
                log::debug!("Dropping failure from eventListenerError listener: {error:?}");
                continue;
            }

            self.emit(Event::EventListenerError {
                error,
                listener,
                event_type: kind,
            });
        }
    }
}
