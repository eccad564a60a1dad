//! Forwards orchestrator events to the `log` facade while debugging.

use crate::constants::DEBUG_PREFIX;
use crate::event::{Event, EventKind, EventListener};
use crate::event_bus::EventBus;

/// The listeners installed by `set_debug(true)`, one per event kind.
#[derive(Default)]
pub(crate) struct DebugSink {
    listeners: Vec<(EventKind, EventListener)>,
}

impl DebugSink {
    pub(crate) fn is_enabled(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub(crate) fn enable(&mut self, bus: &EventBus) {
        if self.is_enabled() {
            return;
        }
        for kind in EventKind::ALL {
            let listener = EventListener::new(move |event| {
                forward(kind, event);
                Ok(())
            });
            bus.add_event_listener(kind, listener.clone());
            self.listeners.push((kind, listener));
        }
    }

    pub(crate) fn disable(&mut self, bus: &EventBus) {
        for (kind, listener) in self.listeners.drain(..) {
            bus.remove_event_listener(kind, &listener);
        }
    }
}

fn forward(kind: EventKind, event: &Event) {
    match kind {
        EventKind::EventListenerError | EventKind::Error => {
            log::error!("{DEBUG_PREFIX} {kind} {event:?}");
        }
        EventKind::Warning | EventKind::RequestUndefinedAdWarning => {
            log::warn!("{DEBUG_PREFIX} {kind} {event:?}");
        }
        _ => log::info!("{DEBUG_PREFIX} {kind} {event:?}"),
    }
}
