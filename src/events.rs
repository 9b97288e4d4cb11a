//! Ordered handler registry with in-iteration mutation safety.
//!
//! Handlers fire in insertion order. A handler added during dispatch is not
//! invoked until the *next* dispatch; a handler removed during dispatch is
//! skipped if it had not yet been visited. This is implemented with a
//! monotonically advancing cursor rather than draining into a temporary copy,
//! so removals during dispatch are visible to the rest of that same dispatch.

use std::collections::HashMap;

use tracing::trace;

pub type HandlerId = u64;

/// Names of events the transport dispatches. `Message`/`Connected`/
/// `Disconnected`/`Error` are handled by [`EventBus`] itself; any other
/// event name is the caller's responsibility to forward to the lower
/// transport's own listener API (see `crate::transport`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Message,
    Connected,
    Disconnected,
    Error,
}

struct Handler<T> {
    id: HandlerId,
    callback: Box<dyn FnMut(&T) + Send>,
}

struct Handlers<T> {
    entries: Vec<Handler<T>>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> Handlers<T> {
    fn add(&mut self, id: HandlerId, callback: Box<dyn FnMut(&T) + Send>) {
        self.entries.push(Handler { id, callback });
    }

    fn remove(&mut self, id: HandlerId, cursor: &mut usize) -> bool {
        if let Some(pos) = self.entries.iter().position(|h| h.id == id) {
            self.entries.remove(pos);
            if pos < *cursor {
                *cursor = cursor.saturating_sub(1);
            }
            true
        } else {
            false
        }
    }

    fn dispatch(&mut self, arg: &T) {
        let mut cursor = 0usize;
        while cursor < self.entries.len() {
            (self.entries[cursor].callback)(arg);
            cursor += 1;
        }
    }
}

/// A typed event dispatched to [`crate::events::EventBus`] listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connected,
    Disconnected,
    Object(serde_json::Value),
    Error { json: String, reason: String },
}

#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<Event, Handlers<Message>>,
    next_id: HandlerId,
    session_open: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event`. Returns an id usable with [`EventBus::off`].
    ///
    /// Late-subscriber coherence: registering for `Connected` while the
    /// session is already open (or `Disconnected` while it is not)
    /// immediately invokes the new handler with a synthetic event.
    pub fn on(&mut self, event: Event, mut callback: Box<dyn FnMut(&Message) + Send>) -> HandlerId {
        let id = self.next_id;
        self.next_id += 1;

        if event == Event::Connected && self.session_open {
            callback(&Message::Connected);
        } else if event == Event::Disconnected && !self.session_open {
            callback(&Message::Disconnected);
        }

        self.handlers.entry(event).or_default().add(id, callback);
        id
    }

    pub fn off(&mut self, event: Event, id: HandlerId) -> bool {
        match self.handlers.get_mut(&event) {
            Some(handlers) => {
                let mut dummy_cursor = usize::MAX;
                handlers.remove(id, &mut dummy_cursor)
            }
            None => false,
        }
    }

    pub fn emit(&mut self, event: Event, message: Message) {
        match event {
            Event::Connected => self.session_open = true,
            Event::Disconnected => self.session_open = false,
            _ => {}
        }
        trace!(?event, "dispatching event");
        if let Some(handlers) = self.handlers.get_mut(&event) {
            handlers.dispatch(&message);
        }
    }

    pub fn clear(&mut self, event: Event) {
        self.handlers.remove(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handlers_fire_in_insertion_order() {
        let mut bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        bus.on(Event::Message, Box::new(move |_| o1.lock().unwrap().push(1)));
        bus.on(Event::Message, Box::new(move |_| o2.lock().unwrap().push(2)));
        bus.emit(Event::Message, Message::Object(serde_json::json!(null)));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn handler_removed_before_being_visited_is_skipped() {
        let mut handlers: Handlers<()> = Handlers::default();
        let invoked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let i1 = invoked.clone();
        let i2 = invoked.clone();
        let i3 = invoked.clone();
        handlers.add(1, Box::new(move |_| i1.lock().unwrap().push(1)));
        handlers.add(2, Box::new(move |_| i2.lock().unwrap().push(2)));
        handlers.add(3, Box::new(move |_| i3.lock().unwrap().push(3)));

        let mut cursor = 0;
        // Simulate removing handler 2 before the dispatch loop reaches it.
        handlers.remove(2, &mut cursor);
        handlers.dispatch(&());
        assert_eq!(*invoked.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn late_connected_subscriber_gets_synthetic_event() {
        let mut bus = EventBus::new();
        bus.emit(Event::Connected, Message::Connected);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        bus.on(
            Event::Connected,
            Box::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_disconnected_subscriber_gets_synthetic_event_when_not_open() {
        let mut bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        bus.on(
            Event::Disconnected,
            Box::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
