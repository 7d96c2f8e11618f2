//! Synchronous typed event bus.
//!
//! The bus delivers events to handlers in registration order, on the
//! emitting task. A handler that panics is caught and logged; the remaining
//! handlers still run. [`EventBus::on`] returns a [`Subscription`] guard that
//! unregisters the handler when dropped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<E> = Box<dyn FnMut(&E) + Send>;

struct Registration<E> {
    id: u64,
    once: bool,
    handler: Handler<E>,
}

struct BusInner<E> {
    listeners: Mutex<Vec<Registration<E>>>,
    next_id: AtomicU64,
}

/// In-process pub/sub over a single event type.
///
/// Cloning the bus is cheap; clones share the same listener set.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn register(&self, once: bool, handler: Handler<E>) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("event bus lock poisoned")
            .push(Registration { id, once, handler });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Register a handler for every emitted event.
    pub fn on<F>(&self, handler: F) -> Subscription<E>
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.register(false, Box::new(handler))
    }

    /// Register a handler that fires for the next event only.
    pub fn once<F>(&self, handler: F) -> Subscription<E>
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.register(true, Box::new(handler))
    }

    /// Deliver `event` to all current handlers, in registration order.
    pub fn emit(&self, event: &E) {
        // Handlers run outside the lock so they may register/unregister
        // listeners of their own.
        let mut active = {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .expect("event bus lock poisoned");
            std::mem::take(&mut *listeners)
        };

        let mut retained: Vec<Registration<E>> = Vec::with_capacity(active.len());
        for mut reg in active.drain(..) {
            let outcome = catch_unwind(AssertUnwindSafe(|| (reg.handler)(event)));
            if let Err(panic) = outcome {
                let what = panic_message(&panic);
                tracing::error!(listener = reg.id, panic = %what, "event handler panicked");
            }
            if !reg.once {
                retained.push(reg);
            }
        }

        let mut listeners = self
            .inner
            .listeners
            .lock()
            .expect("event bus lock poisoned");
        // Listeners added during dispatch were pushed onto the (empty) shared
        // list; keep them after the surviving originals.
        let added = std::mem::replace(&mut *listeners, retained);
        listeners.extend(added);
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }

    /// True when no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Guard for a registered handler; dropping it unregisters the handler.
pub struct Subscription<E> {
    id: u64,
    bus: Weak<BusInner<E>>,
}

impl<E> Subscription<E> {
    /// Unregister the handler now. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Ok(mut listeners) = bus.listeners.lock() {
                listeners.retain(|reg| reg.id != self.id);
            }
        }
    }
}
