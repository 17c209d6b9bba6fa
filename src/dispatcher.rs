//! Typed fan-out dispatcher for lifecycle events
//!
//! Handlers are keyed by [`EventType`] and invoked synchronously, in
//! registration order, with the event and an opaque per-connection context.
//!
//! A handler that returns an error or panics is logged and counted; the
//! remaining handlers still run and the publisher never sees the failure.
//!
//! # Re-entrancy
//!
//! A `publish` issued while a dispatch is already in progress (typically a
//! handler publishing a follow-up event) is appended to a FIFO and delivered
//! after every handler of the current event has run. Events are therefore
//! always delivered to completion one at a time, in publish order.

use crate::{EventType, LifecycleEvent};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tracing::{error, trace};

/// A registered event handler.
///
/// Handlers are compared by pointer identity, so keep the `Arc` around if you
/// need to [`unregister`](EventDispatcher::unregister) it later.
pub type Handler<C> = Arc<dyn Fn(&LifecycleEvent, &C) -> anyhow::Result<()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

pub struct EventDispatcher<C = ()> {
    handlers: Mutex<HashMap<EventType, Vec<Handler<C>>>>,
    pending: Mutex<VecDeque<(LifecycleEvent, C)>>,
    dispatching: AtomicBool,
    failures: AtomicU64,
}

impl<C> Default for EventDispatcher<C> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }
}

impl<C> fmt::Debug for EventDispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: usize = lock(&self.handlers).values().map(Vec::len).sum();
        f.debug_struct("EventDispatcher")
            .field("handlers", &handlers)
            .field("pending", &lock(&self.pending).len())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl<C> EventDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event_type`. Registering the same handler twice
    /// makes it run twice per event.
    pub fn register(&self, event_type: EventType, handler: Handler<C>) {
        lock(&self.handlers)
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Remove the first registration of `handler` for `event_type`.
    ///
    /// Returns `false` (and does nothing) if it was not registered.
    pub fn unregister(&self, event_type: EventType, handler: &Handler<C>) -> bool {
        let mut handlers = lock(&self.handlers);
        let Some(list) = handlers.get_mut(&event_type) else {
            return false;
        };
        let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            handlers.remove(&event_type);
        }
        true
    }

    /// Number of registrations for `event_type`
    pub fn handler_count(&self, event_type: EventType) -> usize {
        lock(&self.handlers).get(&event_type).map_or(0, Vec::len)
    }

    /// Total handler failures (errors and panics) since creation
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver `event` to every handler registered for its type.
    ///
    /// Publishing a type with no handlers is a no-op.
    pub fn publish(&self, event: LifecycleEvent, context: C) {
        lock(&self.pending).push_back((event, context));

        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Outer dispatch in progress; it drains the queue.
                return;
            }

            loop {
                let next = lock(&self.pending).pop_front();
                let Some((event, context)) = next else {
                    break;
                };
                self.dispatch(&event, &context);
            }

            self.dispatching.store(false, Ordering::Release);

            // An event queued between the final pop and the flag reset would
            // otherwise be stranded.
            if lock(&self.pending).is_empty() {
                return;
            }
        }
    }

    fn dispatch(&self, event: &LifecycleEvent, context: &C) {
        let event_type = event.event_type();
        // Snapshot so handlers may register/unregister without deadlocking.
        let handlers = match lock(&self.handlers).get(&event_type) {
            Some(list) => list.clone(),
            None => {
                trace!(%event_type, "no handlers registered");
                return;
            }
        };

        trace!(%event_type, session_id = event.session_id(), handlers = handlers.len(), "dispatching");

        for (index, handler) in handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event, context))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        %event_type,
                        session_id = event.session_id(),
                        handler = index,
                        error = %format_args!("{e:#}"),
                        "event handler failed"
                    );
                }
                Err(payload) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        %event_type,
                        session_id = event.session_id(),
                        handler = index,
                        panic = panic_message(payload.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
    }
}
