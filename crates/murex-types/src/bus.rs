//! Per-component publish/subscribe with a wildcard sink.
//!
//! Composition-friendly replacement for event-emitter inheritance: each
//! agent manager and each kernel owns its own `EventBus`. Delivery is
//! synchronous on the publishing task — typed subscribers first, then the
//! wildcard list. Handler lists are snapshotted before invocation so a
//! handler may subscribe or unsubscribe reentrantly without deadlocking.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Types that can ride an [`EventBus`].
pub trait BusEvent: Clone + Send + 'static {
    /// Typed subscription key; one per event name.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Opaque subscription token returned by [`EventBus::on`] / [`EventBus::on_any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A synchronous event bus with typed channels and a wildcard sink.
pub struct EventBus<E: BusEvent> {
    typed: Mutex<HashMap<E::Kind, Vec<(HandlerId, Handler<E>)>>>,
    wildcard: Mutex<Vec<(HandlerId, Handler<E>)>>,
    /// Soft cap across all subscriptions; exceeding it warns, never errors.
    max_listeners: usize,
    next_id: AtomicU64,
}

impl<E: BusEvent> EventBus<E> {
    /// Create a bus with the given listener cap.
    pub fn new(max_listeners: usize) -> Self {
        Self {
            typed: Mutex::new(HashMap::new()),
            wildcard: Mutex::new(Vec::new()),
            max_listeners,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to one event kind.
    pub fn on(&self, kind: E::Kind, handler: impl Fn(&E) + Send + Sync + 'static) -> HandlerId {
        let id = self.next_handler_id();
        {
            let mut typed = self.typed.lock().unwrap_or_else(|e| e.into_inner());
            typed.entry(kind).or_default().push((id, Arc::new(handler)));
        }
        self.warn_if_over_cap();
        id
    }

    /// Subscribe to every event; receives the full envelope.
    pub fn on_any(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> HandlerId {
        let id = self.next_handler_id();
        {
            let mut wildcard = self.wildcard.lock().unwrap_or_else(|e| e.into_inner());
            wildcard.push((id, Arc::new(handler)));
        }
        self.warn_if_over_cap();
        id
    }

    /// Remove a typed subscription. Returns whether it was present.
    pub fn off(&self, kind: E::Kind, id: HandlerId) -> bool {
        let mut typed = self.typed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handlers) = typed.get_mut(&kind) {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            return handlers.len() != before;
        }
        false
    }

    /// Remove a wildcard subscription. Returns whether it was present.
    pub fn off_any(&self, id: HandlerId) -> bool {
        let mut wildcard = self.wildcard.lock().unwrap_or_else(|e| e.into_inner());
        let before = wildcard.len();
        wildcard.retain(|(h, _)| *h != id);
        wildcard.len() != before
    }

    /// Publish an event: typed subscribers first, wildcard sink after, in
    /// subscription order, synchronously on the caller's task.
    pub fn emit(&self, event: &E) {
        let typed: Vec<Handler<E>> = {
            let map = self.typed.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&event.kind())
                .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in typed {
            handler(event);
        }

        let wildcard: Vec<Handler<E>> = {
            let list = self.wildcard.lock().unwrap_or_else(|e| e.into_inner());
            list.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in wildcard {
            handler(event);
        }
    }

    /// Total subscription count across typed channels and the wildcard sink.
    pub fn listener_count(&self) -> usize {
        let typed = self.typed.lock().unwrap_or_else(|e| e.into_inner());
        let wildcard = self.wildcard.lock().unwrap_or_else(|e| e.into_inner());
        typed.values().map(Vec::len).sum::<usize>() + wildcard.len()
    }

    fn warn_if_over_cap(&self) {
        let count = self.listener_count();
        if count > self.max_listeners {
            warn!(
                listeners = count,
                cap = self.max_listeners,
                "Event bus listener cap exceeded; possible subscription leak"
            );
        }
    }
}
