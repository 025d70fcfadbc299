//! Listener registration and dispatch.
//!
//! Sync and async listener shapes are adapted at registration time to one
//! internal invocation contract; the dispatch loop does not care which.
//! Dispatch runs on its own task fed by a queue, so a slow or panicking
//! listener never stalls property ingestion.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::store::Change;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum PropertyHook {
    Sync(Box<dyn Fn(&str, &Value) + Send + Sync>),
    Async(Box<dyn Fn(String, Value) -> BoxFuture + Send + Sync>),
}

enum MessageHook {
    Sync(Box<dyn Fn(&Value) + Send + Sync>),
    Async(Box<dyn Fn(Value) -> BoxFuture + Send + Sync>),
}

impl PropertyHook {
    fn invoke(&self, key: &str, value: &Value) {
        match self {
            Self::Sync(hook) => {
                if catch_unwind(AssertUnwindSafe(|| hook(key, value))).is_err() {
                    warn!(key, "property listener panicked");
                }
            }
            Self::Async(hook) => {
                tokio::spawn(hook(key.to_string(), value.clone()));
            }
        }
    }
}

impl MessageHook {
    fn invoke(&self, message: &Value) {
        match self {
            Self::Sync(hook) => {
                if catch_unwind(AssertUnwindSafe(|| hook(message))).is_err() {
                    warn!("message listener panicked");
                }
            }
            Self::Async(hook) => {
                tokio::spawn(hook(message.clone()));
            }
        }
    }
}

enum Event {
    Property(String, Value),
    Message(Value),
}

struct BusInner {
    next_id: AtomicU64,
    property_hooks: Mutex<Vec<(u64, Arc<PropertyHook>)>>,
    message_hooks: Mutex<Vec<(u64, Arc<MessageHook>)>>,
    tx: mpsc::UnboundedSender<Event>,
    /// Consumed once when the dispatch task starts.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

#[derive(Clone)]
pub(crate) struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                property_hooks: Mutex::new(Vec::new()),
                message_hooks: Mutex::new(Vec::new()),
                tx,
                rx: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Starts the dispatch task on first use. Idempotent; must run inside a
    /// runtime, so the connection path calls it rather than the constructor.
    pub(crate) fn ensure_dispatcher(&self) {
        let Some(mut rx) = self.inner.rx.lock().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    Event::Property(key, value) => {
                        let hooks: Vec<_> = inner
                            .property_hooks
                            .lock()
                            .iter()
                            .map(|(_, hook)| Arc::clone(hook))
                            .collect();
                        for hook in hooks {
                            hook.invoke(&key, &value);
                        }
                    }
                    Event::Message(message) => {
                        let hooks: Vec<_> = inner
                            .message_hooks
                            .lock()
                            .iter()
                            .map(|(_, hook)| Arc::clone(hook))
                            .collect();
                        for hook in hooks {
                            hook.invoke(&message);
                        }
                    }
                }
            }
        });
    }

    pub(crate) fn publish_changes(&self, changes: Vec<Change>) {
        for change in changes {
            let _ = self.inner.tx.send(Event::Property(change.key, change.value));
        }
    }

    pub(crate) fn publish_message(&self, message: Value) {
        let _ = self.inner.tx.send(Event::Message(message));
    }

    fn register_property(&self, hook: PropertyHook) -> CallbackHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.property_hooks.lock().push((id, Arc::new(hook)));
        CallbackHandle {
            id,
            slot: Slot::Property,
            bus: Arc::downgrade(&self.inner),
        }
    }

    fn register_message(&self, hook: MessageHook) -> CallbackHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.message_hooks.lock().push((id, Arc::new(hook)));
        CallbackHandle {
            id,
            slot: Slot::Message,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn on_property_change<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.register_property(PropertyHook::Sync(Box::new(listener)))
    }

    pub(crate) fn on_property_change_async<F, Fut>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_property(PropertyHook::Async(Box::new(move |key, value| {
            Box::pin(listener(key, value))
        })))
    }

    pub(crate) fn on_message<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register_message(MessageHook::Sync(Box::new(listener)))
    }

    pub(crate) fn on_message_async<F, Fut>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_message(MessageHook::Async(Box::new(move |message| {
            Box::pin(listener(message))
        })))
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Property,
    Message,
}

/// Registration handle; drop keeps the listener alive, `unsubscribe` removes
/// it. Listeners also die with the session they were registered on.
pub struct CallbackHandle {
    id: u64,
    slot: Slot,
    bus: Weak<BusInner>,
}

impl CallbackHandle {
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        match self.slot {
            Slot::Property => bus.property_hooks.lock().retain(|(id, _)| *id != self.id),
            Slot::Message => bus.message_hooks.lock().retain(|(id, _)| *id != self.id),
        }
    }
}
