//! Topic-keyed publish/subscribe.
//!
//! Dispatch iterates over a snapshot of a topic's subscriber list taken when
//! `publish` starts, so handlers may subscribe or unsubscribe (themselves or
//! others) mid-dispatch. No lock is held while a handler runs. A subscriber
//! removed mid-dispatch is skipped for the remainder of that publish.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::blocking::BlockingValue;
use crate::error::{BusError, HandlerResult};

/// Bound satisfied by every topic type.
pub trait Topic: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static> Topic for T {}

type Handler<V> = Arc<dyn Fn(&V) -> HandlerResult + Send + Sync>;

/// Identifier of one registration, unique per bus.
pub type SubscriptionId = u64;

struct Entry<V> {
    id: SubscriptionId,
    active: AtomicBool,
    once: bool,
    handler: Handler<V>,
}

struct Inner<K, V> {
    topics: RwLock<HashMap<K, Vec<Arc<Entry<V>>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<K: Topic, V> Inner<K, V> {
    fn remove(&self, topic: &K, id: SubscriptionId) -> bool {
        let mut topics = self.topics.write();
        let Some(entries) = topics.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| {
            if e.id == id {
                e.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        let removed = entries.len() != before;
        if entries.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

/// Handle returned by [`EventBus::subscribe`]; pass it to
/// [`EventBus::unsubscribe`] to remove the registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle<K> {
    topic: K,
    id: SubscriptionId,
}

impl<K> SubscriptionHandle<K> {
    pub fn topic(&self) -> &K {
        &self.topic
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// Scoped registration that unsubscribes when dropped.
///
/// Holds only a weak reference to the bus; dropping it after the bus is gone
/// is a no-op.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<K: Topic, V> {
    handle: SubscriptionHandle<K>,
    bus: Weak<Inner<K, V>>,
}

impl<K: Topic, V> Subscription<K, V> {
    pub fn handle(&self) -> &SubscriptionHandle<K> {
        &self.handle
    }
}

impl<K: Topic, V> Drop for Subscription<K, V> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.handle.topic, self.handle.id);
        }
    }
}

impl<K: Topic, V> fmt::Debug for Subscription<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers invoked.
    pub delivered: usize,
    /// Subscribers that returned an error or panicked.
    pub failed: usize,
}

/// Shared publish/subscribe bus, keyed by topic.
///
/// Cloning yields another handle to the same bus. The bus is torn down
/// explicitly with [`EventBus::close`].
pub struct EventBus<K: Topic, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K: Topic, V> Clone for EventBus<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Topic, V: 'static> Default for EventBus<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Topic, V: 'static> fmt::Debug for EventBus<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.inner.topics.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K: Topic, V: 'static> EventBus<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn register(
        &self,
        topic: K,
        once: bool,
        handler: Handler<V>,
    ) -> Result<SubscriptionHandle<K>, BusError> {
        let mut topics = self.inner.topics.write();
        // Checked under the lock so close() cannot race a registration in.
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        topics.entry(topic.clone()).or_default().push(Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            once,
            handler,
        }));
        Ok(SubscriptionHandle { topic, id })
    }

    /// Invoke `handler` for every future publish on `topic`, after the
    /// subscribers already registered there.
    pub fn subscribe<F>(&self, topic: K, handler: F) -> Result<SubscriptionHandle<K>, BusError>
    where
        F: Fn(&V) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(topic, false, Arc::new(handler))
    }

    /// Invoke `handler` for the next publish on `topic` only.
    pub fn subscribe_once<F>(&self, topic: K, handler: F) -> Result<SubscriptionHandle<K>, BusError>
    where
        F: FnOnce(&V) -> HandlerResult + Send + 'static,
    {
        let slot = Mutex::new(Some(handler));
        self.register(
            topic,
            true,
            Arc::new(move |value: &V| match slot.lock().take() {
                Some(handler) => handler(value),
                None => Ok(()),
            }),
        )
    }

    /// Like [`EventBus::subscribe`], unsubscribing when the guard drops.
    pub fn subscribe_scoped<F>(&self, topic: K, handler: F) -> Result<Subscription<K, V>, BusError>
    where
        F: Fn(&V) -> HandlerResult + Send + Sync + 'static,
    {
        let handle = self.subscribe(topic, handler)?;
        Ok(Subscription {
            handle,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Remove a registration. Returns whether anything was removed; calling
    /// it again, or after the bus closed, is harmless.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle<K>) -> bool {
        self.inner.remove(&handle.topic, handle.id)
    }

    /// Synchronously invoke every subscriber of `topic`, in registration
    /// order. Subscriber failures are logged and counted, never propagated.
    pub fn publish(&self, topic: &K, value: &V) -> PublishReport {
        let snapshot: Vec<Arc<Entry<V>>> = match self.inner.topics.read().get(topic) {
            Some(entries) => entries.clone(),
            None => return PublishReport::default(),
        };

        let mut report = PublishReport::default();
        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            if entry.once {
                // Claim the entry so a concurrent publish cannot fire it too.
                if !entry.active.swap(false, Ordering::AcqRel) {
                    continue;
                }
                self.inner.remove(topic, entry.id);
            }

            report.delivered += 1;
            match catch_unwind(AssertUnwindSafe(|| (entry.handler)(value))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(topic = ?topic, subscription = entry.id, error = %e, "subscriber failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        topic = ?topic,
                        subscription = entry.id,
                        panic = panic_message(panic.as_ref()),
                        "subscriber panicked"
                    );
                }
            }
        }
        report
    }

    /// Publish-driven wait: subscribe to `topic`, run `trigger`, and block
    /// until the next value arrives or `timeout` passes.
    pub fn wait_for<F>(&self, topic: K, timeout: Duration, trigger: F) -> Result<Option<V>, BusError>
    where
        V: Clone + Send,
        F: FnOnce(),
    {
        let slot = Arc::new(BlockingValue::new());
        let sink = Arc::clone(&slot);
        let _guard = self.subscribe_scoped(topic, move |value: &V| {
            sink.set(value.clone());
            Ok(())
        })?;
        trigger();
        Ok(slot.wait(timeout))
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &K) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Tear the bus down: drop every registration and reject new ones.
    /// Publishing to a closed bus reaches nobody.
    pub fn close(&self) {
        let mut topics = self.inner.topics.write();
        self.inner.closed.store(true, Ordering::Release);
        for entry in topics.values().flatten() {
            entry.active.store(false, Ordering::Release);
        }
        let dropped: usize = topics.values().map(Vec::len).sum();
        topics.clear();
        debug!(dropped, "event bus closed");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_unknown_topic_publishes_to_nobody() {
        let bus: EventBus<&'static str, u32> = EventBus::new();
        assert_eq!(bus.publish(&"nothing", &1), PublishReport::default());
    }

    #[test]
    fn test_subscriber_count_tracks_registrations() -> TestResult {
        let bus: EventBus<u8, ()> = EventBus::new();
        let a = bus.subscribe(1, |_| Ok(()))?;
        let _b = bus.subscribe(1, |_| Ok(()))?;
        assert_eq!(bus.subscriber_count(&1), 2);
        assert!(bus.unsubscribe(&a));
        assert_eq!(bus.subscriber_count(&1), 1);
        Ok(())
    }

    #[test]
    fn test_closed_bus_rejects_subscriptions() {
        let bus: EventBus<u8, ()> = EventBus::new();
        bus.close();
        assert_eq!(bus.subscribe(1, |_| Ok(())), Err(BusError::Closed));
        assert!(bus.is_closed());
    }
}
