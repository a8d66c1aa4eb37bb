//! A value that notifies subscribers when it changes.

use std::fmt;

use parking_lot::RwLock;

use crate::bus::{EventBus, Subscription, SubscriptionHandle};
use crate::error::{BusError, HandlerResult};

/// Holds a value and publishes it to subscribers whenever `set` changes it.
/// Setting an equal value is silent.
pub struct Observable<T: Clone + PartialEq + Send + Sync + 'static> {
    value: RwLock<T>,
    listeners: EventBus<(), T>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: RwLock::new(initial),
            listeners: EventBus::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value. Returns whether it changed; only changes are
    /// dispatched.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.value.write();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        self.listeners.publish(&(), &value);
        true
    }

    pub fn subscribe<F>(&self, handler: F) -> Result<SubscriptionHandle<()>, BusError>
    where
        F: Fn(&T) -> HandlerResult + Send + Sync + 'static,
    {
        self.listeners.subscribe((), handler)
    }

    pub fn subscribe_scoped<F>(&self, handler: F) -> Result<Subscription<(), T>, BusError>
    where
        F: Fn(&T) -> HandlerResult + Send + Sync + 'static,
    {
        self.listeners.subscribe_scoped((), handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle<()>) -> bool {
        self.listeners.unsubscribe(handle)
    }
}

impl<T: Clone + PartialEq + Send + Sync + fmt::Debug + 'static> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Observable").field(&*self.value.read()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_dispatches_only_on_change() -> Result<(), BusError> {
        let observable = Observable::new(0u8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        observable.subscribe(move |v| {
            sink.lock().push(*v);
            Ok(())
        })?;

        assert!(observable.set(1));
        assert!(!observable.set(1));
        assert!(observable.set(2));
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(observable.get(), 2);
        Ok(())
    }
}
