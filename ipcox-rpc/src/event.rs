//! Minimal event emitter used for message and close notifications.
//!
//! Listeners are invoked synchronously, in registration order, on whichever task fires the event.
//! A panicking listener is logged and skipped; the remaining listeners still run.
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use ipcox_core::sync::MutexExt;

use crate::error;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

struct EmitterInner<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn listen(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock_unpoisoned()
            .push((id, Arc::new(listener)));

        let inner: Weak<EmitterInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.listeners.lock_unpoisoned().retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Invoke every listener with `event`, returning how many were invoked.
    pub fn fire(&self, event: &T) -> usize {
        // Snapshot so that listeners may subscribe or unsubscribe while being notified
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .lock_unpoisoned()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in &listeners {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                tracing::error!(
                    panic = %error::panic_err_to_string(panic),
                    "Event listener panicked"
                );
            }
        }

        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock_unpoisoned().len()
    }

    pub fn clear(&self) {
        self.inner.listeners.lock_unpoisoned().clear();
    }
}

/// Registration returned by [`Emitter::listen`].
///
/// The listener stays registered until [`Subscription::dispose`] is called; dropping the
/// subscription does not remove it.
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Remove the listener.  Calling this more than once has no further effect.
    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.dispose.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testing;

    #[test]
    fn listeners_receive_events_until_disposed() {
        let emitter = Emitter::<String>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut subscription = {
            let seen = seen.clone();
            emitter.listen(move |event: &String| seen.lock().unwrap().push(event.clone()))
        };

        assert_eq!(emitter.fire(&"one".to_string()), 1);
        subscription.dispose();
        subscription.dispose();
        assert_eq!(emitter.fire(&"two".to_string()), 0);

        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string()]);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        testing::init_test_logging();

        let emitter = Emitter::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _first = emitter.listen(|_| panic!("listener failure"));
        let _second = {
            let count = count.clone();
            emitter.listen(move |value: &u32| {
                count.fetch_add(*value as usize, Ordering::SeqCst);
            })
        };

        assert_eq!(emitter.fire(&5), 2);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn dropping_subscription_keeps_listener() {
        let emitter = Emitter::<()>::new();
        drop(emitter.listen(|_| {}));
        assert_eq!(emitter.listener_count(), 1);
    }
}
