//! Per-connection demultiplexing of envelopes by channel.
//!
//! Many independent features can share one transport.  Each registers listeners for the channels
//! it cares about on a [`ChannelHandler`], which decodes inbound envelopes and hands the payload
//! to exactly the listeners of the envelope's channel.  Messages for channels nobody listens on
//! are not an error; they are meant for some other consumer of the transport.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use ipcox_core::binder::{BindKey, Binder, addr_of};
use ipcox_core::sync::MutexExt;
use serde::Serialize;

use crate::channel::ChannelDescriptor;
use crate::types::{Envelope, JsonValue};
use crate::{Result, RpcError, error};

/// Callback invoked with the dispatch context and the payload of a matching envelope.
pub type Listener<C> = Arc<ListenerFn<C>>;
pub type ListenerFn<C> = dyn Fn(&C, JsonValue) -> anyhow::Result<()> + Send + Sync;

/// Wrap a closure as a [`Listener`].  Keep the returned value to remove the listener later.
pub fn listener<C, F>(f: F) -> Listener<C>
where
    F: Fn(&C, JsonValue) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Registration<C> {
    listener: Listener<C>,
    once: bool,
}

impl<C> Clone for Registration<C> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            once: self.once,
        }
    }
}

pub struct ChannelHandler<C = ()> {
    listeners: Mutex<HashMap<String, Vec<Registration<C>>>>,
    bound: Binder<ListenerFn<C>>,
}

impl<C: 'static> Default for ChannelHandler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> ChannelHandler<C> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            bound: Binder::new(),
        }
    }

    /// Register a persistent listener for `channel`.
    pub fn on<T: ?Sized>(&self, channel: &ChannelDescriptor<T>, listener: Listener<C>) -> &Self {
        self.register(channel.channel(), listener, false);
        self
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once<T: ?Sized>(&self, channel: &ChannelDescriptor<T>, listener: Listener<C>) -> &Self {
        self.register(channel.channel(), listener, true);
        self
    }

    /// Bind `method` to `receiver`.
    ///
    /// Binding the same method to the same receiver again returns the identical listener, which
    /// is what makes [`Self::remove_listener`] work for listeners registered through
    /// [`Self::on_bound`].
    pub fn bind<R>(&self, receiver: &Arc<R>, method: fn(&R, &C, JsonValue) -> anyhow::Result<()>) -> Listener<C>
    where
        R: Send + Sync + 'static,
    {
        let key = BindKey::new(method as usize, addr_of(receiver));
        self.bound.bind_with(key, || {
            let receiver = receiver.clone();
            let bound: Listener<C> = Arc::new(move |context: &C, payload: JsonValue| {
                method(&receiver, context, payload)
            });
            bound
        })
    }

    pub fn on_bound<T: ?Sized, R>(
        &self,
        channel: &ChannelDescriptor<T>,
        receiver: &Arc<R>,
        method: fn(&R, &C, JsonValue) -> anyhow::Result<()>,
    ) -> &Self
    where
        R: Send + Sync + 'static,
    {
        let listener = self.bind(receiver, method);
        self.on(channel, listener)
    }

    fn register(&self, channel: &str, listener: Listener<C>, once: bool) {
        tracing::trace!(channel, once, "Registering channel listener");
        self.listeners
            .lock_unpoisoned()
            .entry(channel.to_string())
            .or_default()
            .push(Registration { listener, once });
    }

    /// Remove one registration of `listener` from `channel`.  Returns whether one was found.
    pub fn remove_listener<T: ?Sized>(&self, channel: &ChannelDescriptor<T>, listener: &Listener<C>) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock_unpoisoned();
            let Some(registrations) = listeners.get_mut(channel.channel()) else {
                return false;
            };
            let position = registrations
                .iter()
                .position(|registration| addr_of(&registration.listener) == addr_of(listener));
            if let Some(position) = position {
                registrations.remove(position);
            }
            if registrations.is_empty() {
                listeners.remove(channel.channel());
            }
            position.is_some()
        };

        if removed {
            self.release_binding_if_unused(listener);
        }
        removed
    }

    /// Remove every listener of one channel.
    pub fn remove_channel_listeners<T: ?Sized>(&self, channel: &ChannelDescriptor<T>) {
        let removed = self.listeners.lock_unpoisoned().remove(channel.channel());
        for registration in removed.into_iter().flatten() {
            self.release_binding_if_unused(&registration.listener);
        }
    }

    /// Remove every listener of every channel.
    pub fn remove_all_listeners(&self) {
        self.listeners.lock_unpoisoned().clear();
        self.bound.clear();
    }

    /// Drop the cached binding of a bound listener once no channel references it any more, so
    /// its receiver can be freed.
    fn release_binding_if_unused(&self, listener: &Listener<C>) {
        let Some(key) = self.bound.key_of(listener) else {
            return;
        };
        let still_registered = self
            .listeners
            .lock_unpoisoned()
            .values()
            .flatten()
            .any(|registration| addr_of(&registration.listener) == addr_of(listener));
        if !still_registered {
            self.bound.forget(key);
        }
    }

    pub fn has_listeners<T: ?Sized>(&self, channel: &ChannelDescriptor<T>) -> bool {
        self.listeners.lock_unpoisoned().contains_key(channel.channel())
    }

    /// Build the wire envelope carrying `payload` on `channel`.
    pub fn create_message<T: ?Sized, P: Serialize>(&self, channel: &ChannelDescriptor<T>, payload: &P) -> Result<String> {
        let payload = serde_json::to_value(payload).map_err(|source| RpcError::Serialize {
            source,
            type_name: std::any::type_name::<P>(),
        })?;
        let envelope = Envelope {
            channel: channel.channel().to_string(),
            payload,
        };
        serde_json::to_string(&envelope).map_err(|source| RpcError::Serialize {
            source,
            type_name: std::any::type_name::<Envelope>(),
        })
    }

    /// Decode `raw` and dispatch its payload to the listeners of its channel.
    ///
    /// Returns how many listeners were invoked.  A listener that fails or panics is logged and
    /// does not prevent the others from running.
    pub fn handle_message(&self, raw: &str, context: &C) -> Result<usize> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(|source| {
            tracing::warn!(error = %source, "Discarding message that is not a valid envelope");
            RpcError::ParseJson {
                source,
                message: raw.to_string(),
            }
        })?;

        let registrations = {
            let mut listeners = self.listeners.lock_unpoisoned();
            let Some(registrations) = listeners.get_mut(&envelope.channel) else {
                tracing::debug!(channel = %envelope.channel, "No listener for channel; dropping message");
                return Ok(0);
            };
            let snapshot = registrations.clone();
            registrations.retain(|registration| !registration.once);
            if registrations.is_empty() {
                listeners.remove(&envelope.channel);
            }
            snapshot
        };

        for registration in &registrations {
            let payload = envelope.payload.clone();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (registration.listener)(context, payload)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(channel = %envelope.channel, error = ?e, "Channel listener failed");
                }
                Err(panic) => {
                    tracing::error!(
                        channel = %envelope.channel,
                        panic = %error::panic_err_to_string(panic),
                        "Channel listener panicked"
                    );
                }
            }
            if registration.once {
                self.release_binding_if_unused(&registration.listener);
            }
        }

        Ok(registrations.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::testing;

    static GREETINGS: ChannelDescriptor<fn(String)> = ChannelDescriptor::new("test.greetings");
    static FAREWELLS: ChannelDescriptor<fn(String)> = ChannelDescriptor::new("test.farewells");

    fn counting_listener(count: &Arc<AtomicUsize>) -> Listener<()> {
        let count = count.clone();
        listener(move |_: &(), _payload| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn dispatches_by_channel() {
        testing::init_test_logging();

        let handler = ChannelHandler::<()>::new();
        let greetings = Arc::new(AtomicUsize::new(0));
        let farewells = Arc::new(AtomicUsize::new(0));
        handler
            .on(&GREETINGS, counting_listener(&greetings))
            .on(&FAREWELLS, counting_listener(&farewells));

        let message = handler.create_message(&GREETINGS, &"hello").unwrap();
        assert_eq!(handler.handle_message(&message, &()).unwrap(), 1);

        assert_eq!(greetings.load(Ordering::SeqCst), 1);
        assert_eq!(farewells.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_and_payload_reach_listener() {
        let handler = ChannelHandler::<String>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            handler.on(
                &GREETINGS,
                listener(move |sender: &String, payload| {
                    seen.lock().unwrap().push((sender.clone(), payload));
                    Ok(())
                }),
            );
        }

        let message = handler.create_message(&GREETINGS, &json!({"name": "bob"})).unwrap();
        handler.handle_message(&message, &"window-1".to_string()).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("window-1".to_string(), json!({"name": "bob"}))]
        );
    }

    #[test]
    fn unknown_channel_is_dropped() {
        testing::init_test_logging();

        let handler = ChannelHandler::<()>::new();
        let message = handler.create_message(&FAREWELLS, &"bye").unwrap();
        assert_eq!(handler.handle_message(&message, &()).unwrap(), 0);
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        testing::init_test_logging();

        let handler = ChannelHandler::<()>::new();
        assert_matches!(handler.handle_message("not json", &()), Err(RpcError::ParseJson { .. }));
        assert_matches!(
            handler.handle_message(r#"{"payload": 1}"#, &()),
            Err(RpcError::ParseJson { .. })
        );
    }

    #[test]
    fn once_listener_fires_once() {
        let handler = ChannelHandler::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        handler.once(&GREETINGS, counting_listener(&count));

        let message = handler.create_message(&GREETINGS, &"hi").unwrap();
        handler.handle_message(&message, &()).unwrap();
        handler.handle_message(&message, &()).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handler.has_listeners(&GREETINGS));
    }

    #[test]
    fn failing_listener_does_not_stop_dispatch() {
        testing::init_test_logging();

        let handler = ChannelHandler::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        handler
            .on(&GREETINGS, listener(|_: &(), _| anyhow::bail!("listener failed")))
            .on(&GREETINGS, listener(|_: &(), _| panic!("listener panicked")))
            .on(&GREETINGS, counting_listener(&count));

        let message = handler.create_message(&GREETINGS, &"hi").unwrap();
        assert_eq!(handler.handle_message(&message, &()).unwrap(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    struct Greeter {
        received: AtomicUsize,
    }

    impl Greeter {
        fn on_greeting(&self, _context: &(), _payload: JsonValue) -> anyhow::Result<()> {
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn bound_listener_can_be_removed() {
        let handler = ChannelHandler::<()>::new();
        let greeter = Arc::new(Greeter {
            received: AtomicUsize::new(0),
        });

        handler.on_bound(&GREETINGS, &greeter, Greeter::on_greeting);
        let message = handler.create_message(&GREETINGS, &"hi").unwrap();
        handler.handle_message(&message, &()).unwrap();

        // Binding again yields the listener that was registered
        let bound = handler.bind(&greeter, Greeter::on_greeting);
        assert!(handler.remove_listener(&GREETINGS, &bound));
        assert!(!handler.remove_listener(&GREETINGS, &bound));

        handler.handle_message(&message, &()).unwrap();
        assert_eq!(greeter.received.load(Ordering::SeqCst), 1);

        // Only the test's reference to the receiver remains once the binding is released
        drop(bound);
        assert_eq!(Arc::strong_count(&greeter), 1);
    }

    #[test]
    fn remove_all_listeners() {
        let handler = ChannelHandler::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        handler
            .on(&GREETINGS, counting_listener(&count))
            .on(&FAREWELLS, counting_listener(&count));

        handler.remove_channel_listeners(&FAREWELLS);
        assert!(handler.has_listeners(&GREETINGS));
        assert!(!handler.has_listeners(&FAREWELLS));

        handler.remove_all_listeners();
        let message = handler.create_message(&GREETINGS, &"hi").unwrap();
        assert_eq!(handler.handle_message(&message, &()).unwrap(), 0);
    }
}
