//! Server-side dispatch and event fan-out.
//!
//! An [`RpcServerWrap`] exposes the methods of a [`Router`] to any number of ports.  Each port
//! belongs to one sender and is served by its own [`RpcClient`], so every inbound call knows who
//! made it.  Events declared on the router are fanned out as notifications to the registered
//! ports, either to everyone except some senders or only to specific senders.
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use ipcox_core::sync::MutexExt;
use itertools::Itertools;
use serde::Serialize;

use crate::client::{RpcClient, RpcClientConfig};
use crate::connection::{CloseEvent, MessagePort, PortId};
use crate::context::{ContextBindings, RpcContext, SenderId};
use crate::event::Subscription;
use crate::router::{Router, rpc_method_name};
use crate::types::{JsonValue, ResponsePayload};
use crate::{Result, RpcError, handler};

/// Object-safe view of a server, so servers with different state types can sit behind one
/// lookup.
pub trait RpcServe: Send + Sync {
    /// Serve the calls `sender` makes through `port`, with `bindings` in the context of each.
    fn register_port(&self, sender: SenderId, port: Arc<dyn MessagePort>, bindings: ContextBindings) -> Result<()>;

    /// Stop serving `port`.  Returns whether it was registered.
    fn unregister_port(&self, sender: &SenderId, port: PortId) -> bool;

    /// Invoke `method` and return its result without suspending.
    fn call_method(
        &self,
        sender: &SenderId,
        method: &str,
        params: Vec<JsonValue>,
        bindings: &ContextBindings,
    ) -> Result<JsonValue>;
}

#[derive(Clone)]
pub struct RpcServerWrap<S: Clone + Send + Sync + 'static = ()> {
    inner: Arc<ServerInner<S>>,
}

struct ServerInner<S: Clone + Send + Sync + 'static> {
    router: Router<S>,
    config: RpcClientConfig,
    ports: Mutex<HashMap<SenderId, HashMap<PortId, PortEntry>>>,
}

struct PortEntry {
    client: RpcClient,
    close_subscription: Subscription,
}

impl<S: Clone + Send + Sync + 'static> RpcServerWrap<S> {
    pub fn new(router: Router<S>) -> Self {
        Self::with_config(router, RpcClientConfig::default())
    }

    /// The config is applied to the per-port clients that serve each port.
    pub fn with_config(router: Router<S>, config: RpcClientConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                router,
                config,
                ports: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> &Router<S> {
        &self.inner.router
    }

    /// Serve the calls `sender` makes through `port`.
    ///
    /// The port is unregistered automatically when it closes.  A port belongs to one sender at
    /// a time: registering a port that is already registered moves it to `sender`.
    pub fn register_port(&self, sender: SenderId, port: Arc<dyn MessagePort>) -> Result<()> {
        self.register_port_with_bindings(sender, port, ContextBindings::new())
    }

    /// Like [`Self::register_port`], adding `bindings` to the context of every call made through
    /// `port`.
    #[tracing::instrument(skip_all, fields(sender = %sender, port = %port.port_id()))]
    pub fn register_port_with_bindings(
        &self,
        sender: SenderId,
        port: Arc<dyn MessagePort>,
        bindings: ContextBindings,
    ) -> Result<()> {
        if port.is_closed() {
            return Err(RpcError::ConnectionClosed {
                reason: format!("{} is already closed", port.port_id()),
            });
        }

        let port_id = port.port_id();
        // Only one client may answer the requests arriving on a port
        for (previous_sender, entry) in self.inner.take_port(port_id) {
            tracing::warn!(previous_sender = %previous_sender, "Port was already registered; moving it");
            entry.dispose();
        }

        let client = RpcClient::for_port(port.clone(), self.inner.config.clone());

        let router = self.inner.router.clone();
        let request_sender = sender.clone();
        let request_bindings = bindings.clone();
        client.handle_request(move |method, params, token| {
            let context = RpcContext::new(request_sender.clone())
                .with_bindings(&request_bindings)
                .with_cancellation_token(token);
            let response = router.handle_method(handler::Request {
                method,
                params,
                context: Arc::new(context),
            });
            async move {
                match response.await {
                    ResponsePayload::Success(success) => Ok(success.result),
                    ResponsePayload::Error(error) => Err(error.error),
                }
            }
        })?;

        let router = self.inner.router.clone();
        let notification_sender = sender.clone();
        client.handle_notification(move |method, params| {
            let context = RpcContext::new(notification_sender.clone()).with_bindings(&bindings);
            router
                .handle_notification(handler::Request {
                    method,
                    params,
                    context: Arc::new(context),
                })
                .map(Ok)
        })?;

        let close_subscription = {
            let inner: Weak<ServerInner<S>> = Arc::downgrade(&self.inner);
            let sender = sender.clone();
            port.on_close(Box::new(move |event: &CloseEvent| {
                if let Some(inner) = inner.upgrade() {
                    tracing::debug!(%sender, port = %port_id, reason = %event.reason, "Port closed");
                    inner.unregister_port(&sender, port_id);
                }
            }))
        };

        tracing::debug!("Registering port");
        let replaced = self.inner.ports.lock_unpoisoned().entry(sender).or_default().insert(
            port_id,
            PortEntry {
                client,
                close_subscription,
            },
        );
        if let Some(replaced) = replaced {
            tracing::warn!("Port was already registered; replacing it");
            replaced.dispose();
        }

        Ok(())
    }

    /// Stop serving `port`.  When it was the last port of `sender`, the sender is forgotten.
    pub fn unregister_port(&self, sender: &SenderId, port: PortId) -> bool {
        self.inner.unregister_port(sender, port)
    }

    /// Invoke `method` on behalf of `sender` and return its result.
    ///
    /// This is the path for transports that answer synchronously.  The handler is polled
    /// exactly once and must complete without suspending; one that suspends fails with
    /// [`RpcError::NotSynchronous`] rather than blocking the caller.  Calls made this way cannot
    /// be cancelled.
    pub fn call_method(&self, sender: &SenderId, method: &str, params: Vec<JsonValue>) -> Result<JsonValue> {
        self.call_method_with_bindings(sender, method, params, &ContextBindings::new())
    }

    /// Like [`Self::call_method`], with `bindings` in the context of the call.
    pub fn call_method_with_bindings(
        &self,
        sender: &SenderId,
        method: &str,
        params: Vec<JsonValue>,
        bindings: &ContextBindings,
    ) -> Result<JsonValue> {
        let method = rpc_method_name(method).into_owned();
        let response = self.inner.router.handle_method(handler::Request {
            method: method.clone(),
            params,
            context: Arc::new(RpcContext::new(sender.clone()).with_bindings(bindings)),
        });

        match response.now_or_never() {
            Some(payload) => payload.into_result(&method),
            None => Err(RpcError::NotSynchronous { method }),
        }
    }

    /// Send `event` to every registered port, except the ports of the senders in `exceptions`.
    ///
    /// Returns how many ports the event was sent to.
    pub fn send_all<T: Serialize>(&self, event: &str, value: &T, exceptions: &[SenderId]) -> Result<usize> {
        let (event, value) = self.prepare_event(event, value)?;
        let clients: Vec<RpcClient> = self
            .inner
            .ports
            .lock_unpoisoned()
            .iter()
            .filter(|(sender, _)| !exceptions.contains(sender))
            .flat_map(|(_, ports)| ports.values().map(|entry| entry.client.clone()))
            .collect();

        Ok(Self::notify_all(&event, &value, clients))
    }

    /// Send `event` only to the ports of the senders in `targets`.  A sender listed more than
    /// once still gets the event once per port.
    ///
    /// Returns how many ports the event was sent to.
    pub fn send_to<T: Serialize>(&self, event: &str, value: &T, targets: &[SenderId]) -> Result<usize> {
        let (event, value) = self.prepare_event(event, value)?;
        let clients: Vec<RpcClient> = {
            let ports = self.inner.ports.lock_unpoisoned();
            targets
                .iter()
                .unique()
                .filter_map(|sender| ports.get(sender))
                .flat_map(|ports| ports.values().map(|entry| entry.client.clone()))
                .collect()
        };

        Ok(Self::notify_all(&event, &value, clients))
    }

    /// A typed handle for firing the declared event `event`.
    pub fn event<T: Serialize>(&self, event: &str) -> Result<RpcEvent<T, S>> {
        let event = rpc_method_name(event).into_owned();
        if !self.inner.router.has_event(&event) {
            return Err(RpcError::UnknownEvent { event });
        }
        Ok(RpcEvent {
            server: self.clone(),
            event,
            _value: PhantomData,
        })
    }

    /// Senders that currently have at least one registered port.
    pub fn senders(&self) -> Vec<SenderId> {
        self.inner.ports.lock_unpoisoned().keys().cloned().sorted().collect()
    }

    /// Number of registered ports, across all senders.
    pub fn port_count(&self) -> usize {
        self.inner.ports.lock_unpoisoned().values().map(HashMap::len).sum()
    }

    fn prepare_event<T: Serialize>(&self, event: &str, value: &T) -> Result<(String, JsonValue)> {
        let event = rpc_method_name(event).into_owned();
        if !self.inner.router.has_event(&event) {
            return Err(RpcError::UnknownEvent { event });
        }
        let value = serde_json::to_value(value).map_err(|source| RpcError::Serialize {
            source,
            type_name: std::any::type_name::<T>(),
        })?;
        Ok((event, value))
    }

    fn notify_all(event: &str, value: &JsonValue, clients: Vec<RpcClient>) -> usize {
        clients
            .into_iter()
            .filter(|client| match client.send_notification(event, vec![value.clone()]) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(%event, error = %e, "Failed to deliver event to port");
                    false
                }
            })
            .count()
    }
}

impl<S: Clone + Send + Sync + 'static> ServerInner<S> {
    /// Remove `port` from whichever senders it is registered with, forgetting senders left
    /// without ports.
    fn take_port(&self, port: PortId) -> Vec<(SenderId, PortEntry)> {
        let mut ports = self.ports.lock_unpoisoned();
        let taken: Vec<(SenderId, PortEntry)> = ports
            .iter_mut()
            .filter_map(|(sender, sender_ports)| Some((sender.clone(), sender_ports.remove(&port)?)))
            .collect();
        ports.retain(|_, sender_ports| !sender_ports.is_empty());
        taken
    }

    fn unregister_port(&self, sender: &SenderId, port: PortId) -> bool {
        let removed = {
            let mut ports = self.ports.lock_unpoisoned();
            let Some(sender_ports) = ports.get_mut(sender) else {
                return false;
            };
            let removed = sender_ports.remove(&port);
            if sender_ports.is_empty() {
                tracing::debug!(%sender, "Last port of sender closed; forgetting sender");
                ports.remove(sender);
            }
            removed
        };

        match removed {
            Some(entry) => {
                entry.dispose();
                true
            }
            None => false,
        }
    }
}

impl PortEntry {
    fn dispose(mut self) {
        self.close_subscription.dispose();
        self.client.dispose();
    }
}

impl<S: Clone + Send + Sync + 'static> RpcServe for RpcServerWrap<S> {
    fn register_port(&self, sender: SenderId, port: Arc<dyn MessagePort>, bindings: ContextBindings) -> Result<()> {
        self.register_port_with_bindings(sender, port, bindings)
    }

    fn unregister_port(&self, sender: &SenderId, port: PortId) -> bool {
        RpcServerWrap::unregister_port(self, sender, port)
    }

    fn call_method(
        &self,
        sender: &SenderId,
        method: &str,
        params: Vec<JsonValue>,
        bindings: &ContextBindings,
    ) -> Result<JsonValue> {
        self.call_method_with_bindings(sender, method, params, bindings)
    }
}

impl<S: Clone + Send + Sync + 'static> fmt::Debug for RpcServerWrap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServerWrap")
            .field("methods", &self.inner.router.methods())
            .field("events", &self.inner.router.events())
            .field("ports", &self.port_count())
            .finish()
    }
}

/// A declared event of an [`RpcServerWrap`], fired with values of type `T`.
#[derive(Debug)]
pub struct RpcEvent<T, S: Clone + Send + Sync + 'static = ()> {
    server: RpcServerWrap<S>,
    event: String,
    _value: PhantomData<fn(&T)>,
}

impl<T, S: Clone + Send + Sync + 'static> Clone for RpcEvent<T, S> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            event: self.event.clone(),
            _value: PhantomData,
        }
    }
}

impl<T: Serialize, S: Clone + Send + Sync + 'static> RpcEvent<T, S> {
    pub fn name(&self) -> &str {
        &self.event
    }

    /// Send to every registered port.
    pub fn fire(&self, value: &T) -> Result<usize> {
        self.server.send_all(&self.event, value, &[])
    }

    pub fn fire_except(&self, value: &T, exceptions: &[SenderId]) -> Result<usize> {
        self.server.send_all(&self.event, value, exceptions)
    }

    pub fn fire_to(&self, value: &T, targets: &[SenderId]) -> Result<usize> {
        self.server.send_to(&self.event, value, targets)
    }
}
