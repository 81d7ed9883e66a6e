//! Serving servers to a remote [`ProxyProvider`](crate::ProxyProvider) over a multiplexed
//! connection.
//!
//! The proxy side opens a control channel named [`HOST_CHANNEL`] and asks for a server by path
//! with `create` (or `createSync`).  The host resolves the path through its
//! [`RpcServerProvider`], and answers with a numeric proxy id.  The proxy side then opens a
//! port-forward channel `rpc.portForward/<proxyId>`, which the host registers as a port of that
//! server for asynchronous traffic.  `requestSync` on the control channel reaches the server's
//! synchronous path directly.  A proxy is forgotten once its port-forward channel closes.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use ipcox_core::sync::{MutexExt, RwLockExt};
use serde::de::DeserializeOwned;

use crate::channel::RPC_CHANNELS;
use crate::client::{RpcClient, RpcClientConfig};
use crate::context::{ContextBindings, SenderId};
use crate::event::Subscription;
use crate::multiplexer::{Channel, ChannelMultiplexer};
use crate::server::RpcServe;
use crate::types::{ErrorDetails, JsonValue};
use crate::{CloseEvent, MessagePort, Result, RpcError};

/// Id of the control channel.
pub const HOST_CHANNEL: &str = "rpc.host";

/// Id of the channel that forwards the asynchronous traffic of proxy `proxy_id`.
pub fn port_forward_channel(proxy_id: u64) -> String {
    format!("{}/{proxy_id}", RPC_CHANNELS.port_forward.channel())
}

fn parse_port_forward_channel(id: &str) -> Option<u64> {
    id.strip_prefix(RPC_CHANNELS.port_forward.channel())?
        .strip_prefix('/')?
        .parse()
        .ok()
}

/// Looks up the server registered at a path.
pub trait RpcServerProvider: Send + Sync {
    fn server(&self, path: &str) -> Option<Arc<dyn RpcServe>>;
}

impl<F> RpcServerProvider for F
where
    F: Fn(&str) -> Option<Arc<dyn RpcServe>> + Send + Sync,
{
    fn server(&self, path: &str) -> Option<Arc<dyn RpcServe>> {
        self(path)
    }
}

/// Path-keyed [`RpcServerProvider`].
#[derive(Default)]
pub struct RpcServerRegistry {
    servers: RwLock<HashMap<String, Arc<dyn RpcServe>>>,
}

impl RpcServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` at `path`.  A path that is already taken keeps its server and `false`
    /// is returned.
    pub fn register(&self, path: impl Into<String>, server: Arc<dyn RpcServe>) -> bool {
        let path = path.into();
        let mut servers = self.servers.write_unpoisoned();
        if servers.contains_key(&path) {
            tracing::warn!(%path, "A server is already registered at this path");
            return false;
        }
        servers.insert(path, server);
        true
    }

    pub fn unregister(&self, path: &str) -> Option<Arc<dyn RpcServe>> {
        self.servers.write_unpoisoned().remove(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.servers.read_unpoisoned().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl RpcServerProvider for RpcServerRegistry {
    fn server(&self, path: &str) -> Option<Arc<dyn RpcServe>> {
        self.servers.read_unpoisoned().get(path).cloned()
    }
}

/// Serves the servers of an [`RpcServerProvider`] to one sender, over one multiplexed
/// connection.
#[derive(Clone)]
pub struct RpcServerHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    sender: SenderId,
    multiplexer: ChannelMultiplexer,
    provider: Arc<dyn RpcServerProvider>,
    config: RpcClientConfig,
    bindings: RwLock<ContextBindings>,
    next_proxy_id: AtomicU64,
    proxies: Mutex<HashMap<u64, HostedProxy>>,
    control: Mutex<Option<RpcClient>>,
    subscription: Mutex<Option<Subscription>>,
}

struct HostedProxy {
    path: String,
    server: Arc<dyn RpcServe>,
}

impl RpcServerHost {
    /// Start serving the channels `sender` opens on `multiplexer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn serve(sender: SenderId, multiplexer: ChannelMultiplexer, provider: Arc<dyn RpcServerProvider>) -> Self {
        Self::with_config(sender, multiplexer, provider, RpcClientConfig::default())
    }

    pub fn with_config(
        sender: SenderId,
        multiplexer: ChannelMultiplexer,
        provider: Arc<dyn RpcServerProvider>,
        config: RpcClientConfig,
    ) -> Self {
        let inner = Arc::new(HostInner {
            sender,
            multiplexer: multiplexer.clone(),
            provider,
            config,
            bindings: RwLock::new(ContextBindings::new()),
            next_proxy_id: AtomicU64::new(1),
            proxies: Mutex::new(HashMap::new()),
            control: Mutex::new(None),
            subscription: Mutex::new(None),
        });

        let subscription = {
            let inner: Weak<HostInner> = Arc::downgrade(&inner);
            multiplexer.on_did_open_channel(move |channel: &Channel| {
                if let Some(inner) = inner.upgrade() {
                    inner.on_did_open_channel(channel);
                }
            })
        };
        *inner.subscription.lock_unpoisoned() = Some(subscription);

        Self { inner }
    }

    pub fn sender(&self) -> &SenderId {
        &self.inner.sender
    }

    /// Bind `value` into the context of every call this host serves from now on.
    pub fn bind<T: Send + Sync + 'static>(&self, value: T) -> &Self {
        self.inner.bindings.write_unpoisoned().insert(value);
        self
    }

    /// Paths of the servers handed out so far, by proxy id.
    pub fn proxies(&self) -> Vec<(u64, String)> {
        let mut proxies: Vec<(u64, String)> = self
            .inner
            .proxies
            .lock_unpoisoned()
            .iter()
            .map(|(id, proxy)| (*id, proxy.path.clone()))
            .collect();
        proxies.sort();
        proxies
    }

    /// Stop accepting channels.  Channels already served are left alone.
    pub fn dispose(&self) {
        if let Some(mut subscription) = self.inner.subscription.lock_unpoisoned().take() {
            subscription.dispose();
        }
        if let Some(control) = self.inner.control.lock_unpoisoned().take() {
            control.dispose();
        }
    }
}

impl HostInner {
    fn on_did_open_channel(self: &Arc<Self>, channel: &Channel) {
        if channel.id() == HOST_CHANNEL {
            self.serve_control(channel);
        } else if let Some(proxy_id) = parse_port_forward_channel(channel.id()) {
            self.forward_port(proxy_id, channel);
        }
    }

    fn serve_control(self: &Arc<Self>, channel: &Channel) {
        tracing::debug!(sender = %self.sender, "Serving control channel");
        let control = RpcClient::for_port(Arc::new(channel.clone()), self.config.clone());

        let inner: Weak<HostInner> = Arc::downgrade(self);
        let installed = control.handle_request(move |method, params, _token| {
            let outcome = match inner.upgrade() {
                Some(inner) => inner.handle_control_request(&method, params),
                None => Err(ErrorDetails::internal_error("Server host is gone", None)),
            };
            futures::future::ready(outcome)
        });
        if let Err(e) = installed {
            tracing::warn!(error = %e, "Failed to serve control channel");
            return;
        }

        if let Some(previous) = self.control.lock_unpoisoned().replace(control) {
            previous.dispose();
        }
    }

    fn handle_control_request(&self, method: &str, params: Vec<JsonValue>) -> Result<JsonValue, ErrorDetails> {
        let create = RPC_CHANNELS.create.member();
        let create_sync = RPC_CHANNELS.create_sync.member();
        let request_sync = RPC_CHANNELS.request_sync.member();

        if method == create || method == create_sync {
            let (path,): (String,) = from_params(params)?;
            let server = self.provider.server(&path).ok_or_else(|| RpcError::UnknownServer { path: path.clone() })?;

            let proxy_id = self.next_proxy_id.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(sender = %self.sender, %path, proxy_id, "Created proxy");
            self.proxies
                .lock_unpoisoned()
                .insert(proxy_id, HostedProxy { path, server });
            Ok(JsonValue::from(proxy_id))
        } else if method == request_sync {
            let (proxy_id, method, params): (u64, String, Vec<JsonValue>) = from_params(params)?;
            let server = self.server_of(proxy_id)?;
            let bindings = self.bindings.read_unpoisoned().clone();
            Ok(server.call_method(&self.sender, &method, params, &bindings)?)
        } else {
            Err(ErrorDetails::method_not_found(
                format!("No callable method '{method}'"),
                None,
            ))
        }
    }

    fn forward_port(self: &Arc<Self>, proxy_id: u64, channel: &Channel) {
        let server = match self.server_of(proxy_id) {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(proxy_id, error = ?e, "Port forward for unknown proxy");
                // Close once the opener has been told the channel is ready
                let channel = channel.clone();
                tokio::spawn(async move { channel.close("Unknown proxy") });
                return;
            }
        };

        tracing::debug!(sender = %self.sender, proxy_id, "Forwarding port");
        let forget_proxy = {
            let inner: Weak<HostInner> = Arc::downgrade(self);
            move |reason: &str| {
                if let Some(inner) = inner.upgrade() {
                    tracing::debug!(proxy_id, %reason, "Port forward closed; forgetting proxy");
                    inner.proxies.lock_unpoisoned().remove(&proxy_id);
                }
            }
        };

        let bindings = self.bindings.read_unpoisoned().clone();
        if let Err(e) = server.register_port(self.sender.clone(), Arc::new(channel.clone()), bindings) {
            tracing::warn!(proxy_id, error = %e, "Failed to register forwarded port");
            forget_proxy("not registered");
            return;
        }

        // Lives as long as the channel; it only fires once
        let _ = channel.on_close(Box::new(move |event: &CloseEvent| forget_proxy(&event.reason)));
    }

    fn server_of(&self, proxy_id: u64) -> Result<Arc<dyn RpcServe>, ErrorDetails> {
        self.proxies
            .lock_unpoisoned()
            .get(&proxy_id)
            .map(|proxy| proxy.server.clone())
            .ok_or_else(|| ErrorDetails::invalid_params(format!("Unknown proxy {proxy_id}"), None))
    }
}

fn from_params<T: DeserializeOwned>(params: Vec<JsonValue>) -> Result<T, RpcError> {
    let value = JsonValue::Array(params);
    serde_json::from_value(value.clone()).map_err(|source| RpcError::Deserialize {
        source,
        type_name: std::any::type_name::<T>(),
        value,
    })
}
