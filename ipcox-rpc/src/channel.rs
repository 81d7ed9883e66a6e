//! Channel descriptors and namespaces.
//!
//! A [`ChannelDescriptor`] names one logical message channel and carries, as a phantom type, the
//! signature of the messages that travel on it.  Descriptors are plain constants; nothing is
//! registered by creating one.  Uniqueness of channel and namespace names is tracked by an
//! explicit [`ChannelRegistry`] owned by whoever bootstraps the process.
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Mutex;

use ipcox_core::sync::MutexExt;

use crate::types::{Cancel, Notification, Request, Response};

/// Typed token identifying one channel.
///
/// `T` is never instantiated; it documents (and lets the compiler check) what is sent on the
/// channel, usually as a function signature like `fn(Request)`.
pub struct ChannelDescriptor<T: ?Sized> {
    channel: Cow<'static, str>,
    _signature: PhantomData<fn() -> PhantomData<T>>,
}

impl<T: ?Sized> ChannelDescriptor<T> {
    pub const fn new(channel: &'static str) -> Self {
        Self {
            channel: Cow::Borrowed(channel),
            _signature: PhantomData,
        }
    }

    pub fn from_string(channel: String) -> Self {
        Self {
            channel: Cow::Owned(channel),
            _signature: PhantomData,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The part of the channel name after the namespace prefix.
    pub fn member(&self) -> &str {
        self.channel
            .rsplit_once('.')
            .map(|(_, member)| member)
            .unwrap_or(self.channel())
    }
}

impl<T: ?Sized> Clone for ChannelDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            _signature: PhantomData,
        }
    }
}

impl<T: ?Sized> PartialEq for ChannelDescriptor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel
    }
}

impl<T: ?Sized> Eq for ChannelDescriptor<T> {}

impl<T: ?Sized> Hash for ChannelDescriptor<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.channel.hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for ChannelDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelDescriptor").field(&self.channel).finish()
    }
}

impl<T: ?Sized> fmt::Display for ChannelDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel)
    }
}

/// A group of channels sharing the `"<name>."` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    name: Cow<'static, str>,
}

impl Namespace {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel<T: ?Sized>(&self, member: &str) -> ChannelDescriptor<T> {
        ChannelDescriptor::from_string(format!("{}.{member}", self.name))
    }
}

/// Process-wide bookkeeping of channel and namespace names.
///
/// Duplicates are a configuration mistake but never fatal: they are logged and reported back as
/// `false`, and the first registration stays in place.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    channels: HashSet<String>,
    namespaces: HashSet<String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything registered so far.
    pub fn init(&self) {
        let mut state = self.state.lock_unpoisoned();
        state.channels.clear();
        state.namespaces.clear();
    }

    pub fn register_channel<T: ?Sized>(&self, descriptor: &ChannelDescriptor<T>) -> bool {
        let inserted = self
            .state
            .lock_unpoisoned()
            .channels
            .insert(descriptor.channel().to_string());
        if !inserted {
            tracing::warn!(channel = %descriptor, "Channel is already registered");
        }
        inserted
    }

    pub fn register_namespace(&self, namespace: &Namespace) -> bool {
        let inserted = self
            .state
            .lock_unpoisoned()
            .namespaces
            .insert(namespace.name().to_string());
        if !inserted {
            tracing::warn!(namespace = namespace.name(), "Namespace is already registered");
        }
        inserted
    }

    pub fn is_channel_registered(&self, channel: &str) -> bool {
        self.state.lock_unpoisoned().channels.contains(channel)
    }

    /// Register the reserved RPC namespace and all of its channels.
    pub fn register_rpc_channels(&self) -> bool {
        let channels = &RPC_CHANNELS;
        let mut all_new = self.register_namespace(&channels.namespace);
        all_new &= self.register_channel(&channels.create);
        all_new &= self.register_channel(&channels.create_sync);
        all_new &= self.register_channel(&channels.request_sync);
        all_new &= self.register_channel(&channels.port_forward);
        all_new &= self.register_channel(&channels.notification);
        all_new &= self.register_channel(&channels.request);
        all_new &= self.register_channel(&channels.response);
        all_new &= self.register_channel(&channels.cancel);
        all_new
    }
}

/// Channels reserved by the RPC protocol.
pub struct RpcChannels {
    pub namespace: Namespace,
    /// Open a server-bound proxy; answers with a numeric proxy ID.
    pub create: ChannelDescriptor<fn(String) -> u64>,
    pub create_sync: ChannelDescriptor<fn(String) -> u64>,
    /// Synchronous call keyed by proxy ID, method and params.
    pub request_sync: ChannelDescriptor<fn(u64, String, Vec<crate::JsonValue>) -> crate::JsonValue>,
    /// Prefix of the channels handed over for a proxy's asynchronous traffic.
    pub port_forward: ChannelDescriptor<fn(u64)>,
    pub notification: ChannelDescriptor<fn(Notification)>,
    pub request: ChannelDescriptor<fn(Request)>,
    pub response: ChannelDescriptor<fn(Response)>,
    pub cancel: ChannelDescriptor<fn(Cancel)>,
}

pub static RPC_CHANNELS: RpcChannels = RpcChannels {
    namespace: Namespace::new("rpc"),
    create: ChannelDescriptor::new("rpc.create"),
    create_sync: ChannelDescriptor::new("rpc.createSync"),
    request_sync: ChannelDescriptor::new("rpc.requestSync"),
    port_forward: ChannelDescriptor::new("rpc.portForward"),
    notification: ChannelDescriptor::new("rpc.notification"),
    request: ChannelDescriptor::new("rpc.request"),
    response: ChannelDescriptor::new("rpc.response"),
    cancel: ChannelDescriptor::new("rpc.cancel"),
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn namespace_builds_prefixed_channels() {
        let window = Namespace::new("window");
        let zoom: ChannelDescriptor<fn() -> f64> = window.channel("getZoomLevel");

        assert_eq!(zoom.channel(), "window.getZoomLevel");
        assert_eq!(zoom.member(), "getZoomLevel");
        assert_eq!(zoom, ChannelDescriptor::new("window.getZoomLevel"));
    }

    #[test]
    fn reserved_channels() {
        assert_eq!(RPC_CHANNELS.create_sync.channel(), "rpc.createSync");
        assert_eq!(RPC_CHANNELS.request_sync.member(), "requestSync");
        assert_eq!(RPC_CHANNELS.cancel.to_string(), "rpc.cancel");
    }

    #[test]
    fn duplicates_are_reported_not_fatal() {
        testing::init_test_logging();

        let registry = ChannelRegistry::new();
        assert!(registry.register_rpc_channels());
        assert!(!registry.register_rpc_channels());
        assert!(!registry.register_channel(&RPC_CHANNELS.request));
        assert!(registry.is_channel_registered("rpc.request"));

        let custom = Namespace::new("custom");
        assert!(registry.register_namespace(&custom));
        assert!(!registry.register_namespace(&custom));
    }

    #[test]
    fn init_allows_reregistration() {
        let registry = ChannelRegistry::new();
        assert!(registry.register_channel(&RPC_CHANNELS.notification));

        registry.init();

        assert!(!registry.is_channel_registered("rpc.notification"));
        assert!(registry.register_channel(&RPC_CHANNELS.notification));
    }
}
