//! Per-invocation context handed to server methods.
//!
//! A fresh [`RpcContext`] is built for every inbound request or notification and dropped when
//! the call completes.  It always knows the [`SenderId`] of the caller, carries the request's
//! cancellation token when there is one, and holds arbitrary typed [`ContextBindings`] that the
//! hosting code wants to make available to method implementations.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque identity of whoever issued a call, used to scope event fan-out and port bookkeeping.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(Arc<str>);

impl SenderId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// A new sender id that is unique in time and space.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SenderId").field(&&*self.0).finish()
    }
}

impl From<&str> for SenderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SenderId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

pub struct RpcContext {
    sender: SenderId,
    cancellation_token: Option<CancellationToken>,
    bindings: ContextBindings,
}

impl RpcContext {
    pub fn new(sender: SenderId) -> Self {
        Self {
            sender,
            cancellation_token: None,
            bindings: ContextBindings::new(),
        }
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn with_binding<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.bindings.insert(value);
        self
    }

    /// Add every value of `bindings`, replacing values of the same type.
    pub fn with_bindings(mut self, bindings: &ContextBindings) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn sender(&self) -> &SenderId {
        &self.sender
    }

    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancellation_token.as_ref()
    }

    /// True if the call was cancelled.  Calls without a token, like synchronous ones, are never
    /// cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.bindings.get()
    }

    pub fn bindings(&self) -> &ContextBindings {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut ContextBindings {
        &mut self.bindings
    }
}

impl fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcContext")
            .field("sender", &self.sender)
            .field("cancelled", &self.is_cancelled())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Values keyed by their type.
///
/// Lets the host attach whatever it knows about a call (the window it came from, an auth
/// principal) without this crate defining up front what those things are.  Values are shared,
/// so cloning the bindings for every call is cheap.
#[derive(Clone, Default)]
pub struct ContextBindings {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync + 'static>>,
}

impl ContextBindings {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    /// Insert a value, replacing any existing value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Copy every value of `other` into these bindings.
    pub fn extend(&mut self, other: &ContextBindings) {
        self.map
            .extend(other.map.iter().map(|(type_id, value)| (*type_id, value.clone())));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    pub fn get_clone<T: Clone + 'static>(&self) -> Option<T> {
        self.get::<T>().cloned()
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<Arc<T>> {
        let value = self.map.remove(&TypeId::of::<T>())?;
        value.downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct WindowId(u32);

    #[test]
    fn bindings_are_keyed_by_type() {
        let mut bindings = ContextBindings::new();
        assert!(bindings.is_empty());

        bindings.insert(WindowId(7));
        bindings.insert("principal".to_string());
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.get::<WindowId>(), Some(&WindowId(7)));
        assert_eq!(bindings.get_clone::<String>().as_deref(), Some("principal"));

        bindings.insert(WindowId(8));
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.remove::<WindowId>().as_deref(), Some(&WindowId(8)));
        assert!(!bindings.contains::<WindowId>());
    }

    #[test]
    fn later_bindings_replace_earlier_ones() {
        let mut shared = ContextBindings::new();
        shared.insert(WindowId(1));
        shared.insert("principal".to_string());

        let context = RpcContext::new(SenderId::new("window-1"))
            .with_binding(WindowId(2))
            .with_bindings(&shared);
        assert_eq!(context.get::<WindowId>(), Some(&WindowId(1)));
        assert_eq!(context.get::<String>().map(String::as_str), Some("principal"));

        // The shared bindings are untouched
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn context_carries_sender_and_token() {
        let token = CancellationToken::new();
        let context = RpcContext::new(SenderId::new("window-1"))
            .with_cancellation_token(token.clone())
            .with_binding(WindowId(1));

        assert_eq!(context.sender().as_str(), "window-1");
        assert_eq!(context.get::<WindowId>(), Some(&WindowId(1)));
        assert!(!context.is_cancelled());

        token.cancel();
        assert!(context.is_cancelled());

        assert!(!RpcContext::new(SenderId::generate()).is_cancelled());
    }

    #[test]
    fn generated_senders_are_unique() {
        let a = SenderId::generate();
        let b = SenderId::generate();
        assert_ne!(a, b);
        assert_eq!(SenderId::from(a.to_string()), a);
    }
}
