//! Once a request or notification has been decoded it must be routed to the handler registered
//! for its method, and that handler invoked.  That is the job of the [`Router`].
//!
//! A router is also the explicit manifest of a server: the methods it answers and the events it
//! may fire.  Both are `$`-prefixed on the wire; names registered without the prefix are
//! normalized.
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use ipcox_core::sync::RwLockExt;

use crate::{handler, types};

/// Type alias for the handlers map to simplify the type signature
type HandlersMap<S> = Arc<RwLock<HashMap<String, Box<dyn handler::ErasedHandler<S>>>>>;

/// Prefix that marks a method as callable over RPC.
pub const METHOD_PREFIX: char = '$';

/// Prefix of event names, after the method prefix.
pub const EVENT_PREFIX: &str = "$on";

/// Normalize a method or event name to its `$`-prefixed wire form.
pub fn rpc_method_name(name: &str) -> Cow<'_, str> {
    if name.starts_with(METHOD_PREFIX) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{METHOD_PREFIX}{name}"))
    }
}

/// Router inspired loosely by the `axum` crate router, but simplified and specialized for routing
/// by method name.
#[derive(Clone)]
pub struct Router<S: Clone + Send + Sync + 'static = ()> {
    state: S,
    fallback_handler: Box<dyn handler::ErasedHandler<S>>,
    handlers: HandlersMap<S>,
    events: Arc<RwLock<BTreeSet<String>>>,
}

impl Router {
    /// Create a new router that doesn't need any state.
    pub fn new_stateless() -> Router<()> {
        Router::new_with_state(())
    }

    async fn fallback_handler(handler::MethodName(method_name): handler::MethodName) -> types::ErrorDetails {
        types::ErrorDetails::method_not_found(format!("No callable method '{method_name}'"), None)
    }
}

impl<S: Clone + Send + Sync + 'static> Router<S> {
    /// Create a new router whose handlers can access the provided shared state
    pub fn new_with_state(state: S) -> Self {
        Router {
            state,
            fallback_handler: handler::erase_handler(Router::fallback_handler),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// Return the current state in the router.
    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn register_fallback_handler<HackT, H>(&mut self, handler: H)
    where
        H: handler::Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        self.fallback_handler = handler::erase_handler(handler);
    }

    /// Register `handler` for `method`, replacing any previous handler of that method.
    pub fn register_handler<H, HackT>(&mut self, method: impl AsRef<str>, handler: H)
    where
        H: handler::Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        let method = rpc_method_name(method.as_ref()).into_owned();
        let mut handlers = self.handlers.write_unpoisoned();
        if handlers.insert(method.clone(), handler::erase_handler(handler)).is_some() {
            tracing::warn!(%method, "Replacing existing handler");
        }
    }

    /// Declare an event this server fires.  Event names start with `$on`.
    pub fn register_event(&mut self, event: impl AsRef<str>) {
        let event = rpc_method_name(event.as_ref()).into_owned();
        if !event.starts_with(EVENT_PREFIX) {
            tracing::warn!(%event, "Event name does not follow the '$on' naming convention");
        }
        self.events.write_unpoisoned().insert(event);
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.read_unpoisoned().contains_key(&*rpc_method_name(method))
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.read_unpoisoned().contains(&*rpc_method_name(event))
    }

    /// Names of the registered methods, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.read_unpoisoned().keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Names of the declared events, sorted.
    pub fn events(&self) -> Vec<String> {
        self.events.read_unpoisoned().iter().cloned().collect()
    }

    fn handler_for(&self, method: &str) -> Option<Box<dyn handler::ErasedHandler<S>>> {
        self.handlers.read_unpoisoned().get(method).cloned()
    }

    /// Invoke the handler of `request.method`, or the fallback handler (which by default answers
    /// with a "no callable method" error).
    pub fn handle_method(
        &self,
        mut request: handler::Request,
    ) -> Pin<Box<dyn Future<Output = types::ResponsePayload> + Send + 'static>> {
        request.method = rpc_method_name(&request.method).into_owned();
        match self.handler_for(&request.method) {
            Some(handler) => handler.handle_method(self.state.clone(), request),
            None => self.fallback_handler.handle_method(self.state.clone(), request),
        }
    }

    /// Invoke the handler of `request.method` for a notification.  Nothing is reported back; a
    /// notification for an unknown method is logged and dropped.
    pub fn handle_notification(
        &self,
        mut request: handler::Request,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        request.method = rpc_method_name(&request.method).into_owned();
        match self.handler_for(&request.method) {
            Some(handler) => handler.handle_notification(self.state.clone(), request),
            None => {
                tracing::warn!(method = %request.method, "Dropping notification for unknown method");
                futures::future::ready(()).boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::context::{RpcContext, SenderId};
    use crate::handler::{Json, Params, State};
    use crate::testing;
    use crate::types::{ErrorCode, ResponsePayload, SuccessResponse};

    fn request(method: &str, params: Vec<types::JsonValue>) -> handler::Request {
        handler::Request {
            method: method.to_string(),
            params,
            context: Arc::new(RpcContext::new(SenderId::new("tester"))),
        }
    }

    #[test]
    fn method_names_are_normalized() {
        assert_eq!(rpc_method_name("getZoomLevel"), "$getZoomLevel");
        assert_eq!(rpc_method_name("$getZoomLevel"), "$getZoomLevel");
        assert_matches!(rpc_method_name("$x"), Cow::Borrowed(_));
    }

    #[tokio::test]
    async fn routes_with_or_without_prefix() {
        testing::init_test_logging();

        async fn double(Params((n,)): Params<(i64,)>) -> Json<i64> {
            Json(n * 2)
        }

        let mut router = Router::new_stateless();
        router.register_handler("double", double);
        assert!(router.has_method("$double"));
        assert_eq!(router.methods(), vec!["$double".to_string()]);

        for name in ["double", "$double"] {
            let payload = router.handle_method(request(name, vec![json!(21)])).await;
            assert_matches!(payload, ResponsePayload::Success(SuccessResponse { result }) if result == json!(42));
        }
    }

    #[tokio::test]
    async fn unknown_method_is_no_callable_method() {
        testing::init_test_logging();

        let router = Router::new_stateless();
        let payload = router.handle_method(request("nope", vec![])).await;
        assert_matches!(payload, ResponsePayload::Error(e) => {
            assert_eq!(e.error.code, ErrorCode::MethodNotFound);
            assert_eq!(e.error.message, "No callable method '$nope'");
        });

        // Must not panic or hang
        router.handle_notification(request("nope", vec![])).await;
    }

    #[tokio::test]
    async fn notifications_reach_stateful_handlers() {
        testing::init_test_logging();

        async fn bump(State(counter): State<Arc<AtomicUsize>>) {
            counter.fetch_add(1, Ordering::SeqCst);
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new_with_state(counter.clone());
        router.register_handler("$bump", bump);

        router.handle_notification(request("bump", vec![])).await;
        router.handle_notification(request("$bump", vec![])).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_registration_replaces_first() {
        testing::init_test_logging();

        async fn first() -> Json<&'static str> {
            Json("first")
        }
        async fn second() -> Json<&'static str> {
            Json("second")
        }

        let mut router = Router::new_stateless();
        router.register_handler("which", first);
        router.register_handler("$which", second);

        let payload = router.handle_method(request("which", vec![])).await;
        assert_matches!(payload, ResponsePayload::Success(SuccessResponse { result }) if result == json!("second"));
    }

    #[test]
    fn events_are_declared() {
        testing::init_test_logging();

        let mut router = Router::new_stateless();
        router.register_event("onDidChange");
        router.register_event("$onDidClose");

        assert!(router.has_event("$onDidChange"));
        assert!(router.has_event("onDidClose"));
        assert!(!router.has_event("onNothing"));
        assert_eq!(router.events(), vec!["$onDidChange".to_string(), "$onDidClose".to_string()]);
    }
}
