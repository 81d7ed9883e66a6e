//! Server methods are plain async functions.
//!
//! The code that runs when a method is invoked is called a "handler".  All handlers implement
//! [`Handler`], but nobody is expected to implement it by hand: it is implemented for every async
//! function whose arguments are extractors (types implementing [`FromRequest`]) and whose return
//! type implements [`IntoResponse`].  The approach is borrowed from axum.
//!
//! ```ignore
//! async fn set_zoom(
//!     State(window): State<Arc<Window>>,
//!     Sender(sender): Sender,
//!     Params((level,)): Params<(f64,)>,
//! ) -> Result<f64, ErrorDetails> {
//!     window.set_zoom(&sender, level)
//! }
//! ```
use std::convert::Infallible;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::context::{RpcContext, SenderId};
use crate::types::{self, JsonValue};
use crate::{Result, RpcError};

/// An inbound invocation, as seen by extractors.
pub struct Request {
    /// Normalized, `$`-prefixed method name
    pub method: String,
    pub params: Vec<JsonValue>,
    pub context: Arc<RpcContext>,
}

/// Inspired by axum's `FromRequest` trait.
///
/// Params are small JSON arrays rather than streaming bodies, so there is no need for axum's
/// split between extractors that consume the request and those that only look at its parts.
pub trait FromRequest<S>: Sized {
    /// The error type that indicates the extraction of this type from the request failed for some
    /// reason.
    type Rejection: IntoResponse;

    fn from_request(request: &Request, state: &S) -> Result<Self, Self::Rejection>;
}

/// The positional params of the call, deserialized from the params array.
///
/// Use a tuple for several positional params, or a struct whose fields are filled in order.
pub struct Params<T>(pub T);

impl<T: DeserializeOwned, S> FromRequest<S> for Params<T> {
    type Rejection = RpcError;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        let params = JsonValue::Array(request.params.clone());
        serde_json::from_value(params.clone())
            .map(Params)
            .map_err(|source| RpcError::Deserialize {
                source,
                type_name: std::any::type_name::<T>(),
                value: params,
            })
    }
}

/// The raw params array.
impl<S> FromRequest<S> for JsonValue {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(JsonValue::Array(request.params.clone()))
    }
}

/// A value serialized to JSON in return position.
pub struct Json<T>(pub T);

/// Extractor that exposes state to the handler.
pub struct State<S: Clone>(pub S);

impl<S: Clone> FromRequest<S> for State<S> {
    type Rejection = Infallible;

    fn from_request(_request: &Request, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(state.clone()))
    }
}

/// Name of the method being invoked, `$`-prefixed.  Mostly useful in fallback handlers.
pub struct MethodName(pub String);

impl<S> FromRequest<S> for MethodName {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.method.clone()))
    }
}

/// The whole [`RpcContext`] of the call.
pub struct Context(pub Arc<RpcContext>);

impl<S> FromRequest<S> for Context {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.context.clone()))
    }
}

/// A value the host bound to the call, see [`ContextBindings`](crate::ContextBindings).
///
/// Fails the call when nothing of type `T` is bound.
pub struct Binding<T>(pub T);

impl<T: Clone + 'static, S> FromRequest<S> for Binding<T> {
    type Rejection = RpcError;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        request
            .context
            .get::<T>()
            .cloned()
            .map(Binding)
            .ok_or(RpcError::MissingBinding {
                type_name: std::any::type_name::<T>(),
            })
    }
}

/// Who issued the call.
pub struct Sender(pub SenderId);

impl<S> FromRequest<S> for Sender {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.context.sender().clone()))
    }
}

/// Cancellation token of the call.  Calls that cannot be cancelled get a token that never fires.
impl<S> FromRequest<S> for CancellationToken {
    type Rejection = Infallible;

    fn from_request(request: &Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request
            .context
            .cancellation_token()
            .cloned()
            .unwrap_or_default())
    }
}

/// Type implemented by anything that can be converted into a response.
pub trait IntoResponse {
    fn into_response(self) -> types::ResponsePayload;
}

/// A result becomes a success response if the value serializes, and an error response otherwise.
impl<T, E> IntoResponse for Result<T, E>
where
    T: Serialize,
    E: Into<types::ErrorDetails>,
{
    fn into_response(self) -> types::ResponsePayload {
        match self {
            Ok(value) => types::ResponsePayload::serialize_to_success(value),
            Err(e) => types::ResponsePayload::error(e.into()),
        }
    }
}

impl IntoResponse for JsonValue {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::success(self)
    }
}

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::serialize_to_success(self.0)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(self)
    }
}

impl IntoResponse for types::ErrorDetails {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(self)
    }
}

/// Methods without a meaningful result answer `null`.
impl IntoResponse for () {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::success(JsonValue::Null)
    }
}

impl IntoResponse for Infallible {
    fn into_response(self) -> types::ResponsePayload {
        match self {}
    }
}

/// A handler for RPC methods and notifications.
///
/// Requests and notifications are dispatched through the same handlers.  When invoked as a
/// notification the response is computed and discarded.
///
/// ## Type Parameters
///
/// - `HackT`: To `impl Trait` generically over function arguments, the argument types have to
///   appear in the trait signature.  This parameter exists only for that and is erased once the
///   handler is registered with a [`crate::Router`].
/// - `S`: The state passed to the handler.  Every handler of one router agrees on it, even those
///   that never extract it.
pub trait Handler<HackT, S>: Clone + Send + Sync + Sized + 'static {
    type MethodFuture: Future<Output = types::ResponsePayload> + Send + 'static;
    type NotificationFuture: Future<Output = ()> + Send + 'static;

    fn handle_method(self, state: S, request: Request) -> Self::MethodFuture;

    fn handle_notification(self, state: S, request: Request) -> Self::NotificationFuture;
}

/// Internal helper implemented for every function that gets an automatic [`Handler`] impl, so
/// argument extraction is monomorphized once and shared by the method and notification paths.
trait HandlerImplHelper<HackT, S>: Clone + Send + Sync + Sized + 'static {
    type MethodArgsTupl;
    type MethodFuture: Future + Send;

    fn extract_method_args(state: S, request: Request) -> Result<Self::MethodArgsTupl, types::ResponsePayload>;

    fn call_impl_func(self, args: Self::MethodArgsTupl) -> Self::MethodFuture;
}

/// Handlers without arguments.
impl<F, Fut, S, Res> Handler<(), S> for F
where
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    S: Send + Sync + 'static,
    Res: IntoResponse + 'static,
{
    type MethodFuture = Pin<Box<dyn Future<Output = types::ResponsePayload> + Send + 'static>>;
    type NotificationFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

    fn handle_method(self, _state: S, _request: Request) -> Self::MethodFuture {
        self().map(IntoResponse::into_response).boxed()
    }

    fn handle_notification(self, _state: S, _request: Request) -> Self::NotificationFuture {
        self().map(|_| ()).boxed()
    }
}

/// Invoke a macro for all supported tuples, after axum's macro of the same name.
///
/// There aren't that many useful extractors, so this stops well short of axum's sixteen.
#[rustfmt::skip]
macro_rules! all_the_tuples {
    ($name:ident) => {
        $name!([], T1);
        $name!([T1], T2);
        $name!([T1, T2], T3);
        $name!([T1, T2, T3], T4);
        $name!([T1, T2, T3, T4], T5);
    };
}

/// Generates the [`Handler`] impls for async functions taking extractors, after axum's
/// `impl_handler` macro.
macro_rules! impl_method_handler {
    (
        [$($ty:ident),*], $last:ident
    ) => {
        #[allow(non_snake_case)]
        impl<F, Fut, S, Res, $($ty,)* $last> HandlerImplHelper<($($ty,)* $last,), S> for F
        where
            F: FnOnce($($ty,)* $last,) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse,
            $( $ty: FromRequest<S> + Send + 'static, )*
            $last: FromRequest<S> + Send + 'static {
            type MethodArgsTupl = ($($ty,)* $last,);
            type MethodFuture = Fut;

            fn extract_method_args(state: S, request: Request) -> Result<Self::MethodArgsTupl, types::ResponsePayload> {
                $(
                    let $ty = match $ty::from_request(&request, &state) {
                        Ok(value) => value,
                        Err(rejection) => return Err(rejection.into_response()),
                    };
                )*

                let $last = match $last::from_request(&request, &state) {
                    Ok(value) => value,
                    Err(rejection) => return Err(rejection.into_response()),
                };

                Ok(($($ty,)* $last,))
            }

            fn call_impl_func(self, ($($ty,)* $last,): Self::MethodArgsTupl) -> Self::MethodFuture {
                self($($ty,)* $last,)
            }
        }

        // The bounds are repeated rather than written as `F: HandlerImplHelper<..>` so that a
        // function with an unsupported signature at least produces an error about `Handler`.
        #[allow(non_snake_case)]
        impl<F, Fut, S, Res, $($ty,)* $last> Handler<($($ty,)* $last,), S> for F
        where
            F: FnOnce($($ty,)* $last,) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse,
            $( $ty: FromRequest<S> + Send + 'static, )*
            $last: FromRequest<S> + Send + 'static {
            type MethodFuture = Pin<Box<dyn Future<Output = types::ResponsePayload> + Send + 'static>>;
            type NotificationFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

            fn handle_method(self, state: S, request: Request) -> Self::MethodFuture {
                let args = <Self as HandlerImplHelper<($($ty,)* $last,), S>>::extract_method_args(state, request);
                async move {
                    let args = match args {
                        Ok(args) => args,
                        Err(err) => return err,
                    };

                    self.call_impl_func(args).await.into_response()
                }.boxed()
            }

            fn handle_notification(self, state: S, request: Request) -> Self::NotificationFuture {
                let method = request.method.clone();
                let args = <Self as HandlerImplHelper<($($ty,)* $last,), S>>::extract_method_args(state, request);
                async move {
                    let args = match args {
                        Ok(args) => args,
                        Err(err) => {
                            tracing::warn!(%method, error = ?err, "Dropping notification with invalid params");
                            return;
                        }
                    };

                    if let types::ResponsePayload::Error(err) = self.call_impl_func(args).await.into_response() {
                        tracing::warn!(%method, error = ?err.error, "Notification handler failed");
                    }
                }.boxed()
            }
        }
    };
}

all_the_tuples!(impl_method_handler);

/// Dyn-compatible form of [`Handler`] with the `HackT` parameter erased, which is what the
/// router stores.
pub(crate) trait ErasedHandler<S>: Send + Sync {
    fn clone_box(&self) -> Box<dyn ErasedHandler<S>>;

    fn handle_method(
        &self,
        state: S,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = types::ResponsePayload> + Send + 'static>>;

    fn handle_notification(&self, state: S, request: Request) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

impl<S> Clone for Box<dyn ErasedHandler<S>> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

struct MakeErasedHandler<H, HackT> {
    handler: H,
    _hack: PhantomData<fn() -> HackT>,
}

impl<H: Clone, HackT> Clone for MakeErasedHandler<H, HackT> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            _hack: PhantomData,
        }
    }
}

impl<H, HackT, S> ErasedHandler<S> for MakeErasedHandler<H, HackT>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    fn clone_box(&self) -> Box<dyn ErasedHandler<S>> {
        Box::new(self.clone())
    }

    fn handle_method(
        &self,
        state: S,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = types::ResponsePayload> + Send + 'static>> {
        self.handler.clone().handle_method(state, request).boxed()
    }

    fn handle_notification(&self, state: S, request: Request) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        self.handler.clone().handle_notification(state, request).boxed()
    }
}

pub(crate) fn erase_handler<H, HackT, S>(handler: H) -> Box<dyn ErasedHandler<S>>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    Box::new(MakeErasedHandler {
        handler,
        _hack: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::types::{ErrorCode, ErrorDetails, ResponsePayload, SuccessResponse};

    fn request(method: &str, params: Vec<JsonValue>) -> Request {
        Request {
            method: method.to_string(),
            params,
            context: Arc::new(RpcContext::new(SenderId::new("tester"))),
        }
    }

    fn success(payload: ResponsePayload) -> JsonValue {
        match payload {
            ResponsePayload::Success(SuccessResponse { result }) => result,
            ResponsePayload::Error(e) => panic!("expected success, got {:?}", e.error),
        }
    }

    #[tokio::test]
    async fn positional_params_as_tuple() {
        async fn add(Params((a, b)): Params<(i64, i64)>) -> Json<i64> {
            Json(a + b)
        }

        let payload = add.handle_method((), request("$add", vec![json!(2), json!(3)])).await;
        assert_eq!(success(payload), json!(5));
    }

    #[tokio::test]
    async fn positional_params_as_struct() {
        #[derive(Deserialize)]
        struct Greeting {
            name: String,
            excited: bool,
        }

        async fn greet(Params(greeting): Params<Greeting>) -> Result<String, ErrorDetails> {
            let suffix = if greeting.excited { "!" } else { "." };
            Ok(format!("hello {}{suffix}", greeting.name))
        }

        let payload = greet
            .handle_method((), request("$greet", vec![json!("bob"), json!(true)]))
            .await;
        assert_eq!(success(payload), json!("hello bob!"));
    }

    #[tokio::test]
    async fn bad_params_are_invalid_params_error() {
        async fn add(Params((a, b)): Params<(i64, i64)>) -> Json<i64> {
            Json(a + b)
        }

        let payload = add.handle_method((), request("$add", vec![json!("two")])).await;
        assert_matches!(payload, ResponsePayload::Error(e) if e.error.code == ErrorCode::InvalidParams);
    }

    #[tokio::test]
    async fn state_sender_and_method_name() {
        async fn describe(
            State(prefix): State<String>,
            Sender(sender): Sender,
            MethodName(method): MethodName,
        ) -> JsonValue {
            json!(format!("{prefix}:{sender}:{method}"))
        }

        let payload = describe
            .handle_method("srv".to_string(), request("$describe", vec![]))
            .await;
        assert_eq!(success(payload), json!("srv:tester:$describe"));
    }

    #[tokio::test]
    async fn no_arg_handler_and_unit_result() {
        async fn ping() {}

        let payload = ping.handle_method((), request("$ping", vec![])).await;
        assert_eq!(success(payload), JsonValue::Null);
    }

    #[tokio::test]
    async fn token_defaults_to_never_cancelled() {
        async fn check(token: CancellationToken) -> Json<bool> {
            Json(token.is_cancelled())
        }

        let payload = check.handle_method((), request("$check", vec![])).await;
        assert_eq!(success(payload), json!(false));

        let token = CancellationToken::new();
        token.cancel();
        let cancelled_request = Request {
            context: Arc::new(RpcContext::new(SenderId::new("tester")).with_cancellation_token(token)),
            ..request("$check", vec![])
        };
        let payload = check.handle_method((), cancelled_request).await;
        assert_eq!(success(payload), json!(true));
    }

    #[tokio::test]
    async fn bindings_reach_the_handler() {
        #[derive(Clone)]
        struct WindowId(u32);

        async fn window(Binding(WindowId(id)): Binding<WindowId>) -> Json<u32> {
            Json(id)
        }

        let bound_request = Request {
            context: Arc::new(RpcContext::new(SenderId::new("tester")).with_binding(WindowId(3))),
            ..request("$window", vec![])
        };
        let payload = window.handle_method((), bound_request).await;
        assert_eq!(success(payload), json!(3));

        let payload = window.handle_method((), request("$window", vec![])).await;
        assert_matches!(
            payload,
            ResponsePayload::Error(e) if e.error.code == ErrorCode::InternalError && e.error.message.contains("WindowId")
        );
    }

    #[tokio::test]
    async fn erased_handler_is_cloneable() {
        async fn echo(params: JsonValue) -> JsonValue {
            params
        }

        let erased: Box<dyn ErasedHandler<()>> = erase_handler(echo);
        let cloned = erased.clone();
        let payload = cloned.handle_method((), request("$echo", vec![json!("hi")])).await;
        assert_eq!(success(payload), json!(["hi"]));

        erased.handle_notification((), request("$echo", vec![])).await;
    }
}
