//! The request/notification/cancel protocol.
//!
//! An [`RpcClient`] is symmetric: the same object issues calls to the remote side and serves the
//! calls the remote side issues, each on its own reserved channel of a [`ChannelHandler`].  It
//! is either active or disposed, and disposal is final.
//!
//! Requests carry a per-client increasing id.  The caller's future settles when the matching
//! response arrives, when its cancellation token fires (a `cancel` is sent to the remote, but
//! nothing waits for it), when the configured timeout elapses, or when the client is disposed.
//! Responses that arrive after any of those are dropped.
//!
//! Inbound requests run concurrently, each in its own task with its own cancellation token.
//! Inbound notifications run one at a time, in arrival order.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use ipcox_core::sync::{MutexExt, RwLockExt};
use pin_project::{pin_project, pinned_drop};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::Instrument;

use crate::channel::{ChannelDescriptor, RPC_CHANNELS};
use crate::channel_handler::{ChannelHandler, listener};
use crate::connection::{CloseEvent, MessagePort, MessageSender};
use crate::event::Subscription;
use crate::types::{self, ErrorDetails, JsonValue, RequestId, ResponsePayload};
use crate::{Result, RpcError, error};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    /// Outgoing requests that have not been answered within this time fail with
    /// [`RpcError::Timeout`] and are cancelled on the remote side.
    ///
    /// `None` waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
}

/// Serves inbound requests: `(method, params, token)` to the result or error sent back.
pub type RequestHandlerFn = Arc<
    dyn Fn(String, Vec<JsonValue>, CancellationToken) -> BoxFuture<'static, Result<JsonValue, ErrorDetails>>
        + Send
        + Sync,
>;

/// Serves inbound notifications.  Errors are logged, never reported to the remote side.
pub type NotificationHandlerFn =
    Arc<dyn Fn(String, Vec<JsonValue>) -> BoxFuture<'static, Result<(), ErrorDetails>> + Send + Sync>;

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    sender: Arc<dyn MessageSender>,
    config: RpcClientConfig,
    channels: ChannelHandler<Arc<ClientInner>>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    request_handler: RwLock<Option<RequestHandlerFn>>,
    notification_handler: RwLock<Option<NotificationHandlerFn>>,
    notification_tx: mpsc::UnboundedSender<types::Notification>,
    disposed: AtomicBool,
    /// Parent of every in-flight request token
    root_token: CancellationToken,
    subscriptions: Mutex<Vec<Subscription>>,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<ResponsePayload>,
}

/// Adapts a port to the sender half the client needs.
struct PortSender(Arc<dyn MessagePort>);

impl MessageSender for PortSender {
    fn send_message(&self, message: String) -> Result<()> {
        self.0.send_message(message)
    }
}

impl RpcClient {
    /// Create a client that writes to `sender`.  Inbound messages are fed to
    /// [`Self::handle_message`] by the caller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sender: Arc<dyn MessageSender>, config: RpcClientConfig) -> Self {
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            sender,
            config,
            channels: ChannelHandler::new(),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            request_handler: RwLock::new(None),
            notification_handler: RwLock::new(None),
            notification_tx,
            disposed: AtomicBool::new(false),
            root_token: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        inner
            .channels
            .on(
                &RPC_CHANNELS.request,
                listener(|inner: &Arc<ClientInner>, payload| inner.on_request(serde_json::from_value(payload)?)),
            )
            .on(
                &RPC_CHANNELS.response,
                listener(|inner: &Arc<ClientInner>, payload| {
                    inner.on_response(serde_json::from_value(payload)?);
                    Ok(())
                }),
            )
            .on(
                &RPC_CHANNELS.notification,
                listener(|inner: &Arc<ClientInner>, payload| {
                    inner.on_notification(serde_json::from_value(payload)?);
                    Ok(())
                }),
            )
            .on(
                &RPC_CHANNELS.cancel,
                listener(|inner: &Arc<ClientInner>, payload| {
                    inner.on_cancel(serde_json::from_value(payload)?);
                    Ok(())
                }),
            );

        tokio::spawn(notification_loop(Arc::downgrade(&inner), notification_rx).in_current_span());

        Self { inner }
    }

    /// Create a client speaking over `port`.
    ///
    /// Every message from the port is handled by the client, and the client is disposed when the
    /// port closes.
    pub fn for_port(port: Arc<dyn MessagePort>, config: RpcClientConfig) -> Self {
        let client = Self::new(Arc::new(PortSender(port.clone())), config);

        let on_message = {
            let inner = Arc::downgrade(&client.inner);
            port.on_message(Box::new(move |message: &str| {
                if let Some(inner) = inner.upgrade() {
                    let _ = inner.channels.handle_message(message, &inner);
                }
            }))
        };
        let on_close = {
            let inner = Arc::downgrade(&client.inner);
            port.on_close(Box::new(move |event: &CloseEvent| {
                if let Some(inner) = inner.upgrade() {
                    tracing::debug!(reason = %event.reason, "Port closed; disposing RPC client");
                    inner.dispose();
                }
            }))
        };
        client
            .inner
            .subscriptions
            .lock_unpoisoned()
            .extend([on_message, on_close]);

        client
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.inner.config
    }

    /// Decode and process one raw envelope from the remote side.
    ///
    /// Envelopes on channels other than the RPC ones are ignored.
    pub fn handle_message(&self, raw: &str) -> Result<()> {
        self.inner.channels.handle_message(raw, &self.inner).map(|_| ())
    }

    /// Send a notification.  Nothing is allocated to wait for an answer, and none will come.
    #[tracing::instrument(skip_all, fields(method = %method))]
    pub fn send_notification(&self, method: &str, params: Vec<JsonValue>) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.send_envelope(
            &RPC_CHANNELS.notification,
            &types::Notification::new(method, Some(params)),
        )
    }

    /// Send a request and return a handle that resolves with the response.
    ///
    /// If `token` is already cancelled nothing is sent and this fails with
    /// [`RpcError::Cancelled`].  Cancelling it later, or dropping the handle before it
    /// resolves, sends a `cancel` to the remote side.
    #[tracing::instrument(skip_all, fields(method = %method))]
    pub fn start_request(
        &self,
        method: &str,
        params: Vec<JsonValue>,
        token: Option<CancellationToken>,
    ) -> Result<RequestHandle> {
        self.inner.ensure_active()?;
        if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(RpcError::Cancelled);
        }

        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock_unpoisoned().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        tracing::trace!(request_id = id, "Sending request");
        if let Err(e) = self
            .inner
            .send_envelope(&RPC_CHANNELS.request, &types::Request::new(id, method, Some(params)))
        {
            self.inner.pending.lock_unpoisoned().remove(&id);
            return Err(e);
        }

        Ok(RequestHandle {
            id,
            method: method.to_string(),
            client: Arc::downgrade(&self.inner),
            response: rx,
            cancelled: token.map(CancellationToken::cancelled_owned),
            done: false,
        })
    }

    /// Send a request and wait for the response, honoring the configured request timeout.
    pub async fn send_request(
        &self,
        method: &str,
        params: Vec<JsonValue>,
        token: Option<CancellationToken>,
    ) -> Result<JsonValue> {
        let handle = self.start_request(method, params, token)?;

        match self.inner.config.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handle).await {
                Ok(result) => result,
                Err(_) => {
                    // Dropping the timed out handle already sent the cancel
                    tracing::debug!(method, ?timeout, "Request timed out");
                    Err(RpcError::Timeout {
                        method: method.to_string(),
                    })
                }
            },
            None => handle.await,
        }
    }

    /// Install the handler that serves inbound requests, replacing the current one.
    pub fn handle_request<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(String, Vec<JsonValue>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, ErrorDetails>> + Send + 'static,
    {
        self.inner.ensure_active()?;
        let handler: RequestHandlerFn = Arc::new(move |method, params, token| handler(method, params, token).boxed());
        if self.inner.request_handler.write_unpoisoned().replace(handler).is_some() {
            tracing::warn!("Replacing the existing request handler");
        }
        Ok(())
    }

    /// Install the handler that serves inbound notifications, replacing the current one.
    pub fn handle_notification<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(String, Vec<JsonValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ErrorDetails>> + Send + 'static,
    {
        self.inner.ensure_active()?;
        let handler: NotificationHandlerFn = Arc::new(move |method, params| handler(method, params).boxed());
        if self.inner.notification_handler.write_unpoisoned().replace(handler).is_some() {
            tracing::warn!("Replacing the existing notification handler");
        }
        Ok(())
    }

    /// Dispose the client.
    ///
    /// Pending requests fail with [`RpcError::Disposed`], inbound requests still running are
    /// cancelled, and every later operation fails with [`RpcError::Disposed`].  Calling this
    /// more than once has no further effect.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Number of outgoing requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock_unpoisoned().len()
    }

    /// Number of inbound requests still running.
    pub fn in_flight_requests(&self) -> usize {
        self.inner.in_flight.lock_unpoisoned().len()
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("disposed", &self.is_disposed())
            .field("pending", &self.pending_requests())
            .field("in_flight", &self.in_flight_requests())
            .finish()
    }
}

impl ClientInner {
    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(RpcError::Disposed)
        } else {
            Ok(())
        }
    }

    fn send_envelope<T: ?Sized, P: Serialize>(&self, channel: &ChannelDescriptor<T>, payload: &P) -> Result<()> {
        let message = self.channels.create_message(channel, payload)?;
        self.sender.send_message(message)
    }

    /// Give up on an outgoing request and ask the remote to stop working on it.
    fn cancel_request(&self, id: RequestId) {
        if self.pending.lock_unpoisoned().remove(&id).is_none() {
            return;
        }
        tracing::debug!(request_id = id, "Cancelling request");
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.send_envelope(&RPC_CHANNELS.cancel, &types::Cancel { request_id: id }) {
            tracing::debug!(request_id = id, error = %e, "Failed to send cancel");
        }
    }

    fn on_response(&self, response: types::Response) {
        let pending = self.pending.lock_unpoisoned().remove(&response.request_id);
        match pending {
            Some(pending) => {
                tracing::trace!(request_id = response.request_id, method = %pending.method, "Received response");
                let _ = pending.tx.send(response.payload);
            }
            None => {
                tracing::debug!(
                    request_id = response.request_id,
                    "Dropping response for a request that is no longer pending"
                );
            }
        }
    }

    fn on_request(self: &Arc<Self>, request: types::Request) -> anyhow::Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let id = request.request_id;
        let token = {
            let mut in_flight = self.in_flight.lock_unpoisoned();
            if in_flight.contains_key(&id) {
                None
            } else {
                let token = self.root_token.child_token();
                in_flight.insert(id, token.clone());
                Some(token)
            }
        };
        let Some(token) = token else {
            tracing::warn!(request_id = id, method = %request.method, "Duplicate request id");
            let response = types::Response::error(
                id,
                ErrorDetails::invalid_request(format!("Request {id} is already in progress"), None),
            );
            self.send_envelope(&RPC_CHANNELS.response, &response)?;
            return Ok(());
        };

        let handler = self.request_handler.read_unpoisoned().clone();
        let span = tracing::debug_span!("rpc_request", request_id = id, method = %request.method);
        let inner = Arc::downgrade(self);
        tokio::spawn(
            async move {
                let method = request.method;
                let params = request.params.unwrap_or_default();

                let outcome = match handler {
                    None => Err(ErrorDetails::internal_error(
                        format!("There is no handler for request '{method}'"),
                        None,
                    )),
                    Some(handler) => {
                        let token = token.clone();
                        AssertUnwindSafe(async move { handler(method, params, token).await })
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                let message = error::panic_err_to_string(panic);
                                tracing::error!(panic = %message, "Request handler panicked");
                                Err(ErrorDetails::internal_error(format!("Request handler panicked: {message}"), None))
                            })
                    }
                };

                let payload = if token.is_cancelled() {
                    ResponsePayload::error(ErrorDetails::cancelled())
                } else {
                    match outcome {
                        Ok(result) => ResponsePayload::success(result),
                        Err(error) => ResponsePayload::error(error),
                    }
                };

                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.in_flight.lock_unpoisoned().remove(&id);
                if inner.disposed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = inner.send_envelope(&RPC_CHANNELS.response, &types::Response::new(id, payload)) {
                    tracing::debug!(error = %e, "Failed to send response");
                }
            }
            .instrument(span),
        );

        Ok(())
    }

    fn on_notification(&self, notification: types::Notification) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        // The receiver only goes away with the client itself
        let _ = self.notification_tx.send(notification);
    }

    fn on_cancel(&self, cancel: types::Cancel) {
        let token = self.in_flight.lock_unpoisoned().get(&cancel.request_id).cloned();
        match token {
            Some(token) => {
                tracing::debug!(request_id = cancel.request_id, "Remote cancelled request");
                token.cancel();
            }
            None => tracing::trace!(request_id = cancel.request_id, "Cancel for a request that is not running"),
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Disposing RPC client");

        self.root_token.cancel();
        self.in_flight.lock_unpoisoned().clear();
        // Dropping the senders fails every waiting caller with `Disposed`
        let pending: Vec<_> = self.pending.lock_unpoisoned().drain().collect();
        drop(pending);

        self.channels.remove_all_listeners();
        self.request_handler.write_unpoisoned().take();
        self.notification_handler.write_unpoisoned().take();

        let subscriptions: Vec<_> = self.subscriptions.lock_unpoisoned().drain(..).collect();
        for mut subscription in subscriptions {
            subscription.dispose();
        }
    }
}

/// Runs inbound notifications one at a time, in arrival order, until the client goes away.
async fn notification_loop(inner: Weak<ClientInner>, mut rx: mpsc::UnboundedReceiver<types::Notification>) {
    while let Some(notification) = rx.recv().await {
        let handler = {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.disposed.load(Ordering::SeqCst) {
                break;
            }
            inner.notification_handler.read_unpoisoned().clone()
        };

        let method = notification.method;
        let Some(handler) = handler else {
            tracing::debug!(%method, "No notification handler; dropping notification");
            continue;
        };

        let params = notification.params.unwrap_or_default();
        let call_method = method.clone();
        let outcome = AssertUnwindSafe(async move { handler(call_method, params).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(%method, error = ?e, "Notification handler failed"),
            Err(panic) => tracing::error!(
                %method,
                panic = %error::panic_err_to_string(panic),
                "Notification handler panicked"
            ),
        }
    }
}

/// An outgoing request waiting for its response.
///
/// Dropping the handle before it resolves cancels the request.
#[pin_project(PinnedDrop)]
pub struct RequestHandle {
    id: RequestId,
    method: String,
    client: Weak<ClientInner>,
    response: oneshot::Receiver<ResponsePayload>,
    #[pin]
    cancelled: Option<WaitForCancellationFutureOwned>,
    done: bool,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for RequestHandle {
    type Output = Result<JsonValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(outcome) = Pin::new(this.response).poll(cx) {
            *this.done = true;
            return Poll::Ready(match outcome {
                Ok(payload) => payload.into_result(this.method),
                Err(_) => Err(RpcError::Disposed),
            });
        }

        if let Some(cancelled) = this.cancelled.as_pin_mut() {
            if cancelled.poll(cx).is_ready() {
                *this.done = true;
                if let Some(client) = this.client.upgrade() {
                    client.cancel_request(*this.id);
                }
                return Poll::Ready(Err(RpcError::Cancelled));
            }
        }

        Poll::Pending
    }
}

#[pinned_drop]
impl PinnedDrop for RequestHandle {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.done {
            if let Some(client) = this.client.upgrade() {
                client.cancel_request(*this.id);
            }
        }
    }
}
