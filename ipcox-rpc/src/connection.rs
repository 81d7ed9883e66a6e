//! Stateful, bidirectional message connection over a [`Transport`].
//!
//! A [`Connection`] goes through `Opening → Opened → Closing → Closed`.  `Closing` is skipped
//! when the remote peer disappears abruptly.  Messages can only be sent while `Opened`, and are
//! written to the transport in the order they were sent.
//!
//! The transport is serviced by an event loop spawned by [`Connection::open`].  Inbound messages
//! are delivered to `on_message` listeners synchronously on that task, in arrival order.
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use ipcox_core::sync::MutexExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::event::{Emitter, Subscription};
use crate::transport::{Peer, Transport};
use crate::{Result, RpcError, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Opening,
    Opened,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Opening => "opening",
            ConnectionState::Opened => "opened",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long [`Connection::close_and_wait`] waits for the event loop to flush queued
    /// messages and stop.  When it elapses the event loop is aborted.
    ///
    /// `None` waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub close_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            close_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Process-unique identity of a message port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    pub fn next() -> Self {
        static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub reason: String,
}

pub type MessageListener = Box<dyn Fn(&str) + Send + Sync>;
pub type CloseListener = Box<dyn Fn(&CloseEvent) + Send + Sync>;

/// Something messages can be posted to.
pub trait MessageSender: Send + Sync {
    fn send_message(&self, message: String) -> Result<()>;
}

/// A [`MessageSender`] that can also be listened on and closed.
///
/// Implemented by [`Connection`] and by the virtual channels of a
/// [`crate::ChannelMultiplexer`].
pub trait MessagePort: MessageSender {
    fn port_id(&self) -> PortId;

    fn on_message(&self, listener: MessageListener) -> Subscription;

    /// Listen for the port closing.  Listeners added after the port closed are never invoked.
    fn on_close(&self, listener: CloseListener) -> Subscription;

    /// Close the port.  Closing an already closed port does nothing.
    fn close(&self, reason: &str);

    fn is_closed(&self) -> bool;
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    port_id: PortId,
    remote_peer: String,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<String>,
    /// Taken by `open`
    startup: Mutex<Option<Startup>>,
    cancellation_token: CancellationToken,
    close_reason: Mutex<Option<String>>,
    event_loop: Mutex<Option<tokio::task::JoinHandle<()>>>,
    on_message: Emitter<String>,
    on_close: Emitter<CloseEvent>,
    on_error: Emitter<RpcError>,
}

struct Startup {
    peer: Peer,
    outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl Connection {
    pub fn new(transport: impl Transport) -> Self {
        Self::with_config(transport, ConnectionConfig::default())
    }

    pub fn with_config(transport: impl Transport, config: ConnectionConfig) -> Self {
        let peer = Peer::new(transport);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Opening);

        Self {
            inner: Arc::new(ConnectionInner {
                port_id: PortId::next(),
                remote_peer: peer.remote_peer().to_string(),
                config,
                state,
                outbound_tx,
                startup: Mutex::new(Some(Startup { peer, outbound_rx })),
                cancellation_token: CancellationToken::new(),
                close_reason: Mutex::new(None),
                event_loop: Mutex::new(None),
                on_message: Emitter::new(),
                on_close: Emitter::new(),
                on_error: Emitter::new(),
            }),
        }
    }

    /// Two connections joined by an in-memory channel, each the remote peer of the other.
    ///
    /// Neither is opened yet.
    pub fn pair() -> (Connection, Connection) {
        let (left_tx, left_rx) = futures::channel::mpsc::unbounded::<String>();
        let (right_tx, right_rx) = futures::channel::mpsc::unbounded::<String>();

        let left = Connection::new((right_rx.map(Ok::<String, std::convert::Infallible>), left_tx));
        let right = Connection::new((left_rx.map(Ok::<String, std::convert::Infallible>), right_tx));
        (left, right)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn remote_peer(&self) -> &str {
        &self.inner.remote_peer
    }

    /// Start servicing the transport and move to `Opened`.
    ///
    /// Must be called from within a tokio runtime.  Fails with [`RpcError::NotOpen`] if the
    /// connection was already opened or closed.
    pub fn open(&self) -> Result<()> {
        let startup = self.inner.startup.lock_unpoisoned().take();
        let Some(Startup { peer, outbound_rx }) = startup else {
            return Err(RpcError::NotOpen { state: self.state() });
        };

        let span = tracing::debug_span!(
            "connection",
            port = %self.inner.port_id,
            remote_peer = %self.inner.remote_peer
        );

        // Listeners may observe `Opened` from the first inbound message on, so set it before
        // the event loop can deliver anything.
        let opened = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Opening {
                *state = ConnectionState::Opened;
                true
            } else {
                false
            }
        });
        if !opened {
            return Err(RpcError::NotOpen { state: self.state() });
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(
            async move {
                let result = AssertUnwindSafe(event_loop(&inner, peer, outbound_rx))
                    .catch_unwind()
                    .await;
                let reason = match result {
                    Ok(reason) => reason,
                    Err(panic) => {
                        let message = error::panic_err_to_string(panic);
                        tracing::error!(panic = %message, "Connection event loop panicked");
                        format!("Event loop panicked: {message}")
                    }
                };
                inner.finish_close(reason);
            }
            .instrument(span),
        );
        *self.inner.event_loop.lock_unpoisoned() = Some(handle);

        Ok(())
    }

    /// Begin closing the connection.
    ///
    /// An `Opened` connection moves to `Closing`; messages already sent are still flushed to the
    /// transport before it reaches `Closed`.  A connection that was never opened goes straight to
    /// `Closed`.  Calling this again has no effect, and the first reason is the one reported.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut previous = ConnectionState::Closed;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                ConnectionState::Opening => {
                    *state = ConnectionState::Closed;
                    true
                }
                ConnectionState::Opened => {
                    *state = ConnectionState::Closing;
                    true
                }
                ConnectionState::Closing | ConnectionState::Closed => false,
            }
        });

        match previous {
            ConnectionState::Opening => {
                tracing::debug!(port = %self.inner.port_id, %reason, "Closing connection that was never opened");
                self.inner.startup.lock_unpoisoned().take();
                self.inner.close_reason.lock_unpoisoned().get_or_insert(reason.clone());
                self.inner.on_close.fire(&CloseEvent { reason });
            }
            ConnectionState::Opened => {
                tracing::debug!(port = %self.inner.port_id, %reason, "Closing connection");
                self.inner.close_reason.lock_unpoisoned().get_or_insert(reason);
                self.inner.cancellation_token.cancel();
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    /// Wait until the connection is `Closed`, however that comes about.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Close the connection and wait for the event loop to stop, up to the configured
    /// `close_timeout`.
    pub async fn close_and_wait(&self, reason: impl Into<String>) {
        self.close(reason);

        match self.inner.config.close_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.closed()).await.is_err() {
                    tracing::warn!(
                        port = %self.inner.port_id,
                        close_timeout = ?timeout,
                        "Timed out waiting for connection event loop to stop; aborting it"
                    );
                    let handle = self.inner.event_loop.lock_unpoisoned().take();
                    if let Some(handle) = handle {
                        handle.abort();
                    }
                    self.inner.finish_close("Close timed out".to_string());
                }
            }
            None => self.closed().await,
        }
    }

    /// Reason the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock_unpoisoned().clone()
    }

    pub fn on_error(&self, listener: impl Fn(&RpcError) + Send + Sync + 'static) -> Subscription {
        self.inner.on_error.listen(listener)
    }
}

impl ConnectionInner {
    /// Record the final state and notify close listeners, exactly once.
    fn finish_close(&self, reason: String) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        let reason = self
            .close_reason
            .lock_unpoisoned()
            .get_or_insert(reason)
            .clone();
        tracing::debug!(port = %self.port_id, %reason, "Connection closed");
        self.on_close.fire(&CloseEvent { reason });
    }
}

/// Service the transport until the connection is closed from either end, returning the reason.
async fn event_loop(
    inner: &ConnectionInner,
    peer: Peer,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) -> String {
    tracing::debug!("Connection event loop is starting");

    loop {
        // The receive future holds the transport lock, so it must be dropped before sending.
        // `select!` drops the futures of the branches that didn't complete before running the
        // body of the one that did.
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    // Unreachable while `inner` holds the sender
                    break "Outbound queue closed".to_string();
                };
                if let Err(e) = peer.send_message(message).await {
                    tracing::error!(error = %e, "Failed to send message to peer");
                    let reason = format!("Transport error: {e}");
                    inner.on_error.fire(&e);
                    break reason;
                }
            },
            received = peer.receive_message() => {
                match received {
                    Ok(Some(message)) => {
                        tracing::trace!(len = message.len(), "Received message");
                        inner.on_message.fire(&message);
                    }
                    Ok(None) => {
                        tracing::debug!("Remote peer closed the connection");
                        break "Remote peer closed the connection".to_string();
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Error receiving message from peer");
                        let reason = format!("Transport error: {e}");
                        inner.on_error.fire(&e);
                        break reason;
                    }
                }
            },
            _ = inner.cancellation_token.cancelled() => {
                // Orderly close: whatever was sent before `close` still goes out
                outbound_rx.close();
                while let Some(message) = outbound_rx.recv().await {
                    if let Err(e) = peer.send_message(message).await {
                        tracing::debug!(error = %e, "Failed to flush message while closing");
                        break;
                    }
                }
                break inner
                    .close_reason
                    .lock_unpoisoned()
                    .clone()
                    .unwrap_or_else(|| "Closed".to_string());
            }
        }
    }
}

impl MessageSender for Connection {
    fn send_message(&self, message: String) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Opened {
            return Err(RpcError::NotOpen { state });
        }

        self.inner
            .outbound_tx
            .send(message)
            .map_err(|_| RpcError::NotOpen {
                state: ConnectionState::Closed,
            })
    }
}

impl MessagePort for Connection {
    fn port_id(&self) -> PortId {
        self.inner.port_id
    }

    fn on_message(&self, listener: MessageListener) -> Subscription {
        self.inner
            .on_message
            .listen(move |message: &String| listener(message))
    }

    fn on_close(&self, listener: CloseListener) -> Subscription {
        self.inner.on_close.listen(move |event: &CloseEvent| listener(event))
    }

    fn close(&self, reason: &str) {
        Connection::close(self, reason);
    }

    fn is_closed(&self) -> bool {
        matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("port_id", &self.inner.port_id)
            .field("remote_peer", &self.inner.remote_peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::duplex;
    use tokio_util::codec::{Framed, LinesCodec};

    use super::*;
    use crate::testing;

    /// Collect the messages a port receives into an unbounded channel.
    fn collect_messages(port: &impl MessagePort) -> (Subscription, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = port.on_message(Box::new(move |message: &str| {
            let _ = tx.send(message.to_string());
        }));
        (subscription, rx)
    }

    #[tokio::test]
    async fn messages_flow_in_order() {
        testing::init_test_logging();

        let (left, right) = Connection::pair();
        let (_subscription, mut received) = collect_messages(&right);
        left.open().unwrap();
        right.open().unwrap();

        for i in 0..10 {
            left.send_message(format!("message {i}")).unwrap();
        }
        for i in 0..10 {
            assert_eq!(received.recv().await.unwrap(), format!("message {i}"));
        }
    }

    #[tokio::test]
    async fn send_requires_opened_state() {
        let (left, _right) = Connection::pair();
        assert_eq!(left.state(), ConnectionState::Opening);
        assert_matches!(
            left.send_message("too early".to_string()),
            Err(RpcError::NotOpen {
                state: ConnectionState::Opening
            })
        );

        left.open().unwrap();
        assert_matches!(left.open(), Err(RpcError::NotOpen { .. }));

        left.close("done");
        left.closed().await;
        assert_matches!(
            left.send_message("too late".to_string()),
            Err(RpcError::NotOpen {
                state: ConnectionState::Closed
            })
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reports_first_reason() {
        testing::init_test_logging();

        let (left, right) = Connection::pair();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let closes = closes.clone();
            left.on_close(Box::new(move |event: &CloseEvent| closes.lock().unwrap().push(event.reason.clone())))
        };
        left.open().unwrap();
        right.open().unwrap();

        left.close("first");
        left.close("second");
        left.closed().await;
        left.close("third");

        assert_eq!(*closes.lock().unwrap(), vec!["first".to_string()]);
        assert_eq!(left.close_reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn closing_unopened_connection_skips_to_closed() {
        let (left, _right) = Connection::pair();
        left.close("never mind");

        assert_eq!(left.state(), ConnectionState::Closed);
        assert_matches!(left.open(), Err(RpcError::NotOpen { state: ConnectionState::Closed }));
    }

    #[tokio::test]
    async fn queued_messages_are_flushed_on_close() {
        let (left, right) = Connection::pair();
        let (_subscription, mut received) = collect_messages(&right);
        right.open().unwrap();
        left.open().unwrap();

        left.send_message("last words".to_string()).unwrap();
        left.close("bye");

        assert_eq!(received.recv().await.unwrap(), "last words");
    }

    #[tokio::test]
    async fn remote_disconnect_closes_without_closing_state() {
        testing::init_test_logging();

        let (left, right) = Connection::pair();
        let states = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = right.inner.state.subscribe();
        let recorder = {
            let states = states.clone();
            tokio::spawn(async move {
                while watcher.changed().await.is_ok() {
                    let state = *watcher.borrow_and_update();
                    states.lock().unwrap().push(state);
                    if state == ConnectionState::Closed {
                        break;
                    }
                }
            })
        };

        left.open().unwrap();
        right.open().unwrap();
        left.close_and_wait("going away").await;
        right.closed().await;
        recorder.await.unwrap();

        assert_eq!(
            right.close_reason().as_deref(),
            Some("Remote peer closed the connection")
        );
        assert!(!states.lock().unwrap().contains(&ConnectionState::Closing));
    }

    #[tokio::test]
    async fn framed_transport_connection() {
        let (a, b) = duplex(1024);
        let left = Connection::new(Framed::new(a, LinesCodec::new()));
        let right = Connection::new(Framed::new(b, LinesCodec::new()));
        let (_subscription, mut received) = collect_messages(&right);
        left.open().unwrap();
        right.open().unwrap();

        left.send_message(r#"{"channel":"x","payload":null}"#.to_string()).unwrap();
        assert_eq!(received.recv().await.unwrap(), r#"{"channel":"x","payload":null}"#);

        assert_ne!(left.port_id(), right.port_id());
    }

    #[test]
    fn config_parsing() {
        let config: ConnectionConfig = serde_yaml::from_str("close_timeout: 250ms").unwrap();
        assert_eq!(config.close_timeout, Some(Duration::from_millis(250)));

        let config: ConnectionConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.close_timeout, Some(Duration::from_secs(5)));
    }
}
