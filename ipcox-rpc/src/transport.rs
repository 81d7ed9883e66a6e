//! A "transport" is the physical medium beneath a [`crate::Connection`]: a socket, a pipe to a
//! child process, an in-process channel pair, a message port.
//!
//! At this level a transport is nothing more than a source and a sink of text messages, each of
//! which is one serialized envelope.  Everything above it (state tracking, channel routing, the
//! RPC protocol) is transport-independent, which keeps the abstraction deceptively simple.
//!
//! Out of the box there are impls for a `(Stream, Sink)` pair and for any tokio byte stream
//! framed with newline-delimited lines.  Other crates add their own, like the child process
//! transport in `ipcox-client`.
use std::borrow::Cow;
use std::pin::Pin;

use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt, TryFutureExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

use crate::{Result, RpcError};

/// A transport is a source and sink of messages that interfaces with some underlying medium
/// provided by the caller.
///
/// The messages are opaque strings from the transport's point of view.
pub trait Transport: Send + Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transport-specific identifier of the remote peer, useful for logging and debugging.
    fn remote_peer(&self) -> Cow<'static, str>;

    /// Send a message.  Should not complete until the message has been handed off to the
    /// underlying medium.
    ///
    /// This does not need to be cancel-safe; the connection waits for it to finish before
    /// considering the message sent.
    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Receive the next message.
    ///
    /// This future must be cancel-safe: dropping it before it completes must not lose or
    /// truncate a message.
    ///
    /// Returns `Ok(None)` once the transport is closed and no more messages can be received.
    fn receive_message(&mut self) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_;
}

/// Dyn-compatible wrapper around [`Transport`] that erases the concrete type and its error type.
trait BoxedTransport: Send + 'static {
    fn boxed_send_message(&mut self, message: String)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
    fn boxed_receive_message(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;
}

impl<T> BoxedTransport for T
where
    T: Transport + 'static,
{
    fn boxed_send_message(
        &mut self,
        message: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        <Self as Transport>::send_message(self, message)
            .map_err(|e| RpcError::Transport { source: Box::new(e) })
            .boxed()
    }

    fn boxed_receive_message(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        <Self as Transport>::receive_message(self)
            .map_err(|e| RpcError::Transport { source: Box::new(e) })
            .boxed()
    }
}

/// Any pair of a stream of incoming messages and a sink of outgoing ones is a transport.  This
/// is how in-process connections are built.
impl<In, InErr, Out> Transport for (In, Out)
where
    In: Stream<Item = Result<String, InErr>> + Unpin + Send + 'static,
    InErr: std::error::Error + Send + Sync + 'static,
    Out: Sink<String> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = RpcError;

    fn remote_peer(&self) -> Cow<'static, str> {
        format!(
            "({}, {})",
            std::any::type_name::<In>(),
            std::any::type_name::<Out>(),
        )
        .into()
    }

    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.1
            .send(message)
            .map_err(|e| RpcError::Transport { source: Box::new(e) })
    }

    fn receive_message(&mut self) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send {
        self.0.next().map(|opt_result: Option<Result<_, InErr>>| {
            opt_result
                .transpose()
                .map_err(|e| RpcError::Transport { source: Box::new(e) })
        })
    }
}

/// Newline-delimited messages over any tokio byte stream.
///
/// Envelopes are serialized without embedded newlines, so one line is one message.  This is what
/// pipes and sockets use.
impl<Io> Transport for Framed<Io, codec::LinesCodec>
where
    Io: Send + Unpin + AsyncRead + AsyncWrite + 'static,
{
    type Error = RpcError;

    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Io>())
    }

    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.send(message)
            .map_err(|e| RpcError::Transport { source: Box::new(e) })
    }

    fn receive_message(&mut self) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_ {
        // `StreamExt::next` only borrows the stream, and `Framed` keeps partial frames in its own
        // buffer, so this is cancel safe.
        self.next()
            .map(|opt_result: Option<Result<_, codec::LinesCodecError>>| {
                opt_result
                    .transpose()
                    .map_err(|e| RpcError::Transport { source: Box::new(e) })
            })
    }
}

/// Type-erased, `Sync` wrapper around a [`Transport`].
///
/// Send and receive take `&self`, so the connection event loop can hold one future of each kind
/// at a time.  All errors are normalized to [`RpcError::Transport`].
pub struct Peer {
    remote_peer: String,
    transport: tokio::sync::Mutex<Box<dyn BoxedTransport>>,
}

impl Peer {
    pub fn new(transport: impl Transport) -> Self {
        // Most transports need `&mut self` to send or receive anyway, so a mutex costs nothing
        // extra and avoids requiring `Sync` of every transport.
        Self {
            remote_peer: transport.remote_peer().to_string(),
            transport: tokio::sync::Mutex::new(Box::new(transport)),
        }
    }

    /// The remote peer's identifier, which is transport-specific.
    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub async fn send_message(&self, message: String) -> Result<()> {
        self.transport.lock().await.boxed_send_message(message).await
    }

    /// Receive the next message, or `None` if the transport has been closed.
    pub async fn receive_message(&self) -> Result<Option<String>> {
        self.transport.lock().await.boxed_receive_message().await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}
