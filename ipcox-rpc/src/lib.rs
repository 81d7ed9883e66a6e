//! Channels, connections and the RPC protocol of `ipcox`.
//!
//! The layers, from the wire up:
//!
//! - [`Transport`] moves strings; [`Connection`] adds a lifecycle and message events on top.
//! - [`ChannelMultiplexer`] splits one connection into named virtual [`Channel`]s.
//! - [`ChannelHandler`] demultiplexes channel envelopes to listeners by channel name.
//! - [`RpcClient`] speaks the request/notification/cancel protocol over a port.
//! - [`RpcServerWrap`] serves the methods of a [`Router`] to the ports of many senders and fans
//!   events out to them; [`RpcServerHost`] and [`ProxyProvider`] connect the two ends of a
//!   multiplexed connection by server path.
//!
//! Server methods are plain async functions taking extractors, in the style of `axum`.

/// Re-export the exact async-trait macro we use, for compatibility
#[doc(hidden)]
pub use async_trait::async_trait;

mod channel;
mod channel_handler;
mod client;
mod connection;
mod context;
mod error;
mod event;
mod handler;
pub mod host;
mod multiplexer;
mod proxy;
mod router;
mod server;
#[cfg(test)]
pub mod testing;
mod transport;
mod types;

pub use channel::{ChannelDescriptor, ChannelRegistry, Namespace, RPC_CHANNELS, RpcChannels};
pub use channel_handler::{ChannelHandler, Listener, ListenerFn, listener};
pub use client::{NotificationHandlerFn, RequestHandle, RequestHandlerFn, RpcClient, RpcClientConfig};
pub use connection::{
    CloseEvent, CloseListener, Connection, ConnectionConfig, ConnectionState, MessageListener, MessagePort,
    MessageSender, PortId,
};
pub use context::{ContextBindings, RpcContext, SenderId};
pub use error::{Result, RpcError};
pub use event::{Emitter, Subscription};
pub use handler::{Binding, Context, FromRequest, Handler, IntoResponse, Json, MethodName, Params, Request, Sender, State};
pub use host::{RpcServerHost, RpcServerProvider, RpcServerRegistry};
pub use multiplexer::{Channel, ChannelMultiplexer};
pub use proxy::{ProxyProvider, RpcProxy};
pub use router::{Router, rpc_method_name};
pub use server::{RpcEvent, RpcServe, RpcServerWrap};
pub use transport::{Peer, Transport};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    Cancel, Envelope, ErrorCode, ErrorDetails, ErrorResponse, JsonValue, Notification, REQUEST_CANCELLED_CODE,
    RequestId, Response, ResponsePayload, SuccessResponse,
};
