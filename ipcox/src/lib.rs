//! Cross-context RPC, channel multiplexing and IPC handles.
//!
//! This crate re-exports the `ipcox` crates behind cargo features:
//!
//! - [`core`]: the bind cache, the IPC handle converter and the menu model.  Always present.
//! - [`rpc`] (feature `rpc`): channels, connections, the multiplexer and the RPC protocol.
//! - [`client`] (feature `client`): child-process servers under a restarting supervisor.

pub use ipcox_core as core;

#[cfg(feature = "rpc")]
pub use ipcox_rpc as rpc;

#[cfg(feature = "client")]
pub use ipcox_client as client;

#[cfg(feature = "rpc")]
pub use ipcox_rpc::{
    ChannelMultiplexer, Connection, ProxyProvider, Router, RpcClient, RpcError, RpcProxy, RpcServerHost,
    RpcServerRegistry, RpcServerWrap,
};

#[cfg(feature = "client")]
pub use ipcox_client::{ClientError, Supervisor, SupervisorConfig};
