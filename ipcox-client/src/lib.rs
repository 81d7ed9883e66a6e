//! Connections to servers that run in child processes.
//!
//! [`transport::ChildProcess`] carries messages over a child's stdin and stdout.  The
//! [`Supervisor`] builds an [`ipcox_rpc::RpcClient`] on top of it and keeps the server running,
//! restarting it after crashes as long as the [`ConnectionErrorHandler`] allows.

mod error;
pub mod error_handler;
pub mod supervisor;
#[cfg(test)]
mod testing;
pub mod transport;

pub use error::{ClientError, Result};
pub use error_handler::{CloseAction, ConnectionErrorHandler, ErrorAction, ErrorHandlerOptions};
pub use supervisor::{CommandFactory, StopReason, Supervisor, SupervisorConfig};
