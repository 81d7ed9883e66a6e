//! Client-specific transports for reaching servers that run out of process.
//!
//! All of these provide an implementation of [`ipcox_rpc::Transport`], so they can back an
//! [`ipcox_rpc::Connection`].

mod child_process;

pub use child_process::*;
