//! Transport-independent building blocks shared by the `ipcox` crates.
//!
//! Nothing in here knows about wire formats or connections.  The [`binder`] module provides the
//! identity-preserving bind cache that listeners and handles depend on, [`handle`] converts rich
//! in-process values into transferable mirrors, and [`menu`] is the menu model that RPC consumers
//! populate.

pub mod binder;
mod error;
pub mod handle;
pub mod menu;
pub mod sync;
#[cfg(test)]
pub mod testing;

pub use binder::{BindKey, Binder};
pub use error::{HandleError, MenuError, Result};
