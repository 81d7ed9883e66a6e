use std::any::Any;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types::ErrorDetails;

pub type Result<T, E = RpcError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("The operation was cancelled")]
    Cancelled,

    #[error("Request '{method}' timed out")]
    Timeout { method: String },

    #[error("Used after being disposed")]
    Disposed,

    #[error("Remote method '{method}' failed: {}", error.message)]
    MethodError { method: String, error: ErrorDetails },

    #[error("Connection is {state}, not open")]
    NotOpen { state: crate::ConnectionState },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Channel '{id}' was closed: {reason}")]
    ChannelClosed { id: String, reason: String },

    #[error("Message is not valid JSON")]
    ParseJson {
        source: serde_json::Error,
        message: String,
    },

    #[error("Error serializing {type_name} to JSON")]
    Serialize {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("Error deserializing {type_name} from JSON")]
    Deserialize {
        source: serde_json::Error,
        type_name: &'static str,
        value: JsonValue,
    },

    #[error("No server is registered at path '{path}'")]
    UnknownServer { path: String },

    #[error("Event '{event}' is not declared by this server")]
    UnknownEvent { event: String },

    #[error("No {type_name} is bound to this call")]
    MissingBinding { type_name: &'static str },

    #[error("Handler for '{method}' did not complete synchronously")]
    NotSynchronous { method: String },

    #[error("Transport error")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("BUG: {0}")]
    Bug(String),
}

impl RpcError {
    /// True for local cancellation and for a remote error carrying the cancellation code, so
    /// callers can suppress reporting of operations that were cancelled on purpose.
    pub fn is_cancelled(&self) -> bool {
        match self {
            RpcError::Cancelled => true,
            RpcError::MethodError { error, .. } => error.is_cancelled(),
            _ => false,
        }
    }
}

/// Convert internal errors into the error details sent to a remote peer.
impl From<RpcError> for ErrorDetails {
    fn from(value: RpcError) -> Self {
        match value {
            RpcError::Cancelled => ErrorDetails::cancelled(),
            RpcError::MethodError { error, .. } => error,
            RpcError::Deserialize { source, type_name, value } => ErrorDetails::invalid_params(
                format!("Invalid params for {type_name}: {source}"),
                Some(value),
            ),
            RpcError::ParseJson { source, .. } => ErrorDetails::parse_error(source.to_string(), None),
            other => ErrorDetails::internal_error(other.to_string(), None),
        }
    }
}

/// Extract a message from the payload of a caught panic.
pub(crate) fn panic_err_to_string(err: Box<dyn Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
