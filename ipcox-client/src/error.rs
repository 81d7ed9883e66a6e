use ipcox_rpc::RpcError;
use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Error spawning server '{program}' with args [{args}] as child process",
        args = .args.join(" ")
    )]
    SpawnServer {
        source: std::io::Error,
        program: String,
        args: Vec<String>,
    },

    #[error("Child process '{program}' has no {stream} pipe")]
    MissingPipe { program: String, stream: &'static str },

    #[error(transparent)]
    Rpc {
        #[from]
        source: RpcError,
    },

    #[error("Server '{server_name}' was stopped: {reason}")]
    Stopped { server_name: String, reason: crate::StopReason },

    #[error("The supervisor task of server '{server_name}' panicked")]
    SupervisorPanicked {
        server_name: String,
        source: tokio::task::JoinError,
    },
}
