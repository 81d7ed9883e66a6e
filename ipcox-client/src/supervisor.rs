//! Keeps an RPC connection to a server in a child process alive.
//!
//! The [`Supervisor`] spawns the server, connects an [`RpcClient`] to it, and publishes that
//! client.  Transport errors are counted and the server is restarted when its connection closes,
//! both subject to a [`ConnectionErrorHandler`].  Every restart publishes a fresh client, so
//! callers should fetch the current one rather than hold on to an old one.
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use ipcox_rpc::{Connection, ConnectionConfig, RpcClient, RpcClientConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::error_handler::{CloseAction, ConnectionErrorHandler, ErrorAction, ErrorHandlerOptions};
use crate::transport::{ChildProcess, DEFAULT_MAX_LINE_LENGTH};
use crate::{ClientError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    #[serde(flatten)]
    pub error_handler: ErrorHandlerOptions,
    pub client: RpcClientConfig,
    pub connection: ConnectionConfig,
    pub max_line_length: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            error_handler: ErrorHandlerOptions::default(),
            client: RpcClientConfig::default(),
            connection: ConnectionConfig::default(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Why a supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    /// [`Supervisor::shutdown`] was called
    ShutDown,
    /// The error handler gave up after too many errors
    TooManyErrors,
    /// The error handler refused to restart the server again
    TooManyRestarts,
}

/// Builds the command that launches the server, once per start.
pub type CommandFactory = Box<dyn Fn() -> Command + Send + Sync>;

/// Runs a server in a child process, restarting it as the error handler allows.
///
/// Dropping the supervisor shuts the server down.
pub struct Supervisor {
    server_name: String,
    client_rx: watch::Receiver<Option<RpcClient>>,
    starts: Arc<AtomicUsize>,
    stop_reason: Arc<OnceLock<StopReason>>,
    cancel: CancellationToken,
    cancel_on_drop: DropGuard,
    task: JoinHandle<StopReason>,
}

impl Supervisor {
    /// Start supervising the server launched by `command`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SupervisorConfig, command: impl Fn() -> Command + Send + Sync + 'static) -> Self {
        let server_name = config.error_handler.server_name.clone();
        let (client_tx, client_rx) = watch::channel(None);
        let starts = Arc::new(AtomicUsize::new(0));
        let stop_reason = Arc::new(OnceLock::new());
        let cancel = CancellationToken::new();

        let run = SupervisorLoop {
            handler: ConnectionErrorHandler::new(config.error_handler.clone()),
            config,
            command: Box::new(command),
            client_tx,
            starts: starts.clone(),
            stop_reason: stop_reason.clone(),
            cancel: cancel.clone(),
            error_count: 0,
        };
        let task = tokio::spawn(
            run.run()
                .instrument(tracing::info_span!("supervisor", server = %server_name)),
        );

        Self {
            server_name,
            client_rx,
            starts,
            stop_reason,
            cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            task,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The client of the running server, if it is running right now.
    pub fn client(&self) -> Option<RpcClient> {
        self.client_rx.borrow().clone()
    }

    /// Wait until the server is running and return its client.
    ///
    /// Fails once the supervisor stopped for good.
    pub async fn wait_for_client(&self) -> Result<RpcClient> {
        let mut client_rx = self.client_rx.clone();
        let outcome = client_rx.wait_for(Option::is_some).await.map(|client| client.clone());
        match outcome {
            Ok(Some(client)) => Ok(client),
            _ => Err(ClientError::Stopped {
                server_name: self.server_name.clone(),
                reason: self.stop_reason.get().copied().unwrap_or(StopReason::ShutDown),
            }),
        }
    }

    /// Receive every client the supervisor publishes, and `None` while the server is down.
    pub fn subscribe(&self) -> watch::Receiver<Option<RpcClient>> {
        self.client_rx.clone()
    }

    /// How many times the server has been launched so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Wait for the supervisor to stop on its own.
    pub async fn stopped(self) -> Result<StopReason> {
        let Supervisor {
            server_name,
            task,
            cancel_on_drop,
            ..
        } = self;
        let outcome = task.await;
        drop(cancel_on_drop);
        outcome.map_err(|source| ClientError::SupervisorPanicked { server_name, source })
    }

    /// Stop the server and the supervisor.
    pub async fn shutdown(self) -> Result<StopReason> {
        self.cancel.cancel();
        self.stopped().await
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("server_name", &self.server_name)
            .field("starts", &self.starts())
            .field("running", &self.client_rx.borrow().is_some())
            .finish()
    }
}

struct SupervisorLoop {
    config: SupervisorConfig,
    handler: ConnectionErrorHandler,
    command: CommandFactory,
    client_tx: watch::Sender<Option<RpcClient>>,
    starts: Arc<AtomicUsize>,
    stop_reason: Arc<OnceLock<StopReason>>,
    cancel: CancellationToken,
    /// Errors seen since the supervisor started, across restarts
    error_count: usize,
}

/// How one run of the server ended.
enum RunEnd {
    Cancelled,
    TooManyErrors,
    Closed,
}

impl SupervisorLoop {
    async fn run(mut self) -> StopReason {
        let reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::ShutDown;
            }

            let end = match self.start_server().await {
                Ok((connection, client, errors_rx)) => self.supervise(connection, client, errors_rx).await,
                Err(e) => {
                    if self.record_error(&e, Some("Failed to start server")) == ErrorAction::Shutdown {
                        RunEnd::TooManyErrors
                    } else {
                        RunEnd::Closed
                    }
                }
            };

            match end {
                RunEnd::Cancelled => break StopReason::ShutDown,
                RunEnd::TooManyErrors => break StopReason::TooManyErrors,
                RunEnd::Closed => match self.handler.closed() {
                    CloseAction::Restart => tracing::info!("Restarting server"),
                    CloseAction::DoNotRestart => break StopReason::TooManyRestarts,
                },
            }
        };

        tracing::info!(%reason, "Supervisor stopped");
        let _ = self.stop_reason.set(reason);
        reason
    }

    async fn start_server(&self) -> Result<(Connection, RpcClient, mpsc::UnboundedReceiver<String>)> {
        let start = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(start, "Starting server");

        let process = ChildProcess::run_with_max_line_length((self.command)(), self.config.max_line_length).await?;
        let connection = Connection::with_config(process, self.config.connection.clone());
        let client = RpcClient::for_port(Arc::new(connection.clone()), self.config.client.clone());

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        // The listener lives as long as the connection does
        let _ = connection.on_error(move |error| {
            let _ = errors_tx.send(error.to_string());
        });

        connection.open()?;
        self.client_tx.send_replace(Some(client.clone()));
        Ok((connection, client, errors_rx))
    }

    async fn supervise(
        &mut self,
        connection: Connection,
        client: RpcClient,
        mut errors_rx: mpsc::UnboundedReceiver<String>,
    ) -> RunEnd {
        let end = tokio::select! {
            _ = self.cancel.cancelled() => {
                connection.close_and_wait("Supervisor shut down").await;
                RunEnd::Cancelled
            }
            _ = connection.closed() => RunEnd::Closed,
        };

        self.client_tx.send_replace(None);
        client.dispose();

        // Transport errors are reported right before the connection closes
        let mut end = end;
        while let Ok(error) = errors_rx.try_recv() {
            if matches!(end, RunEnd::Closed) && self.record_error(&error, None) == ErrorAction::Shutdown {
                end = RunEnd::TooManyErrors;
            }
        }

        if let Some(reason) = connection.close_reason() {
            tracing::info!(%reason, "Connection to server closed");
        }
        end
    }

    fn record_error(&mut self, error: &dyn std::fmt::Display, message: Option<&str>) -> ErrorAction {
        self.error_count += 1;
        self.handler.error(error, message, self.error_count)
    }
}

/// Tests spawn `sh` scripts, so they only run on unix.
#[cfg(all(unix, test))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::testing;

    /// Echoes every line back, so whatever the client sends comes right back to it
    fn echo_command() -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("while IFS= read -r line; do echo \"$line\"; done");
        cmd
    }

    fn config(max_errors: usize, max_restarts: usize) -> SupervisorConfig {
        SupervisorConfig {
            error_handler: ErrorHandlerOptions {
                server_name: "test".to_string(),
                max_errors,
                max_restarts,
                restart_interval: Duration::from_secs(60),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publishes_a_working_client() {
        testing::init_test_logging();

        let supervisor = Supervisor::start(config(3, 5), echo_command);
        let client = supervisor.wait_for_client().await.unwrap();
        assert_eq!(supervisor.starts(), 1);

        // The echoed request is served by this same client, and the echoed response answers it
        client
            .handle_request(|method, params, _token| async move { Ok(json!({ "method": method, "params": params })) })
            .unwrap();
        let result = client.send_request("$ping", vec![json!(1)], None).await.unwrap();
        assert_eq!(result, json!({ "method": "$ping", "params": [1] }));

        assert_eq!(supervisor.shutdown().await.unwrap(), StopReason::ShutDown);
        assert!(client.is_disposed());
    }

    #[tokio::test]
    async fn restarts_until_the_budget_runs_out() {
        testing::init_test_logging();

        let supervisor = Supervisor::start(config(100, 2), || {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("exit 0");
            cmd
        });

        let starts = supervisor.starts.clone();
        let reason = tokio::time::timeout(Duration::from_secs(30), supervisor.stopped())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::TooManyRestarts);

        // The first start, then one per allowed restart
        assert_eq!(starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn spawn_failures_count_as_errors() {
        testing::init_test_logging();

        let supervisor = Supervisor::start(config(2, 100), || Command::new("/nonexistent/ipcox-test-server"));

        assert_matches!(
            supervisor.wait_for_client().await,
            Err(ClientError::Stopped { server_name, .. }) if server_name == "test"
        );
        let starts = supervisor.starts();
        assert_eq!(supervisor.stopped().await.unwrap(), StopReason::TooManyErrors);

        // Two errors are tolerated, the third stops it
        assert_eq!(starts, 3);
    }

    #[test]
    fn config_from_yaml() {
        let config: SupervisorConfig = serde_yaml::from_str(
            r#"
server_name: json-server
max_restarts: 2
restart_interval: 1m
client:
  request_timeout: 5s
connection:
  close_timeout: 250ms
"#,
        )
        .unwrap();

        assert_eq!(config.error_handler.server_name, "json-server");
        assert_eq!(config.error_handler.max_errors, 3);
        assert_eq!(config.error_handler.max_restarts, 2);
        assert_eq!(config.error_handler.restart_interval, Duration::from_secs(60));
        assert_eq!(config.client.request_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.connection.close_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }
}
