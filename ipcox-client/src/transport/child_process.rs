use std::{
    borrow::Cow,
    io::{self, IoSlice},
    pin::Pin,
    process::Command,
    task::{Context, Poll},
};

use futures::{FutureExt, SinkExt, StreamExt};
use pin_project::pin_project;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::Instrument;

use crate::{ClientError, Result};

/// Default max length of one message on this transport
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Transport to a server launched as a child process, speaking newline-delimited messages over
/// its stdin and stdout.
///
/// Whatever the child writes to stderr is logged.  When this is dropped the child process is
/// killed.
#[derive(Debug)]
pub struct ChildProcess {
    child: tokio::process::Child,
    io: Framed<ChildDuplex, LinesCodec>,
    peer: String,
}

impl ChildProcess {
    /// Launch the server as a child process described by the given [`Command`].
    ///
    /// This will launch the child process and then immediately return.
    pub async fn run(command: Command) -> Result<Self> {
        Self::run_with_max_line_length(command, DEFAULT_MAX_LINE_LENGTH).await
    }

    /// Like [`Self::run`], rejecting inbound lines longer than `max_line_length` bytes.
    pub async fn run_with_max_line_length(command: Command, max_line_length: usize) -> Result<Self> {
        // Internally we use tokio to manage the process
        let mut command: tokio::process::Command = command.into();

        command
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped());

        let program = command.as_std().get_program().to_string_lossy().to_string();
        let args = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>();

        tracing::debug!(%program,
            args = %args.join(" "),
            "Spawning server as child process"
        );

        let mut child = command.spawn().map_err(|e| ClientError::SpawnServer {
            source: e,
            program: program.clone(),
            args,
        })?;

        let pid = child.id();
        tracing::debug!(pid, "Child process spawned");

        let missing = |stream| ClientError::MissingPipe {
            program: program.clone(),
            stream,
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        // Servers report their own trouble on stderr, which is often the only clue when one
        // fails cryptically
        tokio::spawn(
            async move {
                let mut lines = BufReader::new(stderr).lines();

                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => tracing::warn!("{}", line),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(error = %e, "Stopped reading stderr");
                            break;
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("child_process_stderr", pid)),
        );

        let peer = match pid {
            Some(pid) => format!("{program} (pid {pid})"),
            None => program,
        };

        Ok(Self {
            child,
            io: Framed::new(
                ChildDuplex { stdin, stdout },
                LinesCodec::new_with_max_length(max_line_length),
            ),
            peer,
        })
    }

    /// OS process id, while the child is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// A pair of stdin and stdout streams for a child process that together works as a duplex channel
/// implementing [`AsyncRead`] and [`AsyncWrite`] both.
#[derive(Debug)]
#[pin_project]
pub struct ChildDuplex {
    #[pin]
    stdin: tokio::process::ChildStdin,
    #[pin]
    stdout: tokio::process::ChildStdout,
}

impl AsyncRead for ChildDuplex {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(self.project().stdout, cx, buf)
    }
}

impl AsyncWrite for ChildDuplex {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().stdin, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().stdin, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        AsyncWrite::poll_shutdown(self.project().stdin, cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        AsyncWrite::poll_write_vectored(self.project().stdin, cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        AsyncWrite::is_write_vectored(&self.stdin)
    }
}

impl ipcox_rpc::Transport for ChildProcess {
    type Error = LinesCodecError;

    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Owned(self.peer.clone())
    }

    fn send_message(&mut self, message: String) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.io.send(message)
    }

    fn receive_message(&mut self) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_ {
        self.io
            .next()
            .map(|opt_result: Option<Result<_, LinesCodecError>>| opt_result.transpose())
    }
}

/// Tests for this rely on UNIX-specific commands, so on Windows we'll just have to assume this
/// works for now.
#[cfg(all(unix, test))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use ipcox_rpc::Transport;
    use tokio::time::timeout;

    use super::*;
    use crate::testing;

    /// Echoes every line back on stdout, and notes it on stderr
    fn echo_command() -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("while IFS= read -r line; do echo \"$line\"; echo \"DEBUG: Received message\" >&2; done");
        cmd
    }

    /// Echoes `count` lines, then exits
    fn limited_echo_command(count: usize) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "i=0; while IFS= read -r line && [ $i -lt {count} ]; do echo \"$line\"; i=$((i+1)); done"
        ));
        cmd
    }

    #[tokio::test]
    async fn echoes_messages_in_order() {
        testing::init_test_logging();

        let mut process = ChildProcess::run(echo_command()).await.unwrap();
        assert!(process.remote_peer().starts_with("sh (pid "));

        for i in 0..5 {
            let message = format!("{{\"message\":{i}}}");
            process.send_message(message.clone()).await.unwrap();

            let response = process.receive_message().await.unwrap();
            assert_eq!(response, Some(message));
        }
    }

    #[tokio::test]
    async fn child_exit_ends_the_stream() {
        testing::init_test_logging();

        let mut process = ChildProcess::run(limited_echo_command(2)).await.unwrap();
        for i in 0..2 {
            let message = format!("message {i}");
            process.send_message(message.clone()).await.unwrap();
            assert_eq!(process.receive_message().await.unwrap(), Some(message));
        }

        // The process has exited once it reads this, so there's no response
        let _ = process.send_message("one too many".to_string()).await;
        let result = timeout(Duration::from_secs(5), process.receive_message())
            .await
            .expect("receive_message hung after the child exited");
        assert_matches!(result, Ok(None) | Err(_));
    }

    #[tokio::test]
    async fn oversized_lines_are_rejected() {
        testing::init_test_logging();

        let mut process = ChildProcess::run_with_max_line_length(echo_command(), 64).await.unwrap();
        process.send_message("x".repeat(65)).await.unwrap();

        assert_matches!(
            process.receive_message().await,
            Err(LinesCodecError::MaxLineLengthExceeded)
        );
    }

    #[tokio::test]
    async fn spawn_failure_names_the_program() {
        testing::init_test_logging();

        let mut command = Command::new("/nonexistent/ipcox-test-server");
        command.arg("--stdio");
        assert_matches!(
            ChildProcess::run(command).await,
            Err(ClientError::SpawnServer { program, args, .. }) => {
                assert_eq!(program, "/nonexistent/ipcox-test-server");
                assert_eq!(args, vec!["--stdio".to_string()]);
            }
        );
    }

    #[tokio::test]
    async fn child_is_killed_on_drop() {
        use nix::sys::signal;
        use nix::unistd::Pid;

        testing::init_test_logging();

        let process = ChildProcess::run(echo_command()).await.unwrap();
        let pid = process.pid().expect("Child should have a valid PID");

        // Signal `None` only checks that the process exists
        let is_process_running = |pid: u32| -> bool { signal::kill(Pid::from_raw(pid as i32), None).is_ok() };
        assert!(is_process_running(pid), "Process should be running");

        drop(process);

        // Killed children linger as zombies until reaped, which tokio does in the background
        for _ in 0..1000 {
            if !is_process_running(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!is_process_running(pid), "Process should be terminated after drop");
    }
}
