//! Crash and restart policy for a connection to a server running in a child process.
//!
//! Errors are counted for the lifetime of the handler.  Restarts are limited with a sliding
//! window: at most `max_restarts` restarts within `restart_interval`, after which the handler
//! refuses to restart the server ever again.
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ipcox_core::sync::MutexExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerOptions {
    /// Name of the server, used in log messages
    pub server_name: String,

    /// Errors tolerated before the connection is shut down
    pub max_errors: usize,

    /// Restarts allowed within `restart_interval`
    pub max_restarts: usize,

    #[serde(with = "humantime_serde")]
    pub restart_interval: Duration,
}

impl Default for ErrorHandlerOptions {
    fn default() -> Self {
        Self {
            server_name: "server".to_string(),
            max_errors: 3,
            max_restarts: 5,
            restart_interval: Duration::from_secs(3 * 60),
        }
    }
}

/// What to do with a connection after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorAction {
    Continue,
    Shutdown,
}

/// What to do after a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CloseAction {
    DoNotRestart,
    Restart,
}

#[derive(Debug)]
pub struct ConnectionErrorHandler {
    options: ErrorHandlerOptions,
    /// Times of the most recent restarts, oldest first.  Never longer than `max_restarts + 1`.
    restarts: Mutex<VecDeque<Instant>>,
    gave_up: AtomicBool,
}

impl ConnectionErrorHandler {
    pub fn new(options: ErrorHandlerOptions) -> Self {
        Self {
            restarts: Mutex::new(VecDeque::with_capacity(options.max_restarts + 1)),
            options,
            gave_up: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ErrorHandlerOptions {
        &self.options
    }

    /// Whether the connection should stop for good after its `count`th error.
    pub fn should_stop(&self, error: &dyn fmt::Display, message: Option<&str>, count: usize) -> bool {
        let stop = count > self.options.max_errors;
        if stop {
            tracing::error!(
                server = %self.options.server_name,
                %error,
                detail = message,
                count,
                "Connection to server is erroring ({count} errors, more than the {} allowed). Shutting down server.",
                self.options.max_errors,
            );
        } else {
            tracing::warn!(server = %self.options.server_name, %error, detail = message, count, "Connection error");
        }
        stop
    }

    /// Record a restart happening now, and decide whether it may go ahead.
    pub fn should_restart(&self) -> bool {
        if self.gave_up.load(Ordering::SeqCst) {
            return false;
        }

        let mut restarts = self.restarts.lock_unpoisoned();
        restarts.push_back(Instant::now());
        if restarts.len() <= self.options.max_restarts {
            return true;
        }

        let (Some(oldest), Some(newest)) = (restarts.front().copied(), restarts.back().copied()) else {
            return true;
        };
        if newest.duration_since(oldest) <= self.options.restart_interval {
            self.gave_up.store(true, Ordering::SeqCst);
            tracing::error!(
                server = %self.options.server_name,
                restarts = restarts.len(),
                "The {} server crashed {} times in the last {}. The server will not be restarted.",
                self.options.server_name,
                restarts.len(),
                humantime::format_duration(self.options.restart_interval),
            );
            false
        } else {
            restarts.pop_front();
            true
        }
    }

    /// Map the `count`th connection error to an action.
    pub fn error(&self, error: &dyn fmt::Display, message: Option<&str>, count: usize) -> ErrorAction {
        if self.should_stop(error, message, count) {
            ErrorAction::Shutdown
        } else {
            ErrorAction::Continue
        }
    }

    /// Map a closed connection to an action.
    pub fn closed(&self) -> CloseAction {
        if self.should_restart() {
            CloseAction::Restart
        } else {
            CloseAction::DoNotRestart
        }
    }

    /// Whether restarts were refused for good.
    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn handler() -> ConnectionErrorHandler {
        ConnectionErrorHandler::new(ErrorHandlerOptions {
            server_name: "test".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn errors_are_tolerated_up_to_the_limit() {
        testing::init_test_logging();

        let handler = handler();
        for count in 1..=3 {
            assert!(!handler.should_stop(&"broken pipe", None, count));
            assert_eq!(handler.error(&"broken pipe", Some("write failed"), count), ErrorAction::Continue);
        }
        assert!(handler.should_stop(&"broken pipe", None, 4));
        assert_eq!(handler.error(&"broken pipe", None, 4), ErrorAction::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_within_the_window_are_capped() {
        testing::init_test_logging();

        let handler = handler();
        for _ in 0..5 {
            assert!(handler.should_restart());
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert!(!handler.should_restart());
        assert!(handler.gave_up());

        // Once refused, it stays refused
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert!(!handler.should_restart());
        assert_eq!(handler.closed(), CloseAction::DoNotRestart);
    }

    #[tokio::test(start_paused = true)]
    async fn old_restarts_slide_out_of_the_window() {
        testing::init_test_logging();

        let handler = handler();
        for _ in 0..5 {
            assert!(handler.should_restart());
        }

        // Just past the window measured from the oldest restart
        tokio::time::advance(Duration::from_secs(3 * 60 + 1)).await;
        assert!(handler.should_restart());
        assert_eq!(handler.restarts.lock_unpoisoned().len(), 5);

        // The window now starts at the second restart, which was also at time zero
        assert_eq!(handler.closed(), CloseAction::Restart);
        assert!(!handler.gave_up());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_exactly_at_the_window_edge_is_refused() {
        testing::init_test_logging();

        let handler = handler();
        for _ in 0..5 {
            assert!(handler.should_restart());
        }
        tokio::time::advance(Duration::from_secs(3 * 60)).await;
        assert!(!handler.should_restart());
    }

    #[test]
    fn options_from_yaml() {
        let options: ErrorHandlerOptions = serde_yaml::from_str(
            r#"
server_name: rust-analyzer
max_errors: 10
restart_interval: 90s
"#,
        )
        .unwrap();

        assert_eq!(options.server_name, "rust-analyzer");
        assert_eq!(options.max_errors, 10);
        assert_eq!(options.max_restarts, 5);
        assert_eq!(options.restart_interval, Duration::from_secs(90));
    }

    #[test]
    fn actions_display_in_snake_case() {
        assert_eq!(ErrorAction::Shutdown.to_string(), "shutdown");
        assert_eq!(CloseAction::DoNotRestart.to_string(), "do_not_restart");
    }
}
