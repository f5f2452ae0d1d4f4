//! Error types for sshmux-exec

use std::time::Duration;

use thiserror::Error;

use crate::result::ExitStatus;

/// Errors that can occur while dialing a host or running a command on it
///
/// `Clone` so that one failed dial can be reported to every caller that was
/// waiting on the same connection.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Private key material could not be parsed
    #[error("while parsing private ssh key: {0}")]
    InvalidKey(String),

    /// Host never became reachable before the dial deadline
    #[error("timed out connecting to {addr} after {deadline:?}: {last_error}")]
    ConnectTimeout {
        /// Address that was probed
        addr: String,
        /// Overall dial deadline that elapsed
        deadline: Duration,
        /// Error from the last reachability probe
        last_error: String,
    },

    /// SSH handshake or protocol failure after the host was reachable
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Opening or driving a session channel failed
    #[error("while open ssh session: {0}")]
    ChannelFailed(String),

    /// Remote command ran and exited unsuccessfully
    #[error("command `{command}` exited with {status}: {}", String::from_utf8_lossy(.stderr).trim_end())]
    CommandFailed {
        /// Command text
        command: String,
        /// Exit status reported by the remote side
        status: ExitStatus,
        /// Stdout captured before exit
        stdout: Vec<u8>,
        /// Stderr captured before exit
        stderr: Vec<u8>,
    },

    /// Channel closed before the remote side reported an exit status
    #[error("command `{command}` interrupted before reporting an exit status")]
    Interrupted {
        /// Command text
        command: String,
        /// Stdout captured before the channel closed
        stdout: Vec<u8>,
        /// Stderr captured before the channel closed
        stderr: Vec<u8>,
    },

    /// Dial abandoned: the task ended without an outcome, or the entry was
    /// evicted while it ran
    #[error("dial aborted before completing")]
    DialAborted,

    /// Local I/O error (e.g. reading the input stream)
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Dial deadline elapsed without the host becoming reachable
    #[must_use]
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, ExecError::ConnectTimeout { .. })
    }

    /// Remote command ran and exited unsuccessfully
    #[must_use]
    pub fn is_exec_error(&self) -> bool {
        matches!(self, ExecError::CommandFailed { .. })
    }

    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectTimeout { .. } | ExecError::DialAborted
        )
    }

    /// Stdout and stderr captured before the failure, if any command ran
    #[must_use]
    pub fn partial_output(&self) -> Option<(&[u8], &[u8])> {
        match self {
            ExecError::CommandFailed { stdout, stderr, .. }
            | ExecError::Interrupted { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

/// Free-function form of [`ExecError::is_connect_timeout`]
#[must_use]
pub fn is_connect_timeout(err: &ExecError) -> bool {
    err.is_connect_timeout()
}

/// Free-function form of [`ExecError::is_exec_error`]
#[must_use]
pub fn is_exec_error(err: &ExecError) -> bool {
    err.is_exec_error()
}
