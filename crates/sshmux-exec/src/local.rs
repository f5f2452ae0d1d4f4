//! Local transport using `tokio::process`
//!
//! Runs commands on this machine through `sh -c`, with the same stdin and
//! output contract as the SSH transport. Credentials are ignored.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::DialConfig;
use crate::error::ExecError;
use crate::identity::CredentialIdentity;
use crate::result::{CommandOutput, ExitStatus};
use crate::traits::{Channel, Connection, Dialer, FeedError, Stdin, copy_stdin};

/// Dialer whose connections run commands locally
#[derive(Debug, Clone, Default)]
pub struct LocalDialer;

impl LocalDialer {
    /// Create a new local dialer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial(
        &self,
        identity: &CredentialIdentity,
        _config: &DialConfig,
    ) -> Result<Arc<dyn Connection>, ExecError> {
        debug!(host = %identity.host(), "using local connection");
        Ok(Arc::new(LocalConnection::default()))
    }
}

/// Loopback connection
#[derive(Debug, Default)]
pub struct LocalConnection {
    closed: AtomicBool,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, ExecError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecError::ChannelFailed("connection is closed".to_string()));
        }
        Ok(Box::new(LocalChannel))
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One local process per exec
#[derive(Debug)]
struct LocalChannel;

#[async_trait]
impl Channel for LocalChannel {
    #[instrument(skip(self, stdin), level = "debug")]
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<Stdin>,
    ) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();

        // Use shell to support pipes, redirections, etc.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::ChannelFailed(format!("failed to spawn process: {e}")))?;

        let pipe = child.stdin.take();
        let feed = async move {
            match (stdin, pipe) {
                // pipe is dropped afterwards, closing the child's stdin
                (Some(mut input), Some(mut pipe)) => copy_stdin(&mut input, &mut pipe).await,
                _ => Ok(0),
            }
        };

        // dropping `collect` kills the child
        let collect = child.wait_with_output();
        tokio::pin!(collect);

        let output = tokio::select! {
            fed = feed => {
                match fed {
                    Ok(bytes) => debug!(bytes, "stdin delivered"),
                    Err(FeedError::Read(e)) => {
                        warn!(error = %e, "failed to read stdin, killing command");
                        return Err(ExecError::IoError(format!("failed to read stdin: {e}")));
                    }
                    // the child may exit without reading all of its input
                    Err(FeedError::Write(e)) => debug!(error = %e, "stdin not fully delivered"),
                }
                collect.await
            }
            output = &mut collect => output,
        };
        let output = output.map_err(|e| ExecError::IoError(e.to_string()))?;

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit: exit_status(output.status),
            duration: start.elapsed(),
        })
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        Ok(())
    }
}

fn exit_status(status: std::process::ExitStatus) -> Option<ExitStatus> {
    if let Some(code) = status.code() {
        return Some(ExitStatus::Code(code.cast_unsigned()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(ExitStatus::Signal(signal.to_string()));
        }
    }

    None
}
