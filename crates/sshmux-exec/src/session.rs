//! Command session: one command on one admitted channel

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::result::{CommandOutput, ExitStatus};
use crate::traits::{Channel, Stdin};

/// An open channel holding one admission slot
///
/// The slot is released when the session is consumed by [`run`] or
/// [`close`], or when it is dropped (including on panic or cancellation).
///
/// [`run`]: CommandSession::run
/// [`close`]: CommandSession::close
pub struct CommandSession {
    channel: Box<dyn Channel>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for CommandSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSession").finish_non_exhaustive()
    }
}

impl CommandSession {
    pub(crate) fn new(channel: Box<dyn Channel>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            channel,
            _permit: permit,
        }
    }

    /// Run `command` to completion and release the slot
    ///
    /// Stdout and stderr are captured separately. On failure the output
    /// captured so far travels inside the error.
    ///
    /// # Errors
    /// - `ExecError::CommandFailed` if the command exits non-zero or is killed by a signal
    /// - `ExecError::Interrupted` if the channel closes before an exit status arrives
    /// - `ExecError::ChannelFailed` / `ExecError::IoError` if the channel cannot be driven
    #[instrument(skip(self, stdin), fields(with_stdin = stdin.is_some()))]
    pub async fn run(
        mut self,
        command: &str,
        stdin: Option<Stdin>,
    ) -> Result<CommandOutput, ExecError> {
        debug!(command = %command, "executing remote command");

        let result = self.channel.exec(command, stdin).await;

        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "error closing channel after exec");
        }

        let output = result?;

        debug!(
            command = %command,
            exit = ?output.exit,
            duration = ?output.duration,
            "remote command completed"
        );

        match output.exit {
            Some(ExitStatus::Code(0)) => Ok(output),
            Some(status) => {
                warn!(command = %command, %status, "remote command failed");
                Err(ExecError::CommandFailed {
                    command: command.to_string(),
                    status,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            None => {
                warn!(command = %command, "channel closed without exit status");
                Err(ExecError::Interrupted {
                    command: command.to_string(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
        }
    }

    /// Close the channel without running anything
    ///
    /// # Errors
    /// Returns the channel's close error; the slot is released regardless
    pub async fn close(mut self) -> Result<(), ExecError> {
        self.channel.close().await
    }
}
