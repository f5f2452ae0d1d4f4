//! Transport traits
//!
//! The pool only talks to these; `ssh` and `local` provide the
//! implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::DialConfig;
use crate::error::ExecError;
use crate::identity::CredentialIdentity;
use crate::result::CommandOutput;

/// Input stream attached to a remote command's stdin
pub type Stdin = Box<dyn AsyncRead + Send + Unpin>;

const STDIN_BUF_SIZE: usize = 32 * 1024;

/// Side of a stdin copy that failed
#[derive(Debug)]
pub(crate) enum FeedError {
    /// The caller's input stream failed; the command saw truncated input
    Read(std::io::Error),
    /// The command stopped accepting input, usually because it exited
    Write(std::io::Error),
}

/// Copy `input` into `writer` until EOF, returning the byte count
///
/// Does not close `writer`.
pub(crate) async fn copy_stdin<W>(input: &mut Stdin, writer: &mut W) -> Result<u64, FeedError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; STDIN_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf).await.map_err(FeedError::Read)?;
        if n == 0 {
            return Ok(total);
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(FeedError::Write)?;
        total += n as u64;
    }
}

/// Establishes one authenticated connection to a host
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        identity: &CredentialIdentity,
        config: &DialConfig,
    ) -> Result<Arc<dyn Connection>, ExecError>;
}

/// An established, multiplexed connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open one session channel
    async fn open_channel(&self) -> Result<Box<dyn Channel>, ExecError>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<(), ExecError>;
}

/// One session channel on a connection
#[async_trait]
pub trait Channel: Send {
    /// Run `command`, feeding `stdin` if given, until the channel closes
    ///
    /// `Ok` with `exit == None` means the channel closed without reporting
    /// an exit status. `Err` is reserved for failures to drive the channel
    /// and for `stdin` failing to read, in which case the command is torn
    /// down without seeing EOF.
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<Stdin>,
    ) -> Result<CommandOutput, ExecError>;

    /// Close the channel
    async fn close(&mut self) -> Result<(), ExecError>;
}
