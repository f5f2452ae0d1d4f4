//! Admission-controlled connection
//!
//! Bounds how many sessions may be open at once on one transport
//! connection. Callers over the limit wait for a permit, in arrival
//! order.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::session::CommandSession;
use crate::traits::Connection;

/// Transport connection plus its session gate
pub struct GatedConnection {
    inner: Arc<dyn Connection>,
    permits: Arc<Semaphore>,
    limit: usize,
    label: String,
}

impl fmt::Debug for GatedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatedConnection")
            .field("label", &self.label)
            .field("limit", &self.limit)
            .field("sessions_in_use", &self.sessions_in_use())
            .finish_non_exhaustive()
    }
}

impl GatedConnection {
    /// Wrap `inner`, allowing at most `limit` concurrent sessions
    ///
    /// `label` is only used for logging.
    pub fn new(inner: Arc<dyn Connection>, limit: usize, label: impl Into<String>) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            label: label.into(),
        }
    }

    /// Configured session limit
    #[must_use]
    pub fn session_limit(&self) -> usize {
        self.limit
    }

    /// Sessions currently open
    #[must_use]
    pub fn sessions_in_use(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Open a session, waiting while the connection is at its limit
    ///
    /// If the channel cannot be opened the slot is handed back before the
    /// error is returned.
    ///
    /// # Errors
    /// Returns `ExecError::ChannelFailed` if the gate is closed or the
    /// channel cannot be opened
    #[instrument(skip(self), fields(conn = %self.label))]
    pub async fn open_session(&self) -> Result<CommandSession, ExecError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExecError::ChannelFailed("connection is closed".to_string()))?;

        let channel = match self.inner.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "failed to open session channel");
                return Err(e);
            }
        };

        debug!(in_use = self.sessions_in_use(), limit = self.limit, "session opened");
        Ok(CommandSession::new(channel, permit))
    }

    /// Disconnect the underlying transport
    ///
    /// Sessions waiting for a slot fail; sessions already open finish or
    /// fail with the transport.
    ///
    /// # Errors
    /// Returns the transport's error if disconnecting fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        self.permits.close();
        self.inner.disconnect().await
    }
}
