//! Single-flight connection future
//!
//! One `ConnectionFuture` exists per identity. Exactly one dial completes
//! it; everyone else waits on it and observes the same outcome.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::connection::GatedConnection;
use crate::error::ExecError;

#[derive(Debug, Clone)]
enum DialState {
    Pending,
    Resolved(Arc<GatedConnection>),
    Failed { error: ExecError, at: Instant },
}

impl DialState {
    fn outcome(&self) -> Option<Result<Arc<GatedConnection>, ExecError>> {
        match self {
            DialState::Pending => None,
            DialState::Resolved(conn) => Some(Ok(Arc::clone(conn))),
            DialState::Failed { error, .. } => Some(Err(error.clone())),
        }
    }
}

/// Connection that is being, or has been, established
#[derive(Debug)]
pub struct ConnectionFuture {
    state: watch::Sender<DialState>,
}

impl ConnectionFuture {
    pub(crate) fn pending() -> Self {
        let (state, _) = watch::channel(DialState::Pending);
        Self { state }
    }

    /// Wait until the dial completes and return its outcome
    ///
    /// # Errors
    /// Returns the dial's error if it failed
    pub async fn wait(&self) -> Result<Arc<GatedConnection>, ExecError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, DialState::Pending))
            .await
            .map_err(|_| ExecError::DialAborted)?;
        state.outcome().unwrap_or(Err(ExecError::DialAborted))
    }

    /// Outcome if the dial has completed
    #[must_use]
    pub fn try_get(&self) -> Option<Result<Arc<GatedConnection>, ExecError>> {
        self.state.borrow().outcome()
    }

    /// Resolved connection, if any
    #[must_use]
    pub fn connection(&self) -> Option<Arc<GatedConnection>> {
        self.try_get().and_then(Result::ok)
    }

    /// When the dial failed, if it did
    #[must_use]
    pub fn failed_at(&self) -> Option<Instant> {
        match &*self.state.borrow() {
            DialState::Failed { at, .. } => Some(*at),
            _ => None,
        }
    }

    /// Record the dial outcome; only the first call has any effect
    pub(crate) fn complete(&self, result: Result<Arc<GatedConnection>, ExecError>) -> bool {
        self.state.send_if_modified(|state| {
            if !matches!(state, DialState::Pending) {
                return false;
            }
            *state = match result {
                Ok(conn) => DialState::Resolved(conn),
                Err(error) => DialState::Failed {
                    error,
                    at: Instant::now(),
                },
            };
            true
        })
    }
}

/// Held by the dialing task; fails the future if dropped uncompleted
pub(crate) struct CompletionGuard {
    future: Arc<ConnectionFuture>,
}

impl CompletionGuard {
    pub(crate) fn new(future: Arc<ConnectionFuture>) -> Self {
        Self { future }
    }

    pub(crate) fn complete(self, result: Result<Arc<GatedConnection>, ExecError>) {
        self.future.complete(result);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.future.complete(Err(ExecError::DialAborted));
    }
}
