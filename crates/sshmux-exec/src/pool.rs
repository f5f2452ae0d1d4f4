//! Connection pool
//!
//! Maps each credential identity to a single-flight [`ConnectionFuture`].
//! The first caller for an identity triggers the dial; every caller for
//! that identity shares the resulting connection (or error).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{DialConfig, FailurePolicy, PoolConfig};
use crate::connection::GatedConnection;
use crate::error::ExecError;
use crate::future::{CompletionGuard, ConnectionFuture};
use crate::identity::CredentialIdentity;
use crate::result::CommandOutput;
use crate::traits::{Dialer, Stdin};

/// Registry of connections keyed by credential identity
///
/// Owned by the application rather than living in a global, so separate
/// pools (e.g. one per test) never share connections.
pub struct ConnectionPool {
    dialer: Arc<dyn Dialer>,
    config: PoolConfig,
    entries: Arc<Mutex<Registry>>,
}

type Registry = HashMap<CredentialIdentity, Arc<ConnectionFuture>>;

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool that dials through `dialer`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if `config` is invalid
    pub fn new(dialer: Arc<dyn Dialer>, config: PoolConfig) -> Result<Self, ExecError> {
        config.validate()?;
        Ok(Self {
            dialer,
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the connection for `identity` using the pool's dial policy
    ///
    /// # Errors
    /// Returns the dial error shared by every caller of this identity
    pub async fn acquire(
        &self,
        identity: &CredentialIdentity,
    ) -> Result<Arc<GatedConnection>, ExecError> {
        self.acquire_with(identity, &self.config.dial).await
    }

    /// Get the connection for `identity`, dialing with `dial` if this call
    /// creates the entry
    ///
    /// Concurrent callers for the same identity cause exactly one dial.
    /// `dial` is ignored when another caller's dial is already in flight or
    /// has completed.
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if `dial` is invalid, otherwise the
    /// dial error shared by every caller of this identity
    #[instrument(skip(self, identity, dial), fields(host = %identity))]
    pub async fn acquire_with(
        &self,
        identity: &CredentialIdentity,
        dial: &DialConfig,
    ) -> Result<Arc<GatedConnection>, ExecError> {
        dial.validate()?;

        let (future, created) = {
            let mut entries = self.entries.lock().await;
            match entries.get(identity).map(Arc::clone) {
                Some(existing) if !self.should_redial(&existing) => (existing, false),
                previous => {
                    if previous.is_some() {
                        info!("previous dial failed, dialing again");
                    }
                    let future = Arc::new(ConnectionFuture::pending());
                    entries.insert(identity.clone(), Arc::clone(&future));
                    (future, true)
                }
            }
        };

        if created {
            self.spawn_dial(identity.clone(), *dial, Arc::clone(&future));
        } else {
            debug!("joining existing connection");
        }

        future.wait().await
    }

    fn should_redial(&self, existing: &ConnectionFuture) -> bool {
        match self.config.failure_policy {
            FailurePolicy::Remember => false,
            FailurePolicy::RetryAfter(cooldown) => existing
                .failed_at()
                .is_some_and(|at| at.elapsed() >= cooldown),
        }
    }

    // Runs detached so a cancelled caller cannot leave other waiters hanging.
    // The outcome is published under the registry lock, and only while the
    // entry is still registered; otherwise evict/shutdown already ran and
    // the connection is closed here.
    fn spawn_dial(
        &self,
        identity: CredentialIdentity,
        dial: DialConfig,
        future: Arc<ConnectionFuture>,
    ) {
        let dialer = Arc::clone(&self.dialer);
        let entries = Arc::clone(&self.entries);
        let limit = self.config.session_limit;
        let guard = CompletionGuard::new(Arc::clone(&future));

        tokio::spawn(async move {
            info!(host = %identity, deadline = ?dial.deadline, "dialing");
            let result = dialer.dial(&identity, &dial).await;

            let registry = entries.lock().await;
            let registered = registry
                .get(&identity)
                .is_some_and(|current| Arc::ptr_eq(current, &future));

            match result {
                Ok(conn) if registered => {
                    info!(host = %identity, "connection established");
                    let gated = GatedConnection::new(conn, limit, identity.to_string());
                    guard.complete(Ok(Arc::new(gated)));
                }
                Ok(conn) => {
                    drop(registry);
                    warn!(host = %identity, "entry removed while dialing, closing connection");
                    guard.complete(Err(ExecError::DialAborted));
                    if let Err(e) = conn.disconnect().await {
                        warn!(host = %identity, error = %e, "error disconnecting");
                    }
                }
                Err(e) => {
                    warn!(host = %identity, error = %e, "dial failed");
                    guard.complete(Err(e));
                }
            }
        });
    }

    /// Run `command` on `identity` with no input
    ///
    /// # Errors
    /// See [`CommandSession::run`](crate::CommandSession::run); dial errors
    /// are returned as from [`acquire`](Self::acquire)
    pub async fn run(
        &self,
        identity: &CredentialIdentity,
        command: &str,
    ) -> Result<CommandOutput, ExecError> {
        self.run_inner(identity, command, None).await
    }

    /// Run `command` on `identity`, streaming `stdin` into it
    ///
    /// # Errors
    /// See [`run`](Self::run)
    pub async fn run_with_stdin<R>(
        &self,
        identity: &CredentialIdentity,
        command: &str,
        stdin: R,
    ) -> Result<CommandOutput, ExecError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.run_inner(identity, command, Some(Box::new(stdin))).await
    }

    async fn run_inner(
        &self,
        identity: &CredentialIdentity,
        command: &str,
        stdin: Option<Stdin>,
    ) -> Result<CommandOutput, ExecError> {
        let conn = self.acquire(identity).await?;
        let session = conn.open_session().await?;
        session.run(command, stdin).await
    }

    /// Establish (or reuse) the connection without running anything
    ///
    /// # Errors
    /// Returns the dial error, e.g. one where `is_connect_timeout()` holds
    /// for a host that is gone
    pub async fn check(&self, identity: &CredentialIdentity) -> Result<(), ExecError> {
        self.acquire(identity).await.map(|_| ())
    }

    /// Connection for `identity` if one has already been established
    pub async fn get(&self, identity: &CredentialIdentity) -> Option<Arc<GatedConnection>> {
        let entries = self.entries.lock().await;
        entries.get(identity).and_then(|f| f.connection())
    }

    /// Forget `identity`, disconnecting its connection if it has one
    ///
    /// The next acquire dials afresh. A dial still in flight is discarded
    /// when it finishes and its waiters get `ExecError::DialAborted`.
    /// Returns whether an entry existed.
    #[instrument(skip(self, identity), fields(host = %identity))]
    pub async fn evict(&self, identity: &CredentialIdentity) -> bool {
        let removed = self.entries.lock().await.remove(identity);
        let Some(future) = removed else {
            return false;
        };

        if let Some(conn) = future.connection()
            && let Err(e) = conn.disconnect().await
        {
            warn!(error = %e, "error disconnecting evicted connection");
        }
        info!("evicted");
        true
    }

    /// Disconnect every established connection and empty the pool
    ///
    /// Dials still in flight are discarded as for [`evict`](Self::evict).
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        for (identity, future) in drained {
            if let Some(conn) = future.connection()
                && let Err(e) = conn.disconnect().await
            {
                warn!(host = %identity, error = %e, "error disconnecting");
            }
        }
        info!("connection pool shut down");
    }

    /// Number of identities in the pool, including pending and failed ones
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the pool has no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Dial a connection of its own for `identity`, outside the registry
    ///
    /// The caller owns it and should [`disconnect`](GatedConnection::disconnect)
    /// when done. The pool's session limit still applies.
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if `dial` is invalid, otherwise the
    /// dial error
    #[instrument(skip(self, identity, dial), fields(host = %identity))]
    pub async fn open_dedicated(
        &self,
        identity: &CredentialIdentity,
        dial: &DialConfig,
    ) -> Result<GatedConnection, ExecError> {
        dial.validate()?;
        let conn = self.dialer.dial(identity, dial).await?;
        info!("dedicated connection established");
        Ok(GatedConnection::new(
            conn,
            self.config.session_limit,
            identity.to_string(),
        ))
    }
}
