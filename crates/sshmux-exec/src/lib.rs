//! sshmux-exec: Pooled remote command execution
//!
//! One transport connection per credential identity, shared by every caller
//! and bounded to a fixed number of concurrent command sessions.

pub mod config;
pub mod connection;
pub mod error;
pub mod future;
pub mod identity;
pub mod keys;
pub mod local;
pub mod pool;
pub mod result;
pub mod session;
pub mod ssh;
pub mod traits;

pub use config::{DEFAULT_SESSION_LIMIT, DialConfig, FailurePolicy, PoolConfig};
pub use connection::GatedConnection;
pub use error::{ExecError, is_connect_timeout, is_exec_error};
pub use future::ConnectionFuture;
pub use identity::CredentialIdentity;
pub use keys::{KeyError, KeySource};
pub use local::LocalDialer;
pub use pool::ConnectionPool;
pub use result::{CommandOutput, ExitStatus};
pub use session::CommandSession;
pub use ssh::SshDialer;
pub use traits::{Channel, Connection, Dialer, Stdin};
