//! Credential identity used as the connection pool key

use std::fmt;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Key material, remote user and host address of one endpoint
///
/// Equality is structural; two identities that compare equal share one
/// pooled connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CredentialIdentity {
    private_key: String,
    user: String,
    host: String,
    port: u16,
}

impl CredentialIdentity {
    /// Create a new identity on the default port
    pub fn new(
        private_key: impl Into<String>,
        user: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            private_key: private_key.into(),
            user: user.into(),
            host: host.into(),
            port: DEFAULT_PORT,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Private key material (OpenSSH or PEM text)
    #[must_use]
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Remote user
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Host name or address
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` for dialing and logging
    #[must_use]
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIdentity")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.addr())
    }
}
