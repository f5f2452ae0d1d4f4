//! Dialer selection for command-line targets

use std::sync::Arc;

use async_trait::async_trait;
use sshmux_exec::{
    Connection, CredentialIdentity, DialConfig, Dialer, ExecError, LocalDialer, SshDialer,
};

/// Dials `localhost` targets locally and everything else over SSH
#[derive(Debug, Clone, Default)]
pub struct HostDialer {
    ssh: SshDialer,
    local: LocalDialer,
}

impl HostDialer {
    /// Create a new dialer
    pub fn new() -> Self {
        Self::default()
    }

    fn is_local(identity: &CredentialIdentity) -> bool {
        identity.host() == "localhost" || identity.host() == "127.0.0.1"
    }
}

#[async_trait]
impl Dialer for HostDialer {
    async fn dial(
        &self,
        identity: &CredentialIdentity,
        config: &DialConfig,
    ) -> Result<Arc<dyn Connection>, ExecError> {
        if Self::is_local(identity) {
            self.local.dial(identity, config).await
        } else {
            self.ssh.dial(identity, config).await
        }
    }
}
