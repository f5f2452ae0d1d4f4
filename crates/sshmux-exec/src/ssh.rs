//! SSH transport using russh crate

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key, ssh_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::DialConfig;
use crate::error::ExecError;
use crate::identity::CredentialIdentity;
use crate::result::{CommandOutput, ExitStatus};
use crate::traits::{Channel, Connection, Dialer, FeedError, Stdin, copy_stdin};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Hosts are typically freshly provisioned machines whose keys are
        // not known in advance (StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Dials hosts over SSH with public-key authentication
#[derive(Clone)]
pub struct SshDialer {
    client_config: Arc<client::Config>,
}

impl std::fmt::Debug for SshDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshDialer").finish_non_exhaustive()
    }
}

impl Default for SshDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl SshDialer {
    /// Create a dialer with russh's default client configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_client_config(client::Config::default())
    }

    /// Create a dialer with a custom russh client configuration
    #[must_use]
    pub fn with_client_config(config: client::Config) -> Self {
        Self {
            client_config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    #[instrument(skip(self, identity, config), fields(host = %identity))]
    async fn dial(
        &self,
        identity: &CredentialIdentity,
        config: &DialConfig,
    ) -> Result<Arc<dyn Connection>, ExecError> {
        let key_pair = decode_secret_key(identity.private_key(), None)
            .map_err(|e| ExecError::InvalidKey(e.to_string()))?;

        wait_until_reachable(identity.host(), identity.port(), config).await?;

        info!(
            host = %identity.host(),
            port = identity.port(),
            user = %identity.user(),
            "connecting to SSH"
        );

        let connect = client::connect(
            Arc::clone(&self.client_config),
            (identity.host(), identity.port()),
            SshClientHandler,
        );
        let mut session = timeout(config.probe_timeout, connect)
            .await
            .map_err(|_| {
                ExecError::ConnectionFailed(format!(
                    "SSH handshake timed out after {:?}",
                    config.probe_timeout
                ))
            })?
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                identity.user(),
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "Public key authentication failed".to_string(),
            ));
        }

        info!(host = %identity.host(), "SSH connected and authenticated");

        Ok(Arc::new(SshConnection {
            session: Mutex::new(session),
            label: identity.to_string(),
        }))
    }
}

/// Probe `host:port` with plain TCP until it accepts or the deadline passes
///
/// Each probe is bounded by `probe_timeout`; failed probes are retried every
/// `retry_interval`. Never returns `ConnectTimeout` before `deadline` has
/// elapsed.
pub(crate) async fn wait_until_reachable(
    host: &str,
    port: u16,
    config: &DialConfig,
) -> Result<(), ExecError> {
    let deadline = Instant::now() + config.deadline;
    let mut attempt = 0u32;
    let mut last_error = String::from("no probe attempted");

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(host, port, attempt, "host did not become reachable");
            return Err(ExecError::ConnectTimeout {
                addr: format!("{host}:{port}"),
                deadline: config.deadline,
                last_error,
            });
        }

        attempt += 1;
        let probe_timeout = config.probe_timeout.min(remaining);
        match timeout(probe_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                debug!(host, port, attempt, "host reachable");
                return Ok(());
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("probe timed out after {probe_timeout:?}"),
        }
        debug!(host, port, attempt, error = %last_error, "probe failed");

        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(config.retry_interval.min(remaining)).await;
    }
}

/// Established SSH connection
struct SshConnection {
    session: Mutex<client::Handle<SshClientHandler>>,
    label: String,
}

#[async_trait]
impl Connection for SshConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, ExecError> {
        let session = self.session.lock().await;
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::ChannelFailed(e.to_string()))?;
        Ok(Box::new(SshChannel { channel }))
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        let session = self.session.lock().await;
        session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        info!(conn = %self.label, "SSH disconnected");
        Ok(())
    }
}

/// One SSH session channel
struct SshChannel {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl Channel for SshChannel {
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<Stdin>,
    ) -> Result<CommandOutput, ExecError> {
        let start = std::time::Instant::now();

        self.channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::ChannelFailed(e.to_string()))?;

        let mut output = CommandOutput::default();

        match stdin {
            Some(mut input) => {
                // Feed input while collecting output so neither side stalls
                // on a full window
                let mut writer = Box::pin(self.channel.make_writer());
                let feed = async move {
                    let bytes = copy_stdin(&mut input, &mut writer).await?;
                    // shutdown sends EOF; skipped above when the input failed
                    writer.shutdown().await.map_err(FeedError::Write)?;
                    Ok::<_, FeedError>(bytes)
                };

                let collected = collect(&mut self.channel, &mut output);
                tokio::pin!(collected);

                tokio::select! {
                    fed = feed => {
                        match fed {
                            Ok(bytes) => debug!(bytes, "stdin delivered"),
                            Err(FeedError::Read(e)) => {
                                // no EOF was sent; the session closes the channel
                                warn!(error = %e, "failed to read stdin, abandoning command");
                                return Err(ExecError::IoError(format!(
                                    "failed to read stdin: {e}"
                                )));
                            }
                            Err(FeedError::Write(e)) => {
                                debug!(error = %e, "stdin not fully delivered");
                            }
                        }
                        collected.await;
                    }
                    () = &mut collected => {}
                }
            }
            None => {
                self.channel
                    .eof()
                    .await
                    .map_err(|e| ExecError::ChannelFailed(e.to_string()))?;
                collect(&mut self.channel, &mut output).await;
            }
        }

        output.duration = start.elapsed();
        Ok(output)
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.channel
            .close()
            .await
            .map_err(|e| ExecError::ChannelFailed(e.to_string()))
    }
}

/// Read channel messages until the remote side is done
async fn collect(channel: &mut russh::Channel<client::Msg>, output: &mut CommandOutput) {
    let mut got_eof = false;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => output.stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => {
                output.exit = Some(ExitStatus::Code(exit_status));
                if got_eof {
                    break;
                }
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                output.exit = Some(ExitStatus::Signal(format!("{signal_name:?}")));
                if got_eof {
                    break;
                }
            }
            ChannelMsg::Eof => {
                got_eof = true;
                if output.exit.is_some() {
                    break;
                }
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
}
