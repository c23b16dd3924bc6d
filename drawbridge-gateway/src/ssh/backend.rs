//! The proxy's client leg: an SSH transport to the resolved backend.
//!
//! Credentials are relayed, never inspected. Password auth forwards the
//! client's password verbatim; public-key auth signs through the client's
//! forwarded agent, trying keys in the agent's natural order.

use std::net::IpAddr;

use anyhow::Context as _;
use russh::client;
use russh::keys::PublicKey;
use russh::keys::agent::client::AgentClient;
use thiserror::Error;

use crate::ssh::forward;

/// Outcome of relaying the client's credentials to the backend. Each variant
/// maps to the one-line hints written on the client channel before closing.
#[derive(Debug, Error)]
pub enum BackendAuthError {
    #[error("password rejected by backend")]
    PasswordRejected,
    #[error("public key auth requires agent forwarding")]
    AgentNotForwarded,
    #[error("no agent key accepted by backend")]
    NoAgentKeyAccepted,
    #[error("agent failure: {0}")]
    Agent(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl BackendAuthError {
    /// Human hint lines written in-band on the opened channel.
    pub fn hint_lines(&self, login: &str, proxy_ip: IpAddr) -> Vec<String> {
        match self {
            BackendAuthError::PasswordRejected => {
                vec!["ERROR: Password failed on backend.\r\n".to_owned()]
            }
            BackendAuthError::AgentNotForwarded => vec![
                "ERROR: Public key authentication requires agent forwarding.\r\n".to_owned(),
                format!("Try: ssh -A {login}@{proxy_ip}\r\n"),
                format!("Or:  ssh -o PubkeyAuthentication=no {login}@{proxy_ip}\r\n"),
            ],
            BackendAuthError::NoAgentKeyAccepted => vec![
                "ERROR: None of your SSH keys are authorized on the backend server.\r\n".to_owned(),
                format!("Try: ssh -o PubkeyAuthentication=no {login}@{proxy_ip}\r\n"),
            ],
            BackendAuthError::Agent(error) => vec![
                format!("ERROR: Agent forwarding failed: {error}\r\n"),
                format!("Try: ssh -o PubkeyAuthentication=no {login}@{proxy_ip}\r\n"),
            ],
            BackendAuthError::Transport(_) => {
                vec!["ERROR: Backend authentication error\r\n".to_owned()]
            }
        }
    }
}

/// Client-side handler for the backend transport.
///
/// Forwarded-tcpip channels pushed by the backend (the return leg of a
/// cascaded -R) are connected back to the proxy address, where the
/// per-session listener relays them on to the client.
pub struct BackendHandler {
    /// The proxy address this session was dialed on.
    pub proxy_ip: IpAddr,
}

impl client::Handler for BackendHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // No host-key pinning on the backend leg.
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let proxy_ip = self.proxy_ip;
        let port = u16::try_from(connected_port).context("forwarded port out of range")?;

        debug!(
            %proxy_ip,
            port,
            origin = %format!("{originator_address}:{originator_port}"),
            "Backend pushed a forwarded-tcpip channel; relaying to the proxy listener"
        );

        tokio::spawn(async move {
            match tokio::net::TcpStream::connect((proxy_ip, port)).await {
                Ok(tcp) => {
                    let (sent, received) = forward::splice_channel_tcp(channel, tcp).await;
                    debug!(port, sent, received, "Cascaded forward relay finished");
                }
                Err(error) => {
                    warn!(%error, %proxy_ip, port, "Couldn't reach the proxy listener for a cascaded forward");
                }
            }
        });

        Ok(())
    }
}

pub struct BackendConnection {
    pub handle: client::Handle<BackendHandler>,
    pub agent_used: bool,
}

/// Dials the backend over TCP and completes the SSH handshake.
pub async fn connect(address: IpAddr, port: u16, proxy_ip: IpAddr) -> anyhow::Result<client::Handle<BackendHandler>> {
    let config = std::sync::Arc::new(client::Config::default());

    client::connect(config, (address, port), BackendHandler { proxy_ip })
        .await
        .with_context(|| format!("couldn't reach backend {address}:{port}"))
}

/// Relays the client's password to the backend, as-is.
pub async fn authenticate_password(
    handle: &mut client::Handle<BackendHandler>,
    login: &str,
    password: &str,
) -> Result<(), BackendAuthError> {
    let outcome = handle
        .authenticate_password(login, password)
        .await
        .context("backend password auth transport failure")?;

    if matches!(outcome, client::AuthResult::Success) {
        Ok(())
    } else {
        Err(BackendAuthError::PasswordRejected)
    }
}

/// Enumerates keys from the client's forwarded agent and tries each against
/// the backend; the first accepted key wins.
pub async fn authenticate_via_agent<S>(
    handle: &mut client::Handle<BackendHandler>,
    login: &str,
    agent_stream: S,
) -> Result<(), BackendAuthError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let mut agent = AgentClient::connect(agent_stream);

    let keys = agent
        .request_identities()
        .await
        .map_err(|error| BackendAuthError::Agent(error.to_string()))?;

    info!(key_count = keys.len(), "Enumerated keys from the forwarded agent");

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .context("couldn't query backend RSA hash support")?
        .flatten();

    for key in keys {
        let fingerprint = key.fingerprint(Default::default());
        match handle.authenticate_publickey_with(login, key, hash_alg, &mut agent).await {
            Ok(client::AuthResult::Success) => {
                info!(%fingerprint, "Backend accepted an agent key");
                return Ok(());
            }
            Ok(_) => {
                trace!(%fingerprint, "Backend rejected an agent key");
            }
            Err(error) => {
                trace!(%fingerprint, %error, "Agent key attempt failed");
            }
        }
    }

    Err(BackendAuthError::NoAgentKeyAccepted)
}
