//! SSH proxy data plane.
//!
//! Terminates the client transport, decides access before any password
//! prompt, opens a second transport to the resolved backend, splices the two
//! together and records the session.

mod backend;
mod bridge;
mod handler;
mod forward;
pub mod transfer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use grant_store::Protocol;
use russh::server::Config;
use tokio::net::TcpStream;

use crate::CoreState;
use crate::policy::AccessDecision;
use crate::ssh::handler::ClientHandler;

/// Server configuration shared by every connection.
pub fn server_config(host_key: russh::keys::PrivateKey) -> Arc<Config> {
    Arc::new(Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![host_key],
        ..Default::default()
    })
}

/// Serves one accepted TCP connection until the SSH session ends.
///
/// The local address of the accepted socket is the proxy address the client
/// dialed; it identifies the hidden backend.
pub async fn serve_connection(state: CoreState, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, "set_nodelay failed");
    }

    let local_addr = stream.local_addr().context("couldn't read local address")?;
    let source_ip = peer_addr.ip();
    let dest_ip = local_addr.ip();

    info!(%source_ip, %dest_ip, "New SSH connection");

    // Early grant probe, before the handshake: the denial banner must be
    // ready whenever the transport asks for it, and a source IP without any
    // possible grant never gets to see a password prompt.
    let provisional_denial = match state
        .engine
        .check_access(source_ip, dest_ip, Protocol::Ssh, None, Utc::now())
        .await
    {
        AccessDecision::Granted(_) => None,
        AccessDecision::Denied { reason, .. } => {
            warn!(%source_ip, reason = reason.as_str(), "No grant for this source");
            Some(reason.human_message(source_ip, None))
        }
    };

    let handler = ClientHandler::new(state.clone(), source_ip, dest_ip, provisional_denial);
    let session = russh::server::run_stream(Arc::clone(&state.ssh_config), stream, handler)
        .await
        .context("SSH handshake failed")?;

    session.await.context("SSH session ended with an error")?;

    debug!(%source_ip, "SSH connection closed");
    Ok(())
}
