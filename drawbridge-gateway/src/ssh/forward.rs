//! Port-forward relays: -L/-D channel pairs, and the cascaded -R path where
//! a plain TCP listener on the session's proxy address feeds
//! `forwarded-tcpip` channels back to the client.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use grant_store::{DynSessionStore, NewTransfer, TransferKind};
use tokio::net::{TcpListener, TcpStream};

/// Splices an SSH channel with a TCP socket until either side closes.
/// Returns `(bytes to the channel, bytes to the socket)`.
pub(crate) async fn splice_channel_tcp<M>(channel: russh::Channel<M>, mut tcp: TcpStream) -> (u64, u64)
where
    M: From<(russh::ChannelId, russh::ChannelMsg)> + Send + Sync + 'static,
{
    let mut stream = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut tcp, &mut stream).await {
        Ok(counters) => counters,
        Err(error) => {
            debug!(%error, "Channel/TCP splice ended with an error");
            (0, 0)
        }
    }
}

/// Splices two SSH channels (the -L / -D data path). Returns
/// `(client→backend, backend→client)` byte counts.
pub(crate) async fn splice_channels<A, B>(client: russh::Channel<A>, backend: russh::Channel<B>) -> (u64, u64)
where
    A: From<(russh::ChannelId, russh::ChannelMsg)> + Send + Sync + 'static,
    B: From<(russh::ChannelId, russh::ChannelMsg)> + Send + Sync + 'static,
{
    let mut client_stream = client.into_stream();
    let mut backend_stream = backend.into_stream();
    match tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream).await {
        Ok(counters) => counters,
        Err(error) => {
            debug!(%error, "Channel splice ended with an error");
            (0, 0)
        }
    }
}

/// Books a transfer row (when the session row already exists), runs the
/// relay, and seals the row with the observed byte counts.
pub(crate) async fn run_accounted_relay<F>(
    session_store: DynSessionStore,
    session_row: Arc<OnceLock<i64>>,
    kind: TransferKind,
    local: Option<(String, u16)>,
    remote: Option<(String, u16)>,
    relay: F,
) where
    F: Future<Output = (u64, u64)> + Send,
{
    let transfer_id = match session_row.get() {
        Some(&row_id) => {
            let row = NewTransfer {
                session_id: row_id,
                kind,
                file_path: None,
                local_addr: local.as_ref().map(|(addr, _)| addr.clone()),
                local_port: local.as_ref().map(|&(_, port)| port),
                remote_addr: remote.as_ref().map(|(addr, _)| addr.clone()),
                remote_port: remote.as_ref().map(|&(_, port)| port),
                started_at: Utc::now(),
            };
            match session_store.insert_transfer(row).await {
                Ok(id) => Some(id),
                Err(error) => {
                    error!(error = format!("{error:#}"), "Failed to record transfer start");
                    None
                }
            }
        }
        None => None,
    };

    let (sent, received) = relay.await;

    if let Some(id) = transfer_id
        && let Err(error) = session_store.finish_transfer(id, sent, received, Utc::now()).await
    {
        error!(error = format!("{error:#}"), "Failed to record transfer end");
    }
}

/// The proxy-address listener behind a `tcpip-forward` (-R) request.
///
/// Each backend has a dedicated proxy IP on the jump host NIC, so the bind
/// cannot collide across sessions to different backends. Every accepted
/// connection becomes a `forwarded-tcpip` channel to the client with
/// destination `(localhost, port)`; the protocol does not carry the real
/// destination, symmetric port numbering is assumed.
pub(crate) struct RemoteForwardListener {
    pub proxy_ip: IpAddr,
    pub port: u16,
    pub session_handle: russh::server::Handle,
    pub session_store: DynSessionStore,
    pub session_row: Arc<OnceLock<i64>>,
}

impl RemoteForwardListener {
    pub(crate) async fn run(self) {
        let listener = match TcpListener::bind((self.proxy_ip, self.port)).await {
            Ok(listener) => listener,
            Err(error) => {
                warn!(%error, proxy_ip = %self.proxy_ip, port = self.port, "Couldn't bind remote-forward listener");
                return;
            }
        };

        info!(proxy_ip = %self.proxy_ip, port = self.port, "Remote-forward listener up");

        loop {
            let (tcp, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, port = self.port, "Remote-forward accept failed");
                    break;
                }
            };

            debug!(%peer, port = self.port, "Inbound connection on the proxy address");

            let channel = match self
                .session_handle
                .channel_open_forwarded_tcpip(
                    "localhost",
                    u32::from(self.port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => channel,
                Err(error) => {
                    // The client is gone; stop listening.
                    debug!(%error, port = self.port, "Couldn't open forwarded-tcpip channel to client");
                    break;
                }
            };

            let session_store = Arc::clone(&self.session_store);
            let session_row = Arc::clone(&self.session_row);
            let (proxy_ip, port) = (self.proxy_ip, self.port);
            let peer_addr = peer.ip().to_string();
            let peer_port = peer.port();

            tokio::spawn(async move {
                run_accounted_relay(
                    session_store,
                    session_row,
                    TransferKind::PortForwardRemote,
                    Some((proxy_ip.to_string(), port)),
                    Some((peer_addr, peer_port)),
                    splice_channel_tcp(channel, tcp),
                )
                .await;
            });
        }

        debug!(port = self.port, "Remote-forward listener exiting");
    }
}
