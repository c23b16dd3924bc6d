//! The SSH accept loop: one independent worker per connection.

use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use drawbridge_task::{ChildTask, ShutdownSignal, Task};
use tokio::net::{TcpListener, TcpSocket};

use crate::CoreState;

pub struct SshListener {
    addr: SocketAddr,
    listener: TcpListener,
    state: CoreState,
}

impl SshListener {
    pub fn init_and_bind(addr: SocketAddr, state: CoreState) -> anyhow::Result<Self> {
        info!(%addr, "Initiating SSH listener…");

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.set_reuseaddr(true).context("failed to set SO_REUSEADDR")?;
        socket.bind(addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        info!(%addr, "SSH listener started successfully");

        Ok(Self { addr, listener, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(port = self.addr.port()))]
    async fn accept_loop(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await.context("failed to accept connection") {
                Ok((stream, peer_addr)) => {
                    let state = self.state.clone();

                    ChildTask::spawn(async move {
                        if let Err(error) = crate::ssh::serve_connection(state, stream, peer_addr).await {
                            error!(error = format!("{error:#}"), client = %peer_addr, "Peer failure");
                        }
                    })
                    .detach();
                }
                Err(error) => error!(error = format!("{error:#}"), "Listener failure"),
            }
        }
    }
}

#[async_trait]
impl Task for SshListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "ssh listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.accept_loop() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}
