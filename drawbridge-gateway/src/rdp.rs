//! RDP access-control shim.
//!
//! The RDP protocol itself is the business of the embedded MITM library;
//! this module owns the pre-connect boundary only: resolve the hidden
//! backend from the proxy address the client dialed, consult the policy
//! engine, then either splice the connection through to the backend's RDP
//! port or schedule an asynchronous drop so the library's initialization
//! never observes a torn socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use drawbridge_task::{ChildTask, ShutdownSignal, Task};
use grant_store::{NewSession, Protocol, SessionEnd, TerminationReason};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::CoreState;
use crate::policy::{AccessDecision, audit_decision};
use crate::session::SessionInfo;

pub const RDP_PORT: u16 = 3389;

/// The capability handed to the embedded RDP library: pre-connect backend
/// resolution plus the access decision in one call.
#[derive(Clone)]
pub struct BackendSelector {
    state: CoreState,
}

impl BackendSelector {
    pub fn new(state: CoreState) -> Self {
        Self { state }
    }

    /// Resolves the backend for a connection accepted on `local_addr` and
    /// decides access for `peer_addr`. The decision is audited either way.
    pub async fn resolve(&self, local_addr: SocketAddr, peer_addr: SocketAddr) -> AccessDecision {
        let decision = self
            .state
            .engine
            .check_access(peer_addr.ip(), local_addr.ip(), Protocol::Rdp, None, Utc::now())
            .await;

        audit_decision(
            &self.state.audit,
            peer_addr.ip(),
            local_addr.ip(),
            Protocol::Rdp,
            None,
            &decision,
            Utc::now(),
        )
        .await;

        decision
    }
}

/// One listener per RDP proxy address.
pub struct RdpListener {
    addr: SocketAddr,
    listener: TcpListener,
    selector: BackendSelector,
    state: CoreState,
}

impl RdpListener {
    pub async fn init_and_bind(proxy_ip: IpAddr, state: CoreState) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(proxy_ip, RDP_PORT);

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RDP listener on {addr}"))?;

        info!(%addr, "RDP listener started successfully");

        Ok(Self {
            addr,
            listener,
            selector: BackendSelector::new(state.clone()),
            state,
        })
    }

    #[instrument("rdp-listener", skip(self), fields(addr = %self.addr))]
    async fn accept_loop(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await.context("failed to accept connection") {
                Ok((stream, peer_addr)) => {
                    let selector = self.selector.clone();
                    let state = self.state.clone();

                    ChildTask::spawn(async move {
                        if let Err(error) = handle_rdp_peer(stream, peer_addr, selector, state).await {
                            error!(error = format!("{error:#}"), client = %peer_addr, "RDP peer failure");
                        }
                    })
                    .detach();
                }
                Err(error) => error!(error = format!("{error:#}"), "RDP listener failure"),
            }
        }
    }
}

#[async_trait]
impl Task for RdpListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "rdp listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.accept_loop() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

#[instrument("rdp", skip_all, fields(client = %peer_addr))]
async fn handle_rdp_peer(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    selector: BackendSelector,
    state: CoreState,
) -> anyhow::Result<()> {
    let local_addr = stream.local_addr().context("couldn't read local address")?;

    info!(dest = %local_addr.ip(), "New RDP connection");

    let access = match selector.resolve(local_addr, peer_addr).await {
        AccessDecision::Granted(access) => access,
        AccessDecision::Denied { reason, .. } => {
            warn!(reason = reason.as_str(), "RDP access denied");
            // Asynchronous drop: let the caller finish wiring before the
            // socket goes away.
            tokio::task::yield_now().await;
            return Ok(());
        }
    };

    let backend_addr = SocketAddr::new(access.backend.address, access.backend.rdp_port);
    let mut backend_stream = TcpStream::connect(backend_addr)
        .await
        .with_context(|| format!("couldn't reach RDP backend {backend_addr}"))?;

    let session_id = Uuid::new_v4();
    let started_at = Utc::now();

    let row_id = state
        .sessions_db
        .insert_session(NewSession {
            session_id: session_id.to_string(),
            user_id: access.user.id,
            backend_id: access.backend.id,
            protocol: Protocol::Rdp,
            source_ip: peer_addr.ip(),
            proxy_ip: local_addr.ip(),
            backend_ip: access.backend.address,
            backend_port: access.backend.rdp_port,
            ssh_login: None,
            subsystem: None,
            agent_used: false,
            started_at,
            recording_path: None,
            policy_id: access.policies.first().map(|policy| policy.id),
        })
        .await?;

    let notify_kill = Arc::new(Notify::new());
    let info = SessionInfo::builder()
        .id(session_id)
        .protocol(Protocol::Rdp)
        .username(access.user.username.clone())
        .source_ip(peer_addr.ip())
        .backend_name(access.backend.name.clone())
        .build();
    state.sessions.new_session(info, Arc::clone(&notify_kill)).await?;

    let result = tokio::select! {
        result = tokio::io::copy_bidirectional(&mut stream, &mut backend_stream) => result.map(|_| ()),
        () = notify_kill.notified() => Ok(()),
    };

    let reason = if result.is_ok() {
        TerminationReason::Normal
    } else {
        TerminationReason::Error
    };

    state
        .sessions_db
        .close_session(
            row_id,
            SessionEnd {
                ended_at: Utc::now(),
                reason,
                recording_size: None,
            },
        )
        .await?;
    let _ = state.sessions.remove_session(session_id).await;

    info!(reason = reason.as_str(), "RDP session ended");

    result.context("RDP splice failed")
}
