//! russh server handler for one client connection.
//!
//! The access decision is taken during `none` authentication, before any
//! password or key is offered: a source IP without a possible grant only
//! ever sees `publickey` as an allowed method (a dead end) plus a denial
//! banner, so no password prompt appears. Credentials offered after a grant
//! are stored for relay to the backend, never verified here.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use chrono::Utc;
use drawbridge_task::ChildTask;
use grant_store::Protocol;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};

use crate::CoreState;
use crate::policy::{AccessDecision, GrantedAccess, audit_decision};
use crate::ssh::backend::{self, BackendAuthError, BackendConnection};
use crate::ssh::bridge::{SessionBridge, SessionRequest};
use crate::ssh::forward::{self, RemoteForwardListener};

/// Client credential held for relay to the backend.
pub(crate) enum Credential {
    Password(String),
    PublicKey,
}

pub(crate) struct PtyParams {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Pty, u32)>,
}

pub(crate) struct ClientHandler {
    state: CoreState,
    source_ip: IpAddr,
    dest_ip: IpAddr,

    no_grant_reason: Option<String>,
    access: Option<GrantedAccess>,
    login: Option<String>,
    credential: Option<Credential>,
    agent_requested: bool,

    session_channel: Option<Channel<Msg>>,
    pty: Option<PtyParams>,
    bridge_started: bool,

    backend: Option<BackendConnection>,

    /// Row id of the session record, filled once the bridge creates it;
    /// port-forward accounting reads it.
    session_row: Arc<OnceLock<i64>>,
    /// Set on the first channel open; the post-auth timeout checks it.
    channel_opened: Arc<AtomicBool>,
    /// Listener/watchdog tasks tied to the lifetime of this connection.
    tasks: Vec<ChildTask<()>>,
}

impl ClientHandler {
    pub(crate) fn new(
        state: CoreState,
        source_ip: IpAddr,
        dest_ip: IpAddr,
        provisional_denial: Option<String>,
    ) -> Self {
        Self {
            state,
            source_ip,
            dest_ip,
            no_grant_reason: provisional_denial,
            access: None,
            login: None,
            credential: None,
            agent_requested: false,
            session_channel: None,
            pty: None,
            bridge_started: false,
            backend: None,
            session_row: Arc::new(OnceLock::new()),
            channel_opened: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    /// Framed refusal shown before the auth failure.
    fn denial_banner(&self, reason: &str) -> String {
        format!(
            "\r\n\
             +====================================================================+\r\n\
             |                          ACCESS DENIED                             |\r\n\
             +====================================================================+\r\n\
             \r\n\
             \x20 There is no active access grant for your IP address:\r\n\
             \x20   {}\r\n\
             \r\n\
             \x20 Reason: {reason}\r\n\
             \r\n\
             \x20 Please contact your administrator to request access.\r\n\
             \r\n",
            self.source_ip,
        )
    }

    async fn check_real_auth(&mut self, login: &str) -> Auth {
        let decision = self
            .state
            .engine
            .check_access(self.source_ip, self.dest_ip, Protocol::Ssh, Some(login), Utc::now())
            .await;

        audit_decision(
            &self.state.audit,
            self.source_ip,
            self.dest_ip,
            Protocol::Ssh,
            Some(login),
            &decision,
            Utc::now(),
        )
        .await;

        match decision {
            AccessDecision::Granted(access) => {
                self.access = Some(*access);
                self.login = Some(login.to_owned());
                Auth::Accept
            }
            AccessDecision::Denied { reason, .. } => {
                warn!(login, reason = reason.as_str(), "Access denied at auth");
                self.no_grant_reason = Some(reason.human_message(self.source_ip, Some(login)));
                Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                }
            }
        }
    }

    async fn ensure_backend(&mut self, session_handle: &russh::server::Handle) -> Result<(), BackendAuthError> {
        if self.backend.is_some() {
            return Ok(());
        }

        let access = self
            .access
            .as_ref()
            .context("backend dial without a granted access")?;
        let login = self.login.clone().context("backend dial without a login")?;

        info!(
            backend.address = %access.backend.address,
            backend.port = access.backend.ssh_port,
            "Connecting to backend"
        );

        let mut handle = backend::connect(access.backend.address, access.backend.ssh_port, self.dest_ip).await?;

        let agent_used = match self.credential.as_ref().context("backend dial without a credential")? {
            Credential::Password(password) => {
                backend::authenticate_password(&mut handle, &login, password).await?;
                false
            }
            Credential::PublicKey => {
                if !self.agent_requested {
                    return Err(BackendAuthError::AgentNotForwarded);
                }

                let agent_channel = session_handle
                    .channel_open_agent()
                    .await
                    .map_err(|error| BackendAuthError::Agent(error.to_string()))?;

                backend::authenticate_via_agent(&mut handle, &login, agent_channel.into_stream()).await?;
                true
            }
        };

        info!(agent_used, "Backend authentication succeeded");
        self.backend = Some(BackendConnection { handle, agent_used });
        Ok(())
    }

    /// Writes the in-band error hints on a channel and closes it.
    async fn refuse_channel(&self, session: &mut Session, channel: ChannelId, error: &BackendAuthError) {
        let handle = session.handle();
        let login = self.login.as_deref().unwrap_or_default();

        for line in error.hint_lines(login, self.dest_ip) {
            if handle.data(channel, line.into_bytes().into()).await.is_err() {
                break;
            }
        }
        let _ = handle.close(channel).await;
    }

    async fn start_bridge(&mut self, session: &mut Session, channel: ChannelId, request: SessionRequest) {
        if self.bridge_started {
            warn!("Second session request on one connection; ignoring");
            return;
        }

        let Some(client_channel) = self.session_channel.take() else {
            warn!("Session request without an open session channel");
            return;
        };

        if client_channel.id() != channel {
            warn!(
                expected = %client_channel.id(),
                got = %channel,
                "Session request targets an unexpected channel"
            );
        }

        if let Err(error) = self.ensure_backend(&session.handle()).await {
            warn!(error = %error, "Backend unavailable for session request");
            self.refuse_channel(session, channel, &error).await;
            return;
        }

        let Some(access) = self.access.clone() else {
            return;
        };
        let Some(backend) = self.backend.as_ref() else {
            return;
        };

        let bridge = SessionBridge {
            state: self.state.clone(),
            access,
            login: self.login.clone().unwrap_or_default(),
            source_ip: self.source_ip,
            dest_ip: self.dest_ip,
            request,
            pty: self.pty.take(),
            client_channel,
            session_handle: session.handle(),
            backend_handle: backend.handle.clone(),
            agent_used: backend.agent_used,
            session_row: Arc::clone(&self.session_row),
        };

        self.bridge_started = true;

        // Detached on purpose: the bridge must observe channel closure and
        // seal the session row even when this handler is dropped abruptly.
        tokio::spawn(bridge.run());
    }

    async fn port_forwarding_allowed(&self) -> bool {
        self.state
            .engine
            .port_forwarding_allowed(self.source_ip, self.dest_ip, Protocol::Ssh, Utc::now())
            .await
    }
}

impl Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        // Decide before any credential is offered. Login is left empty so
        // the whitelist filter is skipped; the full check runs again with
        // the real login on the first actual auth attempt.
        let decision = self
            .state
            .engine
            .check_access(self.source_ip, self.dest_ip, Protocol::Ssh, None, Utc::now())
            .await;

        match decision {
            AccessDecision::Granted(_) => {
                trace!(user, "Provisional grant exists; advertising password and publickey");
                self.no_grant_reason = None;
                Ok(Auth::Reject {
                    proceed_with_methods: Some(MethodSet::from(
                        &[MethodKind::PublicKey, MethodKind::Password][..],
                    )),
                    partial_success: false,
                })
            }
            AccessDecision::Denied { reason, .. } => {
                warn!(user, reason = reason.as_str(), "No grant for this source; hiding password auth");
                self.no_grant_reason = Some(reason.human_message(self.source_ip, None));

                audit_decision(
                    &self.state.audit,
                    self.source_ip,
                    self.dest_ip,
                    Protocol::Ssh,
                    None,
                    &decision,
                    Utc::now(),
                )
                .await;

                // Publickey-only is an intentional dead end: the client
                // sees the banner, never a password prompt.
                Ok(Auth::Reject {
                    proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
                    partial_success: false,
                })
            }
        }
    }

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(self.no_grant_reason.as_deref().map(|reason| self.denial_banner(reason)))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!(user, "Password auth attempt");

        let auth = self.check_real_auth(user).await;
        if matches!(auth, Auth::Accept) {
            // Not inspected; relayed to the backend on first channel.
            self.credential = Some(Credential::Password(password.to_owned()));
        }
        Ok(auth)
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        trace!(user, "Public key offered");

        // The key is never verified here; acceptance is provisional and the
        // backend decides through the forwarded agent.
        if self.no_grant_reason.is_some() {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, key: &russh::keys::PublicKey) -> Result<Auth, Self::Error> {
        debug!(user, algorithm = %key.algorithm(), "Public key auth attempt");

        let auth = self.check_real_auth(user).await;
        if matches!(auth, Auth::Accept) {
            self.credential = Some(Credential::PublicKey);
        }
        Ok(auth)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let opened = Arc::clone(&self.channel_opened);
        let handle = session.handle();
        let timeout = self.state.conf_handle.get_conf().channel_open_timeout;

        self.tasks.push(ChildTask::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !opened.load(Ordering::SeqCst) {
                warn!("No channel opened after auth; disconnecting");
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "no channel opened".to_owned(), String::new())
                    .await;
            }
        }));

        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channel_opened.store(true, Ordering::SeqCst);

        if self.session_channel.is_some() || self.bridge_started {
            debug!("Additional session channel refused");
            return Ok(false);
        }

        debug!(channel = %channel.id(), "Session channel opened");
        self.session_channel = Some(channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channel_opened.store(true, Ordering::SeqCst);

        info!(
            destination = %format!("{host_to_connect}:{port_to_connect}"),
            origin = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip channel requested"
        );

        if !self.port_forwarding_allowed().await {
            warn!("Port forwarding administratively prohibited");
            return Ok(false);
        }

        if let Err(error) = self.ensure_backend(&session.handle()).await {
            warn!(error = %error, "Backend unavailable for direct-tcpip");
            return Ok(false);
        }
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };

        let backend_channel = match backend
            .handle
            .channel_open_direct_tcpip(host_to_connect, port_to_connect, originator_address, originator_port)
            .await
        {
            Ok(backend_channel) => backend_channel,
            Err(error) => {
                warn!(%error, "Backend refused direct-tcpip");
                return Ok(false);
            }
        };

        let session_store = Arc::clone(&self.state.sessions_db);
        let session_row = Arc::clone(&self.session_row);
        let port = u16::try_from(port_to_connect).unwrap_or_default();
        let local = Some((originator_address.to_owned(), u16::try_from(originator_port).unwrap_or_default()));
        let remote = Some((host_to_connect.to_owned(), port));

        tokio::spawn(async move {
            forward::run_accounted_relay(
                session_store,
                session_row,
                grant_store::TransferKind::PortForwardLocal,
                local,
                remote,
                forward::splice_channels(channel, backend_channel),
            )
            .await;
        });

        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // The wire request carries only the bind side; the destination is
        // assumed to be (localhost, same port) on the client.
        info!(bind = %format!("{address}:{port}"), "tcpip-forward (-R) requested");

        if !self.port_forwarding_allowed().await {
            warn!("Remote port forwarding administratively prohibited");
            return Ok(false);
        }

        if let Err(error) = self.ensure_backend(&session.handle()).await {
            warn!(error = %error, "Backend unavailable for tcpip-forward");
            return Ok(false);
        }
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };

        let bind_port = u16::try_from(*port).context("forward port out of range")?;

        // Cascade: ask the backend to open the same forward, so inbound
        // connections on the backend tunnel back here.
        match backend.handle.tcpip_forward(address, *port).await {
            Ok(_) => {
                debug!(port = bind_port, "Cascaded tcpip-forward established on backend");
            }
            Err(error) => {
                warn!(%error, port = bind_port, "Backend refused tcpip-forward");
                return Ok(false);
            }
        }

        let listener = RemoteForwardListener {
            proxy_ip: self.dest_ip,
            port: bind_port,
            session_handle: session.handle(),
            session_store: Arc::clone(&self.state.sessions_db),
            session_row: Arc::clone(&self.session_row),
        };
        self.tasks.push(ChildTask::spawn(listener.run()));

        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(bind = %format!("{address}:{port}"), "cancel-tcpip-forward");
        Ok(true)
    }

    async fn agent_request(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!("Client requested agent forwarding");
        self.agent_requested = true;
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(term, col_width, row_height, "PTY requested");
        self.pty = Some(PtyParams {
            term: term.to_owned(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        debug!("Shell requested");
        session.channel_success(channel)?;
        self.start_bridge(session, channel, SessionRequest::Shell).await;
        Ok(())
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        info!(command = %command, "Exec requested");
        session.channel_success(channel)?;
        self.start_bridge(session, channel, SessionRequest::Exec(command)).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(subsystem = name, "Subsystem requested");
        session.channel_success(channel)?;
        self.start_bridge(session, channel, SessionRequest::Subsystem(name.to_owned()))
            .await;
        Ok(())
    }
}
