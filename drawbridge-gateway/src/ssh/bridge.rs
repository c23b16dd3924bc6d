//! The per-session bridge: opens the backend-side construct matching the
//! client's request, relays bytes both ways, records the transcript, tracks
//! SCP/SFTP transfers, runs the expiry monitor, and seals the session row.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use drawbridge_task::ChildTask;
use grant_store::{
    AuditAction, AuditEntry, NewSession, NewTransfer, Protocol, SessionEnd, TerminationReason, TransferKind,
};
use russh::ChannelMsg;
use russh::server::Msg;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::CoreState;
use crate::expiry::{self, ExpiryMonitor};
use crate::policy::GrantedAccess;
use crate::recording::{EventKind, SessionRecorder, is_suppressed_keystroke};
use crate::session::SessionInfo;
use crate::ssh::backend::BackendHandler;
use crate::ssh::handler::PtyParams;
use crate::ssh::transfer;

const DRAIN_GRACE: std::time::Duration = std::time::Duration::from_millis(100);

pub(crate) enum SessionRequest {
    Shell,
    Exec(String),
    Subsystem(String),
}

impl SessionRequest {
    fn subsystem_name(&self) -> Option<&str> {
        match self {
            SessionRequest::Subsystem(name) => Some(name),
            _ => None,
        }
    }
}

pub(crate) struct SessionBridge {
    pub state: CoreState,
    pub access: GrantedAccess,
    pub login: String,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub request: SessionRequest,
    pub pty: Option<PtyParams>,
    pub client_channel: russh::Channel<Msg>,
    pub session_handle: russh::server::Handle,
    pub backend_handle: russh::client::Handle<BackendHandler>,
    pub agent_used: bool,
    pub session_row: Arc<OnceLock<i64>>,
}

impl SessionBridge {
    pub(crate) async fn run(self) {
        let session_id = Uuid::new_v4();

        if let Err(error) = self.serve(session_id).await {
            error!(session.id = %session_id, error = format!("{error:#}"), "Session bridge failed");
        }
    }

    #[instrument(skip(self), fields(session.id = %session_id, user = %self.access.user.username))]
    async fn serve(self, session_id: Uuid) -> anyhow::Result<()> {
        let SessionBridge {
            state,
            access,
            login,
            source_ip,
            dest_ip,
            request,
            pty,
            client_channel,
            session_handle,
            backend_handle,
            agent_used,
            session_row,
        } = self;

        let started_at = Utc::now();
        let mut client_channel = client_channel;
        let client_channel_id = client_channel.id();

        // Backend-side construct mirroring the client's request.
        let mut backend_channel = backend_handle.channel_open_session().await?;

        if let Some(pty) = &pty {
            backend_channel
                .request_pty(
                    false,
                    &pty.term,
                    pty.col_width,
                    pty.row_height,
                    pty.pix_width,
                    pty.pix_height,
                    &pty.modes,
                )
                .await?;
        }

        let is_shell = matches!(request, SessionRequest::Shell);
        let scp = match &request {
            SessionRequest::Exec(command) => transfer::classify_exec(command),
            _ => None,
        };
        let is_sftp = request.subsystem_name().is_some_and(transfer::is_sftp_subsystem);

        match &request {
            SessionRequest::Shell => backend_channel.request_shell(false).await?,
            SessionRequest::Exec(command) => backend_channel.exec(false, command.as_bytes()).await?,
            SessionRequest::Subsystem(name) => backend_channel.request_subsystem(false, name).await?,
        }

        // SCP and SFTP are tracked as transfers, not transcribed.
        let mut recorder = if scp.is_none() && !is_sftp {
            match SessionRecorder::create(
                &state.conf_handle.get_conf().recording_path,
                &session_id.to_string(),
                &access.user.username,
                &access.backend.address.to_string(),
                started_at,
            )
            .await
            {
                Ok(mut recorder) => {
                    recorder
                        .record(
                            EventKind::SessionStart,
                            &format!("User {} connecting to {}", access.user.username, access.backend.address),
                            started_at,
                        )
                        .await;
                    Some(recorder)
                }
                Err(error) => {
                    error!(error = format!("{error:#}"), "Couldn't create session transcript");
                    None
                }
            }
        } else {
            None
        };

        let row_id = state
            .sessions_db
            .insert_session(NewSession {
                session_id: session_id.to_string(),
                user_id: access.user.id,
                backend_id: access.backend.id,
                protocol: Protocol::Ssh,
                source_ip,
                proxy_ip: dest_ip,
                backend_ip: access.backend.address,
                backend_port: access.backend.ssh_port,
                ssh_login: Some(login.clone()),
                subsystem: request.subsystem_name().map(str::to_owned),
                agent_used,
                started_at,
                recording_path: recorder.as_ref().map(|recorder| recorder.path().to_string()),
                policy_id: access.policies.first().map(|policy| policy.id),
            })
            .await?;
        let _ = session_row.set(row_id);

        let scp_transfer = match &scp {
            Some((kind, path)) => state
                .sessions_db
                .insert_transfer(NewTransfer {
                    session_id: row_id,
                    kind: *kind,
                    file_path: path.clone(),
                    local_addr: None,
                    local_port: None,
                    remote_addr: None,
                    remote_port: None,
                    started_at,
                })
                .await
                .inspect_err(|error| error!(error = format!("{error:#}"), "Failed to record SCP transfer"))
                .ok(),
            None => None,
        };
        let sftp_transfer = if is_sftp {
            state
                .sessions_db
                .insert_transfer(NewTransfer {
                    session_id: row_id,
                    kind: TransferKind::SftpSession,
                    file_path: None,
                    local_addr: None,
                    local_port: None,
                    remote_addr: None,
                    remote_port: None,
                    started_at,
                })
                .await
                .inspect_err(|error| error!(error = format!("{error:#}"), "Failed to record SFTP transfer"))
                .ok()
        } else {
            None
        };

        // Registry + audit.
        let notify_kill = Arc::new(Notify::new());
        let info = SessionInfo::builder()
            .id(session_id)
            .protocol(Protocol::Ssh)
            .username(access.user.username.clone())
            .source_ip(source_ip)
            .backend_name(access.backend.name.clone())
            .build();
        state.sessions.new_session(info, Arc::clone(&notify_kill)).await?;

        audit_session_event(&state, AuditAction::SessionStarted, &access, source_ip, row_id, &login).await;

        // Expiry monitor for interactive shells with a deadline.
        let expired = Arc::new(AtomicBool::new(false));
        let session_gone = Arc::new(Notify::new());
        let _monitor = match (is_shell, access.effective_end) {
            (true, Some(deadline)) => {
                let welcome = expiry::welcome_message(deadline, Utc::now());
                let _ = session_handle.data(client_channel_id, welcome.into_bytes().into()).await;

                Some(ChildTask::spawn(
                    ExpiryMonitor {
                        deadline,
                        handle: session_handle.clone(),
                        channel: client_channel_id,
                        sessions: state.sessions.clone(),
                        session_id,
                        expired: Arc::clone(&expired),
                        session_gone: Arc::clone(&session_gone),
                    }
                    .run(),
                ))
            }
            _ => None,
        };

        // Relay until either side closes or the session is killed.
        let outcome = relay(
            &mut client_channel,
            &mut backend_channel,
            &session_handle,
            client_channel_id,
            &mut recorder,
            &notify_kill,
        )
        .await;

        // Drain grace, then close both sides.
        tokio::time::sleep(DRAIN_GRACE).await;
        let _ = backend_channel.close().await;
        let _ = client_channel.close().await;

        let killed = matches!(outcome, RelayOutcome::Killed { .. });
        if killed {
            let _ = session_handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "session terminated".to_owned(),
                    String::new(),
                )
                .await;
            let _ = backend_handle
                .disconnect(russh::Disconnect::ByApplication, "session terminated", "")
                .await;
        }

        session_gone.notify_waiters();

        let ended_at = Utc::now();
        let reason = match &outcome {
            RelayOutcome::Closed { errored: true, .. } => TerminationReason::Error,
            RelayOutcome::Killed { .. } if expired.load(Ordering::SeqCst) => TerminationReason::GrantExpired,
            _ => TerminationReason::Normal,
        };

        let recording_size = match recorder {
            Some(mut recorder) => {
                recorder.record(EventKind::SessionEnd, "Connection closed", ended_at).await;
                recorder.finalize(ended_at).await
            }
            None => None,
        };

        let (sent, received) = match outcome {
            RelayOutcome::Closed { sent, received, .. } | RelayOutcome::Killed { sent, received } => (sent, received),
        };

        for transfer_id in [scp_transfer, sftp_transfer].into_iter().flatten() {
            if let Err(error) = state.sessions_db.finish_transfer(transfer_id, sent, received, ended_at).await {
                error!(error = format!("{error:#}"), "Failed to seal transfer row");
            }
        }

        if let Err(error) = state
            .sessions_db
            .close_session(
                row_id,
                SessionEnd {
                    ended_at,
                    reason,
                    recording_size,
                },
            )
            .await
        {
            error!(error = format!("{error:#}"), "Failed to seal session row");
        }

        let _ = state.sessions.remove_session(session_id).await;
        audit_session_event(&state, AuditAction::SessionEnded, &access, source_ip, row_id, &login).await;

        info!(
            reason = reason.as_str(),
            duration = (ended_at - started_at).num_seconds(),
            "Session ended"
        );

        Ok(())
    }
}

enum RelayOutcome {
    Closed { sent: u64, received: u64, errored: bool },
    Killed { sent: u64, received: u64 },
}

async fn relay(
    client: &mut russh::Channel<Msg>,
    backend: &mut russh::Channel<russh::client::Msg>,
    session_handle: &russh::server::Handle,
    client_id: russh::ChannelId,
    recorder: &mut Option<SessionRecorder>,
    notify_kill: &Notify,
) -> RelayOutcome {
    let mut sent: u64 = 0;
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            () = notify_kill.notified() => {
                debug!("Session kill observed by relay");
                return RelayOutcome::Killed { sent, received };
            }
            msg = client.wait() => {
                let Some(msg) = msg else {
                    return RelayOutcome::Closed { sent, received, errored: false };
                };
                match msg {
                    ChannelMsg::Data { data } => {
                        sent += data.len() as u64;
                        if backend.data(&data[..]).await.is_err() {
                            return RelayOutcome::Closed { sent, received, errored: true };
                        }
                        if let Some(recorder) = recorder.as_mut()
                            && !is_suppressed_keystroke(&data)
                        {
                            recorder
                                .record(EventKind::ClientToServer, &String::from_utf8_lossy(&data), Utc::now())
                                .await;
                        }
                    }
                    ChannelMsg::WindowChange { col_width, row_height, pix_width, pix_height } => {
                        let _ = backend.window_change(col_width, row_height, pix_width, pix_height).await;
                    }
                    ChannelMsg::Eof => {
                        let _ = backend.eof().await;
                    }
                    ChannelMsg::Close => {
                        return RelayOutcome::Closed { sent, received, errored: false };
                    }
                    _ => {}
                }
            }
            msg = backend.wait() => {
                let Some(msg) = msg else {
                    return RelayOutcome::Closed { sent, received, errored: false };
                };
                match msg {
                    ChannelMsg::Data { data } => {
                        received += data.len() as u64;
                        if client.data(&data[..]).await.is_err() {
                            return RelayOutcome::Closed { sent, received, errored: true };
                        }
                        if let Some(recorder) = recorder.as_mut() {
                            recorder
                                .record(EventKind::ServerToClient, &String::from_utf8_lossy(&data), Utc::now())
                                .await;
                        }
                    }
                    ChannelMsg::ExtendedData { data, ext } => {
                        let _ = session_handle.extended_data(client_id, ext, data).await;
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        let _ = session_handle.exit_status_request(client_id, exit_status).await;
                    }
                    ChannelMsg::Eof => {
                        let _ = client.eof().await;
                    }
                    ChannelMsg::Close => {
                        return RelayOutcome::Closed { sent, received, errored: false };
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn audit_session_event(
    state: &CoreState,
    action: AuditAction,
    access: &GrantedAccess,
    source_ip: IpAddr,
    row_id: i64,
    login: &str,
) {
    let entry = AuditEntry {
        user_id: Some(access.user.id),
        action,
        resource_type: "session",
        resource_id: Some(row_id),
        source_ip: Some(source_ip),
        success: true,
        details: format!("Backend: {} ({}), Login: {login}", access.backend.name, access.backend.address),
        timestamp: Utc::now(),
    };

    if let Err(error) = state.audit.record(entry).await {
        error!(error = format!("{error:#}"), "Failed to append session audit record");
    }
}
