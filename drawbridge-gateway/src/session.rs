//! In-memory registry of live proxied sessions.
//!
//! The manager is an actor owning the registry; workers talk to it through
//! the typed [`SessionMessageSender`]. Killing a session fires its
//! `Notify`, which the owning connection worker observes to tear both
//! transports down. Database rows stay with the worker that created them.

use core::fmt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drawbridge_task::{ShutdownSignal, Task};
use grant_store::Protocol;
use tap::prelude::*;
use tokio::sync::{Notify, mpsc, oneshot};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionInfo {
    pub id: Uuid,
    pub protocol: Protocol,
    pub username: String,
    pub source_ip: IpAddr,
    pub backend_name: String,
    #[builder(setter(skip), default = Utc::now())]
    pub start_timestamp: DateTime<Utc>,
}

pub type RunningSessions = HashMap<Uuid, SessionInfo>;

#[must_use]
pub enum KillResult {
    Success,
    NotFound,
}

enum SessionManagerMessage {
    New {
        info: SessionInfo,
        notify_kill: Arc<Notify>,
    },
    Remove {
        id: Uuid,
        channel: oneshot::Sender<Option<SessionInfo>>,
    },
    Kill {
        id: Uuid,
        channel: oneshot::Sender<KillResult>,
    },
    GetRunning {
        channel: oneshot::Sender<RunningSessions>,
    },
    GetCount {
        channel: oneshot::Sender<usize>,
    },
}

impl fmt::Debug for SessionManagerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionManagerMessage::New { info, notify_kill: _ } => {
                f.debug_struct("New").field("info", info).finish_non_exhaustive()
            }
            SessionManagerMessage::Remove { id, channel: _ } => {
                f.debug_struct("Remove").field("id", id).finish_non_exhaustive()
            }
            SessionManagerMessage::Kill { id, channel: _ } => {
                f.debug_struct("Kill").field("id", id).finish_non_exhaustive()
            }
            SessionManagerMessage::GetRunning { channel: _ } => f.debug_struct("GetRunning").finish_non_exhaustive(),
            SessionManagerMessage::GetCount { channel: _ } => f.debug_struct("GetCount").finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionMessageSender(mpsc::Sender<SessionManagerMessage>);

impl SessionMessageSender {
    pub async fn new_session(&self, info: SessionInfo, notify_kill: Arc<Notify>) -> anyhow::Result<()> {
        use anyhow::Context as _;

        self.0
            .send(SessionManagerMessage::New { info, notify_kill })
            .await
            .ok()
            .context("couldn't send New message")
    }

    pub async fn remove_session(&self, id: Uuid) -> anyhow::Result<Option<SessionInfo>> {
        use anyhow::Context as _;

        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::Remove { id, channel: tx })
            .await
            .ok()
            .context("couldn't send Remove message")?;
        rx.await.context("couldn't receive info for removed session")
    }

    pub async fn kill_session(&self, id: Uuid) -> anyhow::Result<KillResult> {
        use anyhow::Context as _;

        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::Kill { id, channel: tx })
            .await
            .ok()
            .context("couldn't send Kill message")?;
        rx.await.context("couldn't receive kill result")
    }

    pub async fn get_running_sessions(&self) -> anyhow::Result<RunningSessions> {
        use anyhow::Context as _;

        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::GetRunning { channel: tx })
            .await
            .ok()
            .context("couldn't send GetRunning message")?;
        rx.await.context("couldn't receive running session list")
    }

    pub async fn get_running_session_count(&self) -> anyhow::Result<usize> {
        use anyhow::Context as _;

        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::GetCount { channel: tx })
            .await
            .ok()
            .context("couldn't send GetCount message")?;
        rx.await.context("couldn't receive running session count")
    }
}

pub struct SessionMessageReceiver(mpsc::Receiver<SessionManagerMessage>);

pub fn session_manager_channel() -> (SessionMessageSender, SessionMessageReceiver) {
    mpsc::channel(64).pipe(|(tx, rx)| (SessionMessageSender(tx), SessionMessageReceiver(rx)))
}

pub struct SessionManagerTask {
    rx: SessionMessageReceiver,
    all_running: RunningSessions,
    all_notify_kill: HashMap<Uuid, Arc<Notify>>,
}

impl SessionManagerTask {
    pub fn new(rx: SessionMessageReceiver) -> Self {
        Self {
            rx,
            all_running: HashMap::new(),
            all_notify_kill: HashMap::new(),
        }
    }

    fn handle_new(&mut self, info: SessionInfo, notify_kill: Arc<Notify>) {
        let id = info.id;
        self.all_running.insert(id, info);
        self.all_notify_kill.insert(id, notify_kill);
    }

    fn handle_remove(&mut self, id: Uuid) -> Option<SessionInfo> {
        let _ = self.all_notify_kill.remove(&id);
        self.all_running.remove(&id)
    }

    fn handle_kill(&self, id: Uuid) -> KillResult {
        match self.all_notify_kill.get(&id) {
            Some(notify_kill) => {
                notify_kill.notify_waiters();
                KillResult::Success
            }
            None => KillResult::NotFound,
        }
    }
}

#[async_trait]
impl Task for SessionManagerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session manager";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        session_manager_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn session_manager_task(
    mut manager: SessionManagerTask,
    mut shutdown_signal: ShutdownSignal,
) -> anyhow::Result<()> {
    debug!("Task started");

    loop {
        tokio::select! {
            msg = manager.rx.0.recv() => {
                let Some(msg) = msg else {
                    warn!("All senders are dead");
                    break;
                };

                trace!(?msg, "Received message");

                match msg {
                    SessionManagerMessage::New { info, notify_kill } => {
                        debug!(session.id = %info.id, session.protocol = %info.protocol, "Session registered");
                        manager.handle_new(info, notify_kill);
                    }
                    SessionManagerMessage::Remove { id, channel } => {
                        let removed = manager.handle_remove(id);
                        let _ = channel.send(removed);
                    }
                    SessionManagerMessage::Kill { id, channel } => {
                        let result = manager.handle_kill(id);
                        let _ = channel.send(result);
                    }
                    SessionManagerMessage::GetRunning { channel } => {
                        let _ = channel.send(manager.all_running.clone());
                    }
                    SessionManagerMessage::GetCount { channel } => {
                        let _ = channel.send(manager.all_running.len());
                    }
                }
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    debug!("Task is stopping; kill all running sessions");

    for notify_kill in manager.all_notify_kill.values() {
        notify_kill.notify_waiters();
    }

    debug!("Task terminated");

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use drawbridge_task::ShutdownHandle;

    use super::*;

    fn info() -> SessionInfo {
        SessionInfo::builder()
            .id(Uuid::new_v4())
            .protocol(Protocol::Ssh)
            .username("bob".to_owned())
            .source_ip("203.0.113.5".parse().unwrap())
            .backend_name("b1".to_owned())
            .build()
    }

    #[tokio::test]
    async fn register_kill_and_remove() {
        let (tx, rx) = session_manager_channel();
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let task = drawbridge_task::spawn_task(SessionManagerTask::new(rx), shutdown_signal);

        let info = info();
        let id = info.id;
        let notify = Arc::new(Notify::new());
        let notified = {
            let notify = Arc::clone(&notify);
            tokio::spawn(async move { notify.notified().await })
        };

        tx.new_session(info, notify).await.unwrap();
        assert_eq!(tx.get_running_session_count().await.unwrap(), 1);

        // Let the waiter reach its await point before firing the kill.
        tokio::task::yield_now().await;
        assert!(matches!(tx.kill_session(id).await.unwrap(), KillResult::Success));
        notified.await.unwrap();

        let removed = tx.remove_session(id).await.unwrap();
        assert_eq!(removed.map(|info| info.id), Some(id));
        assert_eq!(tx.get_running_session_count().await.unwrap(), 0);

        assert!(matches!(tx.kill_session(id).await.unwrap(), KillResult::NotFound));

        shutdown_handle.signal();
        task.join().await.unwrap().unwrap();
    }
}
