//! Service assembly: storage, policy engine, session manager, listeners.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use drawbridge_gateway::config::ConfHandle;
use drawbridge_gateway::listener::SshListener;
use drawbridge_gateway::policy::PolicyEngine;
use drawbridge_gateway::rdp::RdpListener;
use drawbridge_gateway::session::{SessionManagerTask, session_manager_channel};
use drawbridge_gateway::{CoreState, keys, ssh};
use drawbridge_log::LoggerGuard;
use drawbridge_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use grant_store::{GrantStore as _, SessionStore as _};
use grant_store_libsql::LibSqlGrantStore;
use tokio::runtime::{self, Runtime};

enum GatewayState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct GatewayService {
    conf_handle: ConfHandle,
    state: GatewayState,
    _logger_guard: LoggerGuard,
}

impl GatewayService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard = drawbridge_log::init(&conf.log_file, &conf.log_directive).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"), hostname = %conf.hostname);

        Ok(GatewayService {
            conf_handle,
            state: GatewayState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        // Binding sockets and opening the store must happen on the runtime.
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = GatewayState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, GatewayState::Stopped) {
            GatewayState::Stopped => {
                info!("Attempted to stop gateway service, but it's already stopped");
            }
            GatewayState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping gateway service");

                shutdown_handle.signal();

                runtime.block_on(async move {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn’t terminate at all");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = GatewayState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: drawbridge_task::Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = drawbridge_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let conf = conf_handle.get_conf();

    let store = LibSqlGrantStore::open(conf.database_path.as_str())
        .await
        .context("failed to open grant store")?;
    store.setup().await.context("failed to set up grant store")?;

    // Reconcile sessions orphaned by an unclean stop.
    let stale = store
        .close_stale_sessions(Utc::now())
        .await
        .context("failed to reconcile stale sessions")?;
    if stale > 0 {
        info!(count = stale, "Closed stale sessions from a previous run");
    }

    let store = Arc::new(store);

    let host_key = keys::load_or_generate_host_key(&conf.host_key_file).context("host key unavailable")?;

    let (session_manager_handle, session_manager_rx) = session_manager_channel();
    let mut tasks = Tasks::new();

    let state = CoreState {
        conf_handle: conf_handle.clone(),
        grants: Arc::clone(&store) as _,
        sessions_db: Arc::clone(&store) as _,
        audit: Arc::clone(&store) as _,
        engine: PolicyEngine::new(Arc::clone(&store) as _),
        sessions: session_manager_handle,
        ssh_config: ssh::server_config(host_key),
        shutdown_signal: tasks.shutdown_signal.clone(),
    };

    let ssh_listener =
        SshListener::init_and_bind(conf.ssh_listener, state.clone()).context("failed to bind SSH listener")?;
    tasks.register(ssh_listener);

    if conf.rdp_enabled {
        // One RDP listener per allocated proxy address. A missing address on
        // the NIC is the admin plane's business; log and carry on.
        for allocation in state.grants.active_allocations().await? {
            match RdpListener::init_and_bind(allocation.proxy_address, state.clone()).await {
                Ok(listener) => tasks.register(listener),
                Err(error) => {
                    warn!(
                        error = format!("{error:#}"),
                        proxy_address = %allocation.proxy_address,
                        "Couldn't bring up RDP listener"
                    );
                }
            }
        }
    }

    tasks.register(drawbridge_log::LogDeleterTask {
        prefix: conf.log_file.clone(),
    });

    tasks.register(SessionManagerTask::new(session_manager_rx));

    Ok(tasks)
}
