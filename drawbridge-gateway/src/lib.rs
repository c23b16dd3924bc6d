#[macro_use]
extern crate tracing;

pub mod config;
pub mod duration;
pub mod expiry;
pub mod keys;
pub mod listener;
pub mod policy;
pub mod rdp;
pub mod recording;
pub mod schedule;
pub mod session;
pub mod ssh;

use std::sync::Arc;

use drawbridge_task::ShutdownSignal;
use grant_store::{DynAuditSink, DynGrantStore, DynSessionStore};

use crate::config::ConfHandle;
use crate::policy::PolicyEngine;
use crate::session::SessionMessageSender;

/// Everything a connection worker needs, cloned per accepted connection.
#[derive(Clone)]
pub struct CoreState {
    pub conf_handle: ConfHandle,
    pub grants: DynGrantStore,
    pub sessions_db: DynSessionStore,
    pub audit: DynAuditSink,
    pub engine: Arc<PolicyEngine>,
    pub sessions: SessionMessageSender,
    pub ssh_config: Arc<russh::server::Config>,
    pub shutdown_signal: ShutdownSignal,
}
