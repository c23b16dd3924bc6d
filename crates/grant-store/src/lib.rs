//! Typed read/write model for the jump host: users and their source IPs,
//! backends and proxy-address allocations, hierarchical groups, access
//! policies with schedule rules, live sessions with their transfers, and the
//! append-only audit trail.
//!
//! Storage is behind `#[async_trait]` repository traits so the decision
//! engine and the data plane stay storage-agnostic; `grant-store-libsql`
//! provides the concrete backend.

pub mod groups;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Proxied application protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Rdp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Rdp => "rdp",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "ssh" => Some(Protocol::Ssh),
            "rdp" => Some(Protocol::Rdp),
            _ => None,
        }
    }
}

impl core::fmt::Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub port_forwarding_allowed: bool,
}

/// A row linking one IP address to one user.
///
/// At most one *active* row exists per address; this is what makes
/// identification by source address unambiguous.
#[derive(Clone, Debug)]
pub struct SourceIp {
    pub id: i64,
    pub user_id: i64,
    pub address: IpAddr,
    pub label: Option<String>,
    pub is_active: bool,
}

#[derive(Clone, Debug)]
pub struct UserGroup {
    pub id: i64,
    pub name: String,
    pub parent_group_id: Option<i64>,
    pub port_forwarding_allowed: bool,
}

#[derive(Clone, Debug)]
pub struct Backend {
    pub id: i64,
    pub name: String,
    pub address: IpAddr,
    pub ssh_port: u16,
    pub rdp_port: u16,
    pub is_active: bool,
}

#[derive(Clone, Debug)]
pub struct BackendGroup {
    pub id: i64,
    pub name: String,
    pub parent_group_id: Option<i64>,
}

/// Maps a proxy address (an IP bound to the jump host NIC) to a backend.
///
/// Permanent rows have `user_id`, `session_id` and `expires_at` unset;
/// ephemeral per-session leases set all three.
#[derive(Clone, Debug)]
pub struct IpAllocation {
    pub id: i64,
    pub proxy_address: IpAddr,
    pub backend_id: i64,
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Who a policy grants access to: exactly one of a user or a user group.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PolicySubject {
    User(i64),
    UserGroup(i64),
}

/// What a policy grants access to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PolicyScope {
    /// Every backend in the (transitive) group.
    Group { group_id: i64 },
    /// One backend, any service.
    Server { backend_id: i64 },
    /// One backend, service level.
    Service { backend_id: i64 },
}

impl PolicyScope {
    pub fn target_backend_id(self) -> Option<i64> {
        match self {
            PolicyScope::Group { .. } => None,
            PolicyScope::Server { backend_id } | PolicyScope::Service { backend_id } => Some(backend_id),
        }
    }

    pub fn target_group_id(self) -> Option<i64> {
        match self {
            PolicyScope::Group { group_id } => Some(group_id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Policy {
    pub id: i64,
    pub subject: PolicySubject,
    /// `None` means any of the subject's active source IPs.
    pub source_ip_id: Option<i64>,
    pub scope: PolicyScope,
    /// `None` means any protocol.
    pub protocol: Option<Protocol>,
    pub start_time: DateTime<Utc>,
    /// `None` means no temporal end.
    pub end_time: Option<DateTime<Utc>>,
    pub port_forwarding_allowed: bool,
    pub use_schedules: bool,
    pub is_active: bool,
}

impl Policy {
    /// True when the policy row is in force at `now` (activity and temporal
    /// window; protocol/scope/subject filtering is the engine's job).
    pub fn in_force(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.start_time <= now && self.end_time.is_none_or(|end| end >= now)
    }
}

/// Recurring time window attached to a policy, evaluated in its own timezone.
///
/// `None` on a dimension means "any". Weekdays are 0=Monday … 6=Sunday,
/// months 1–12, days of month 1–31.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: i64,
    pub policy_id: i64,
    pub name: Option<String>,
    pub weekdays: Option<Vec<u8>>,
    pub time_start: Option<NaiveTime>,
    pub time_end: Option<NaiveTime>,
    pub months: Option<Vec<u8>>,
    pub days_of_month: Option<Vec<u8>>,
    pub timezone: String,
    pub is_active: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TerminationReason {
    Normal,
    Error,
    GrantExpired,
    ServiceRestart,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Normal => "normal",
            TerminationReason::Error => "error",
            TerminationReason::GrantExpired => "grant_expired",
            TerminationReason::ServiceRestart => "service_restart",
        }
    }
}

/// Session row created by the data plane on channel open.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub session_id: String,
    pub user_id: i64,
    pub backend_id: i64,
    pub protocol: Protocol,
    pub source_ip: IpAddr,
    pub proxy_ip: IpAddr,
    pub backend_ip: IpAddr,
    pub backend_port: u16,
    pub ssh_login: Option<String>,
    pub subsystem: Option<String>,
    pub agent_used: bool,
    pub started_at: DateTime<Utc>,
    pub recording_path: Option<String>,
    pub policy_id: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub id: i64,
    pub session_id: String,
    pub user_id: i64,
    pub backend_id: i64,
    pub protocol: Protocol,
    pub source_ip: IpAddr,
    pub proxy_ip: IpAddr,
    pub backend_ip: IpAddr,
    pub backend_port: u16,
    pub ssh_login: Option<String>,
    pub subsystem: Option<String>,
    pub agent_used: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub recording_path: Option<String>,
    pub recording_size: Option<u64>,
    pub is_active: bool,
    pub termination_reason: Option<String>,
    pub policy_id: Option<i64>,
}

/// Everything written when a session row is sealed.
#[derive(Clone, Debug)]
pub struct SessionEnd {
    pub ended_at: DateTime<Utc>,
    pub reason: TerminationReason,
    pub recording_size: Option<u64>,
}

/// Observed data movement inside a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferKind {
    ScpUpload,
    ScpDownload,
    SftpSession,
    PortForwardLocal,
    PortForwardRemote,
    SocksConnection,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::ScpUpload => "scp_upload",
            TransferKind::ScpDownload => "scp_download",
            TransferKind::SftpSession => "sftp_session",
            TransferKind::PortForwardLocal => "port_forward_local",
            TransferKind::PortForwardRemote => "port_forward_remote",
            TransferKind::SocksConnection => "socks_connection",
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewTransfer {
    pub session_id: i64,
    pub kind: TransferKind,
    pub file_path: Option<String>,
    pub local_addr: Option<String>,
    pub local_port: Option<u16>,
    pub remote_addr: Option<String>,
    pub remote_port: Option<u16>,
    pub started_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuditAction {
    AccessGranted,
    AccessDenied,
    SessionStarted,
    SessionEnded,
    RdpAccessDenied,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::AccessGranted => "access_granted",
            AuditAction::AccessDenied => "access_denied",
            AuditAction::SessionStarted => "session_started",
            AuditAction::SessionEnded => "session_ended",
            AuditAction::RdpAccessDenied => "rdp_access_denied",
        }
    }
}

/// One append-only audit record.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub resource_type: &'static str,
    pub resource_id: Option<i64>,
    pub source_ip: Option<IpAddr>,
    pub success: bool,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

pub type DynGrantStore = Arc<dyn GrantStore>;
pub type DynSessionStore = Arc<dyn SessionStore>;
pub type DynAuditSink = Arc<dyn AuditSink>;

/// Read model consumed by the policy decision engine and the listeners.
///
/// Entity rows are owned by the admin plane; the core only reads them.
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// The unique *active* source-IP row for `address`, if any.
    async fn source_ip_by_address(&self, address: IpAddr) -> anyhow::Result<Option<SourceIp>>;

    async fn user_by_id(&self, id: i64) -> anyhow::Result<Option<User>>;

    /// The active allocation whose proxy address is `address`, if any.
    async fn allocation_by_proxy_address(&self, address: IpAddr) -> anyhow::Result<Option<IpAllocation>>;

    /// All active *permanent* allocations (`user_id` unset), used to bring
    /// up RDP listeners. Ephemeral per-session leases are excluded.
    async fn active_allocations(&self) -> anyhow::Result<Vec<IpAllocation>>;

    async fn backend_by_id(&self, id: i64) -> anyhow::Result<Option<Backend>>;

    /// Active policies whose subject is the given user.
    async fn policies_for_user(&self, user_id: i64) -> anyhow::Result<Vec<Policy>>;

    /// Active policies whose subject is any of the given user groups.
    async fn policies_for_user_groups(&self, group_ids: &[i64]) -> anyhow::Result<Vec<Policy>>;

    /// SSH login whitelist of a policy; empty means unrestricted.
    async fn ssh_logins(&self, policy_id: i64) -> anyhow::Result<Vec<String>>;

    /// Active schedule rules attached to a policy.
    async fn schedule_rules(&self, policy_id: i64) -> anyhow::Result<Vec<ScheduleRule>>;

    /// Direct group memberships of a user.
    async fn user_group_memberships(&self, user_id: i64) -> anyhow::Result<Vec<i64>>;

    /// Direct group memberships of a backend.
    async fn backend_group_memberships(&self, backend_id: i64) -> anyhow::Result<Vec<i64>>;

    /// Full `group id → parent id` map for user groups.
    async fn user_group_parents(&self) -> anyhow::Result<HashMap<i64, Option<i64>>>;

    /// Full `group id → parent id` map for backend groups.
    async fn backend_group_parents(&self) -> anyhow::Result<HashMap<i64, Option<i64>>>;

    async fn user_group_by_id(&self, id: i64) -> anyhow::Result<Option<UserGroup>>;
}

/// Session lifecycle writes; every row is owned by the connection worker
/// that created it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new active session row and returns its row id.
    async fn insert_session(&self, session: NewSession) -> anyhow::Result<i64>;

    /// Seals a session row: `ended_at`, `duration_seconds`, reason, size.
    async fn close_session(&self, id: i64, end: SessionEnd) -> anyhow::Result<()>;

    /// Startup reconciliation: flips every orphaned active session to
    /// inactive with `service_restart`. Returns the number of rows touched.
    async fn close_stale_sessions(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn session_by_row_id(&self, id: i64) -> anyhow::Result<Option<SessionRecord>>;

    /// Inserts a transfer row and returns its row id.
    async fn insert_transfer(&self, transfer: NewTransfer) -> anyhow::Result<i64>;

    /// Final byte counters and end timestamp for a transfer.
    async fn finish_transfer(
        &self,
        id: i64,
        bytes_sent: u64,
        bytes_received: u64,
        ended_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Append-only audit log. Failures are the caller's to log and swallow: a
/// session must never fail because its audit record cannot be written.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> anyhow::Result<()>;
}
