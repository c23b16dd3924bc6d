//! libSQL implementation of the grant-store repositories.
//!
//! One struct implements [`GrantStore`], [`SessionStore`] and [`AuditSink`]
//! over a single database. The path can be a local file or `:memory:` for
//! tests. Admin-plane rows (users, groups, backends, policies, permanent
//! allocations) are created through the seeding helpers; the core itself
//! only reads them.

#[macro_use]
extern crate tracing;

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use grant_store::groups::validate_no_cycle;
use grant_store::{
    AuditEntry, AuditSink, Backend, GrantStore, IpAllocation, NewSession, NewTransfer, Policy, PolicyScope,
    PolicySubject, Protocol, ScheduleRule, SessionEnd, SessionRecord, SessionStore, SourceIp, User, UserGroup,
};
use libsql::{Connection, params};

pub use libsql;

const MIGRATIONS: &[&str] = &[
    // Migration 1 - Initial schema
    include_str!("../migrations/01_schema.sql"),
];

/// Single-connection libSQL store.
///
/// All statements are standalone (no transactions), so sharing one
/// connection between workers is safe; SQLite serializes writes and the
/// busy_timeout PRAGMA absorbs contention.
pub struct LibSqlGrantStore {
    conn: Connection,
}

impl LibSqlGrantStore {
    /// Opens (or creates) the database at `path`. `":memory:"` is accepted.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let conn = libsql::Builder::new_local(path)
            .build()
            .await
            .context("failed to open libSQL database")?
            .connect()
            .context("failed to connect to libSQL database")?;

        Ok(Self { conn })
    }

    /// Applies PRAGMAs and pending migrations. Call once before anything else.
    pub async fn setup(&self) -> anyhow::Result<()> {
        self.apply_pragmas().await?;
        self.apply_migrations().await?;
        Ok(())
    }

    async fn apply_pragmas(&self) -> anyhow::Result<()> {
        const PRAGMAS: &str = "
            -- WAL journaling plus synchronous=NORMAL is safe from corruption
            -- and a good fit for a long-lived service process.
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            -- Wait for locks instead of failing with SQLITE_BUSY.
            PRAGMA busy_timeout = 15000;

            PRAGMA cache_size = -3000;
            PRAGMA auto_vacuum = INCREMENTAL;
            PRAGMA temp_store = MEMORY;

            PRAGMA foreign_keys = ON;
        ";

        self.conn
            .execute_batch(PRAGMAS)
            .await
            .context("failed to apply PRAGMAs")?;

        Ok(())
    }

    async fn apply_migrations(&self) -> anyhow::Result<()> {
        let mut rows = self
            .conn
            .query("PRAGMA user_version", ())
            .await
            .context("failed to read user_version")?;
        let version: i64 = rows
            .next()
            .await?
            .context("PRAGMA user_version returned no row")?
            .get(0)
            .context("failed to decode user_version")?;

        let applied = usize::try_from(version).context("negative user_version")?;

        for (idx, migration) in MIGRATIONS.iter().enumerate().skip(applied) {
            debug!(migration = idx + 1, "Applying migration");
            self.conn
                .execute_batch(migration)
                .await
                .with_context(|| format!("failed to apply migration {}", idx + 1))?;
            self.conn
                .execute(&format!("PRAGMA user_version = {}", idx + 1), ())
                .await
                .context("failed to bump user_version")?;
        }

        Ok(())
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(value: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {value}"))
}

fn parse_ts_opt(value: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_ip(value: &str) -> anyhow::Result<IpAddr> {
    value.parse().with_context(|| format!("invalid IP address: {value}"))
}

fn parse_time_opt(value: Option<String>) -> anyhow::Result<Option<NaiveTime>> {
    value
        .as_deref()
        .map(|s| NaiveTime::parse_from_str(s, "%H:%M:%S").with_context(|| format!("invalid time of day: {s}")))
        .transpose()
}

fn time_opt(value: Option<NaiveTime>) -> Option<String> {
    value.map(|t| t.format("%H:%M:%S").to_string())
}

fn int_list(value: Option<&[u8]>) -> anyhow::Result<Option<String>> {
    value
        .map(|list| serde_json::to_string(list).context("failed to encode integer list"))
        .transpose()
}

fn parse_int_list(value: Option<String>) -> anyhow::Result<Option<Vec<u8>>> {
    value
        .as_deref()
        .map(|s| serde_json::from_str(s).with_context(|| format!("invalid integer list: {s}")))
        .transpose()
}

fn port_from(value: i64) -> anyhow::Result<u16> {
    u16::try_from(value).with_context(|| format!("port out of range: {value}"))
}

fn decode_policy(row: &libsql::Row) -> anyhow::Result<Policy> {
    let user_id: Option<i64> = row.get(1)?;
    let user_group_id: Option<i64> = row.get(2)?;
    let subject = match (user_id, user_group_id) {
        (Some(id), None) => PolicySubject::User(id),
        (None, Some(id)) => PolicySubject::UserGroup(id),
        _ => anyhow::bail!("policy row has an invalid subject"),
    };

    let scope_type: String = row.get(4)?;
    let target_group_id: Option<i64> = row.get(5)?;
    let target_backend_id: Option<i64> = row.get(6)?;
    let scope = match (scope_type.as_str(), target_group_id, target_backend_id) {
        ("group", Some(group_id), None) => PolicyScope::Group { group_id },
        ("server", None, Some(backend_id)) => PolicyScope::Server { backend_id },
        ("service", None, Some(backend_id)) => PolicyScope::Service { backend_id },
        _ => anyhow::bail!("policy row has an invalid scope"),
    };

    let protocol: Option<String> = row.get(7)?;
    let protocol = protocol
        .as_deref()
        .map(|value| Protocol::from_str_opt(value).with_context(|| format!("invalid protocol: {value}")))
        .transpose()?;

    Ok(Policy {
        id: row.get(0)?,
        subject,
        source_ip_id: row.get(3)?,
        scope,
        protocol,
        start_time: parse_ts(&row.get::<String>(8)?)?,
        end_time: parse_ts_opt(row.get(9)?)?,
        port_forwarding_allowed: row.get::<i64>(10)? != 0,
        use_schedules: row.get::<i64>(11)? != 0,
        is_active: row.get::<i64>(12)? != 0,
    })
}

const POLICY_COLUMNS: &str = "id, user_id, user_group_id, source_ip_id, scope_type, target_group_id, \
     target_backend_id, protocol, start_time, end_time, port_forwarding_allowed, use_schedules, is_active";

fn decode_session(row: &libsql::Row) -> anyhow::Result<SessionRecord> {
    let protocol: String = row.get(4)?;
    let recording_size: Option<i64> = row.get(16)?;

    Ok(SessionRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        backend_id: row.get(3)?,
        protocol: Protocol::from_str_opt(&protocol).with_context(|| format!("invalid protocol: {protocol}"))?,
        source_ip: parse_ip(&row.get::<String>(5)?)?,
        proxy_ip: parse_ip(&row.get::<String>(6)?)?,
        backend_ip: parse_ip(&row.get::<String>(7)?)?,
        backend_port: port_from(row.get(8)?)?,
        ssh_login: row.get(9)?,
        subsystem: row.get(10)?,
        agent_used: row.get::<i64>(11)? != 0,
        started_at: parse_ts(&row.get::<String>(12)?)?,
        ended_at: parse_ts_opt(row.get(13)?)?,
        duration_seconds: row.get(14)?,
        recording_path: row.get(15)?,
        recording_size: recording_size.map(u64::try_from).transpose().context("negative recording size")?,
        is_active: row.get::<i64>(17)? != 0,
        termination_reason: row.get(18)?,
        policy_id: row.get(19)?,
    })
}

const SESSION_COLUMNS: &str = "id, session_id, user_id, backend_id, protocol, source_ip, proxy_ip, backend_ip, \
     backend_port, ssh_login, subsystem, agent_used, started_at, ended_at, duration_seconds, recording_path, \
     recording_size, is_active, termination_reason, policy_id";

#[async_trait]
impl GrantStore for LibSqlGrantStore {
    async fn source_ip_by_address(&self, address: IpAddr) -> anyhow::Result<Option<SourceIp>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, user_id, address, label, is_active FROM user_source_ips \
                 WHERE address = ?1 AND is_active = 1",
                params![address.to_string()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        Ok(Some(SourceIp {
            id: row.get(0)?,
            user_id: row.get(1)?,
            address: parse_ip(&row.get::<String>(2)?)?,
            label: row.get(3)?,
            is_active: row.get::<i64>(4)? != 0,
        }))
    }

    async fn user_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, username, is_active, port_forwarding_allowed FROM users WHERE id = ?1",
                params![id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        Ok(Some(User {
            id: row.get(0)?,
            username: row.get(1)?,
            is_active: row.get::<i64>(2)? != 0,
            port_forwarding_allowed: row.get::<i64>(3)? != 0,
        }))
    }

    async fn allocation_by_proxy_address(&self, address: IpAddr) -> anyhow::Result<Option<IpAllocation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, proxy_address, backend_id, user_id, session_id, expires_at, is_active \
                 FROM ip_allocations WHERE proxy_address = ?1 AND is_active = 1",
                params![address.to_string()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        Ok(Some(decode_allocation(&row)?))
    }

    async fn active_allocations(&self) -> anyhow::Result<Vec<IpAllocation>> {
        // Permanent shape only: ephemeral per-session leases carry a user_id
        // and must not get a standing listener.
        let mut rows = self
            .conn
            .query(
                "SELECT id, proxy_address, backend_id, user_id, session_id, expires_at, is_active \
                 FROM ip_allocations WHERE is_active = 1 AND user_id IS NULL",
                (),
            )
            .await?;

        let mut allocations = Vec::new();
        while let Some(row) = rows.next().await? {
            allocations.push(decode_allocation(&row)?);
        }
        Ok(allocations)
    }

    async fn backend_by_id(&self, id: i64) -> anyhow::Result<Option<Backend>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, address, ssh_port, rdp_port, is_active FROM backends WHERE id = ?1",
                params![id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        Ok(Some(Backend {
            id: row.get(0)?,
            name: row.get(1)?,
            address: parse_ip(&row.get::<String>(2)?)?,
            ssh_port: port_from(row.get(3)?)?,
            rdp_port: port_from(row.get(4)?)?,
            is_active: row.get::<i64>(5)? != 0,
        }))
    }

    async fn policies_for_user(&self, user_id: i64) -> anyhow::Result<Vec<Policy>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {POLICY_COLUMNS} FROM access_policies WHERE user_id = ?1 AND is_active = 1"),
                params![user_id],
            )
            .await?;

        let mut policies = Vec::new();
        while let Some(row) = rows.next().await? {
            policies.push(decode_policy(&row)?);
        }
        Ok(policies)
    }

    async fn policies_for_user_groups(&self, group_ids: &[i64]) -> anyhow::Result<Vec<Policy>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = group_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM access_policies \
             WHERE user_group_id IN ({placeholders}) AND is_active = 1"
        );

        let params = group_ids.iter().map(|id| libsql::Value::from(*id)).collect::<Vec<_>>();
        let mut rows = self.conn.query(&sql, params).await?;

        let mut policies = Vec::new();
        while let Some(row) = rows.next().await? {
            policies.push(decode_policy(&row)?);
        }
        Ok(policies)
    }

    async fn ssh_logins(&self, policy_id: i64) -> anyhow::Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT allowed_login FROM policy_ssh_logins WHERE policy_id = ?1",
                params![policy_id],
            )
            .await?;

        let mut logins = Vec::new();
        while let Some(row) = rows.next().await? {
            logins.push(row.get(0)?);
        }
        Ok(logins)
    }

    async fn schedule_rules(&self, policy_id: i64) -> anyhow::Result<Vec<ScheduleRule>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, policy_id, name, weekdays, time_start, time_end, months, days_of_month, \
                 timezone, is_active FROM policy_schedules WHERE policy_id = ?1 AND is_active = 1",
                params![policy_id],
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(ScheduleRule {
                id: row.get(0)?,
                policy_id: row.get(1)?,
                name: row.get(2)?,
                weekdays: parse_int_list(row.get(3)?)?,
                time_start: parse_time_opt(row.get(4)?)?,
                time_end: parse_time_opt(row.get(5)?)?,
                months: parse_int_list(row.get(6)?)?,
                days_of_month: parse_int_list(row.get(7)?)?,
                timezone: row.get(8)?,
                is_active: row.get::<i64>(9)? != 0,
            });
        }
        Ok(rules)
    }

    async fn user_group_memberships(&self, user_id: i64) -> anyhow::Result<Vec<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT group_id FROM user_group_members WHERE user_id = ?1",
                params![user_id],
            )
            .await?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            groups.push(row.get(0)?);
        }
        Ok(groups)
    }

    async fn backend_group_memberships(&self, backend_id: i64) -> anyhow::Result<Vec<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT group_id FROM backend_group_members WHERE backend_id = ?1",
                params![backend_id],
            )
            .await?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            groups.push(row.get(0)?);
        }
        Ok(groups)
    }

    async fn user_group_parents(&self) -> anyhow::Result<HashMap<i64, Option<i64>>> {
        let mut rows = self.conn.query("SELECT id, parent_group_id FROM user_groups", ()).await?;

        let mut parents = HashMap::new();
        while let Some(row) = rows.next().await? {
            parents.insert(row.get(0)?, row.get(1)?);
        }
        Ok(parents)
    }

    async fn backend_group_parents(&self) -> anyhow::Result<HashMap<i64, Option<i64>>> {
        let mut rows = self
            .conn
            .query("SELECT id, parent_group_id FROM backend_groups", ())
            .await?;

        let mut parents = HashMap::new();
        while let Some(row) = rows.next().await? {
            parents.insert(row.get(0)?, row.get(1)?);
        }
        Ok(parents)
    }

    async fn user_group_by_id(&self, id: i64) -> anyhow::Result<Option<UserGroup>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, parent_group_id, port_forwarding_allowed FROM user_groups WHERE id = ?1",
                params![id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        Ok(Some(UserGroup {
            id: row.get(0)?,
            name: row.get(1)?,
            parent_group_id: row.get(2)?,
            port_forwarding_allowed: row.get::<i64>(3)? != 0,
        }))
    }
}

fn decode_allocation(row: &libsql::Row) -> anyhow::Result<IpAllocation> {
    Ok(IpAllocation {
        id: row.get(0)?,
        proxy_address: parse_ip(&row.get::<String>(1)?)?,
        backend_id: row.get(2)?,
        user_id: row.get(3)?,
        session_id: row.get(4)?,
        expires_at: parse_ts_opt(row.get(5)?)?,
        is_active: row.get::<i64>(6)? != 0,
    })
}

#[async_trait]
impl SessionStore for LibSqlGrantStore {
    async fn insert_session(&self, session: NewSession) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sessions (session_id, user_id, backend_id, protocol, source_ip, proxy_ip, \
                 backend_ip, backend_port, ssh_login, subsystem, agent_used, started_at, recording_path, \
                 policy_id, is_active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1)",
                params![
                    session.session_id,
                    session.user_id,
                    session.backend_id,
                    session.protocol.as_str(),
                    session.source_ip.to_string(),
                    session.proxy_ip.to_string(),
                    session.backend_ip.to_string(),
                    i64::from(session.backend_port),
                    session.ssh_login,
                    session.subsystem,
                    i64::from(session.agent_used),
                    ts(session.started_at),
                    session.recording_path,
                    session.policy_id,
                ],
            )
            .await
            .context("failed to insert session row")?;

        Ok(self.conn.last_insert_rowid())
    }

    async fn close_session(&self, id: i64, end: SessionEnd) -> anyhow::Result<()> {
        let recording_size = end.recording_size.map(i64::try_from).transpose().context("recording size overflow")?;

        let affected = self
            .conn
            .execute(
                "UPDATE sessions SET \
                 ended_at = ?2, \
                 is_active = 0, \
                 duration_seconds = CAST((julianday(?2) - julianday(started_at)) * 86400 AS INTEGER), \
                 termination_reason = ?3, \
                 recording_size = COALESCE(?4, recording_size) \
                 WHERE id = ?1 AND is_active = 1",
                params![id, ts(end.ended_at), end.reason.as_str(), recording_size],
            )
            .await
            .context("failed to close session row")?;

        if affected == 0 {
            debug!(session.row = id, "Session row already sealed");
        }

        Ok(())
    }

    async fn close_stale_sessions(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let affected = self
            .conn
            .execute(
                "UPDATE sessions SET \
                 ended_at = ?1, \
                 is_active = 0, \
                 duration_seconds = CAST((julianday(?1) - julianday(started_at)) * 86400 AS INTEGER), \
                 termination_reason = 'service_restart' \
                 WHERE is_active = 1 OR ended_at IS NULL",
                params![ts(now)],
            )
            .await
            .context("failed to reconcile stale sessions")?;

        Ok(affected)
    }

    async fn session_by_row_id(&self, id: i64) -> anyhow::Result<Option<SessionRecord>> {
        let mut rows = self
            .conn
            .query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"), params![id])
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        Ok(Some(decode_session(&row)?))
    }

    async fn insert_transfer(&self, transfer: NewTransfer) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO session_transfers (session_id, transfer_type, file_path, local_addr, \
                 local_port, remote_addr, remote_port, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    transfer.session_id,
                    transfer.kind.as_str(),
                    transfer.file_path,
                    transfer.local_addr,
                    transfer.local_port.map(i64::from),
                    transfer.remote_addr,
                    transfer.remote_port.map(i64::from),
                    ts(transfer.started_at),
                ],
            )
            .await
            .context("failed to insert transfer row")?;

        Ok(self.conn.last_insert_rowid())
    }

    async fn finish_transfer(
        &self,
        id: i64,
        bytes_sent: u64,
        bytes_received: u64,
        ended_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let sent = i64::try_from(bytes_sent).context("bytes_sent overflow")?;
        let received = i64::try_from(bytes_received).context("bytes_received overflow")?;

        self.conn
            .execute(
                "UPDATE session_transfers SET \
                 bytes_sent = bytes_sent + ?2, \
                 bytes_received = bytes_received + ?3, \
                 ended_at = ?4 \
                 WHERE id = ?1",
                params![id, sent, received, ts(ended_at)],
            )
            .await
            .context("failed to update transfer row")?;

        Ok(())
    }
}

#[async_trait]
impl AuditSink for LibSqlGrantStore {
    async fn record(&self, entry: AuditEntry) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO audit_logs (user_id, action, resource_type, resource_id, source_ip, \
                 success, details, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.user_id,
                    entry.action.as_str(),
                    entry.resource_type,
                    entry.resource_id,
                    entry.source_ip.map(|ip| ip.to_string()),
                    i64::from(entry.success),
                    entry.details,
                    ts(entry.timestamp),
                ],
            )
            .await
            .context("failed to append audit record")?;

        Ok(())
    }
}

/// Attributes of a policy to insert; ids of whitelisted logins and schedule
/// rules are attached afterwards.
#[derive(Clone, Debug)]
pub struct NewPolicy {
    pub subject: PolicySubject,
    pub source_ip_id: Option<i64>,
    pub scope: PolicyScope,
    pub protocol: Option<Protocol>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub port_forwarding_allowed: bool,
    pub use_schedules: bool,
}

#[derive(Clone, Debug, Default)]
pub struct NewScheduleRule {
    pub name: Option<String>,
    pub weekdays: Option<Vec<u8>>,
    pub time_start: Option<NaiveTime>,
    pub time_end: Option<NaiveTime>,
    pub months: Option<Vec<u8>>,
    pub days_of_month: Option<Vec<u8>>,
    pub timezone: Option<String>,
}

/// Admin-plane writes. The core never calls these at runtime; they exist for
/// provisioning tools and tests.
impl LibSqlGrantStore {
    pub async fn insert_user(&self, username: &str, port_forwarding_allowed: bool) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO users (username, port_forwarding_allowed) VALUES (?1, ?2)",
                params![username, i64::from(port_forwarding_allowed)],
            )
            .await
            .context("failed to insert user")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub async fn set_user_active(&self, id: i64, active: bool) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE users SET is_active = ?2 WHERE id = ?1",
                params![id, i64::from(active)],
            )
            .await?;
        Ok(())
    }

    pub async fn insert_source_ip(&self, user_id: i64, address: IpAddr, label: Option<&str>) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO user_source_ips (user_id, address, label) VALUES (?1, ?2, ?3)",
                params![user_id, address.to_string(), label],
            )
            .await
            .context("failed to insert source IP")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub async fn insert_user_group(
        &self,
        name: &str,
        parent_group_id: Option<i64>,
        port_forwarding_allowed: bool,
    ) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO user_groups (name, parent_group_id, port_forwarding_allowed) VALUES (?1, ?2, ?3)",
                params![name, parent_group_id, i64::from(port_forwarding_allowed)],
            )
            .await
            .context("failed to insert user group")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Re-parents a user group, refusing edges that would close a cycle.
    pub async fn set_user_group_parent(&self, id: i64, parent: Option<i64>) -> anyhow::Result<()> {
        let parents = self.user_group_parents().await?;
        validate_no_cycle(id, parent, &parents)?;

        self.conn
            .execute(
                "UPDATE user_groups SET parent_group_id = ?2 WHERE id = ?1",
                params![id, parent],
            )
            .await?;
        Ok(())
    }

    pub async fn add_user_to_group(&self, user_id: i64, group_id: i64) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_group_members (user_id, group_id) VALUES (?1, ?2)",
                params![user_id, group_id],
            )
            .await
            .context("failed to insert group membership")?;
        Ok(())
    }

    pub async fn insert_backend(&self, name: &str, address: IpAddr) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO backends (name, address) VALUES (?1, ?2)",
                params![name, address.to_string()],
            )
            .await
            .context("failed to insert backend")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub async fn insert_backend_group(&self, name: &str, parent_group_id: Option<i64>) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO backend_groups (name, parent_group_id) VALUES (?1, ?2)",
                params![name, parent_group_id],
            )
            .await
            .context("failed to insert backend group")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Re-parents a backend group, refusing edges that would close a cycle.
    pub async fn set_backend_group_parent(&self, id: i64, parent: Option<i64>) -> anyhow::Result<()> {
        let parents = self.backend_group_parents().await?;
        validate_no_cycle(id, parent, &parents)?;

        self.conn
            .execute(
                "UPDATE backend_groups SET parent_group_id = ?2 WHERE id = ?1",
                params![id, parent],
            )
            .await?;
        Ok(())
    }

    pub async fn add_backend_to_group(&self, backend_id: i64, group_id: i64) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO backend_group_members (backend_id, group_id) VALUES (?1, ?2)",
                params![backend_id, group_id],
            )
            .await
            .context("failed to insert backend group membership")?;
        Ok(())
    }

    /// Permanent proxy-address assignment for a backend.
    pub async fn insert_allocation(&self, proxy_address: IpAddr, backend_id: i64) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO ip_allocations (proxy_address, backend_id) VALUES (?1, ?2)",
                params![proxy_address.to_string(), backend_id],
            )
            .await
            .context("failed to insert IP allocation")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Ephemeral per-session lease on a proxy address; torn down with its
    /// session.
    pub async fn insert_session_lease(
        &self,
        proxy_address: IpAddr,
        backend_id: i64,
        user_id: i64,
        session_id: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO ip_allocations (proxy_address, backend_id, user_id, session_id, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![proxy_address.to_string(), backend_id, user_id, session_id, ts(expires_at)],
            )
            .await
            .context("failed to insert session lease")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub async fn insert_policy(&self, policy: NewPolicy) -> anyhow::Result<i64> {
        let (user_id, user_group_id) = match policy.subject {
            PolicySubject::User(id) => (Some(id), None),
            PolicySubject::UserGroup(id) => (None, Some(id)),
        };
        let (scope_type, target_group_id, target_backend_id) = match policy.scope {
            PolicyScope::Group { group_id } => ("group", Some(group_id), None),
            PolicyScope::Server { backend_id } => ("server", None, Some(backend_id)),
            PolicyScope::Service { backend_id } => ("service", None, Some(backend_id)),
        };

        self.conn
            .execute(
                "INSERT INTO access_policies (user_id, user_group_id, source_ip_id, scope_type, \
                 target_group_id, target_backend_id, protocol, start_time, end_time, \
                 port_forwarding_allowed, use_schedules) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    user_id,
                    user_group_id,
                    policy.source_ip_id,
                    scope_type,
                    target_group_id,
                    target_backend_id,
                    policy.protocol.map(Protocol::as_str),
                    ts(policy.start_time),
                    policy.end_time.map(ts),
                    i64::from(policy.port_forwarding_allowed),
                    i64::from(policy.use_schedules),
                ],
            )
            .await
            .context("failed to insert policy")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub async fn add_policy_login(&self, policy_id: i64, login: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO policy_ssh_logins (policy_id, allowed_login) VALUES (?1, ?2)",
                params![policy_id, login],
            )
            .await
            .context("failed to insert policy login")?;
        Ok(())
    }

    pub async fn add_schedule_rule(&self, policy_id: i64, rule: NewScheduleRule) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO policy_schedules (policy_id, name, weekdays, time_start, time_end, months, \
                 days_of_month, timezone) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, 'Europe/Warsaw'))",
                params![
                    policy_id,
                    rule.name,
                    int_list(rule.weekdays.as_deref())?,
                    time_opt(rule.time_start),
                    time_opt(rule.time_end),
                    int_list(rule.months.as_deref())?,
                    int_list(rule.days_of_month.as_deref())?,
                    rule.timezone,
                ],
            )
            .await
            .context("failed to insert schedule rule")?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone as _;
    use grant_store::TerminationReason;

    use super::*;

    async fn store() -> LibSqlGrantStore {
        let store = LibSqlGrantStore::open(":memory:").await.unwrap();
        store.setup().await.unwrap();
        store
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn new_session(backend_id: i64, user_id: i64, session_id: &str) -> NewSession {
        NewSession {
            session_id: session_id.to_owned(),
            user_id,
            backend_id,
            protocol: Protocol::Ssh,
            source_ip: ip("203.0.113.5"),
            proxy_ip: ip("198.51.100.20"),
            backend_ip: ip("10.0.0.4"),
            backend_port: 22,
            ssh_login: Some("root".to_owned()),
            subsystem: None,
            agent_used: false,
            started_at: at(2026, 2, 10, 14, 0),
            recording_path: None,
            policy_id: None,
        }
    }

    #[tokio::test]
    async fn setup_is_idempotent() {
        let store = store().await;
        store.setup().await.unwrap();
    }

    #[tokio::test]
    async fn active_proxy_address_is_unique() {
        let store = store().await;
        let backend = store.insert_backend("b1", ip("10.0.0.4")).await.unwrap();
        store.insert_allocation(ip("198.51.100.20"), backend).await.unwrap();

        let duplicate = store.insert_allocation(ip("198.51.100.20"), backend).await;
        assert!(duplicate.is_err(), "second active row for the same proxy address must be rejected");
    }

    #[tokio::test]
    async fn active_allocations_lists_permanent_rows_only() {
        let store = store().await;
        let user = store.insert_user("bob", false).await.unwrap();
        let backend = store.insert_backend("b1", ip("10.0.0.4")).await.unwrap();
        store.insert_allocation(ip("198.51.100.20"), backend).await.unwrap();
        store
            .insert_session_lease(ip("198.51.100.21"), backend, user, "s-1", at(2026, 2, 10, 15, 0))
            .await
            .unwrap();

        let allocations = store.active_allocations().await.unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].proxy_address, ip("198.51.100.20"));
        assert!(allocations[0].user_id.is_none());

        // The lease still resolves as a destination address.
        let lease = store.allocation_by_proxy_address(ip("198.51.100.21")).await.unwrap().unwrap();
        assert_eq!(lease.user_id, Some(user));
        assert_eq!(lease.session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn active_source_ip_identifies_one_user() {
        let store = store().await;
        let alice = store.insert_user("alice", false).await.unwrap();
        let bob = store.insert_user("bob", false).await.unwrap();
        store.insert_source_ip(alice, ip("203.0.113.5"), Some("office")).await.unwrap();

        assert!(store.insert_source_ip(bob, ip("203.0.113.5"), None).await.is_err());

        let row = store.source_ip_by_address(ip("203.0.113.5")).await.unwrap().unwrap();
        assert_eq!(row.user_id, alice);
    }

    #[tokio::test]
    async fn session_active_iff_not_ended() {
        let store = store().await;
        let user = store.insert_user("bob", false).await.unwrap();
        let backend = store.insert_backend("b1", ip("10.0.0.4")).await.unwrap();

        let row_id = store.insert_session(new_session(backend, user, "s-1")).await.unwrap();

        let open = store.session_by_row_id(row_id).await.unwrap().unwrap();
        assert!(open.is_active);
        assert!(open.ended_at.is_none());

        store
            .close_session(
                row_id,
                SessionEnd {
                    ended_at: at(2026, 2, 10, 15, 30),
                    reason: TerminationReason::Normal,
                    recording_size: Some(4096),
                },
            )
            .await
            .unwrap();

        let sealed = store.session_by_row_id(row_id).await.unwrap().unwrap();
        assert!(!sealed.is_active);
        assert_eq!(sealed.ended_at, Some(at(2026, 2, 10, 15, 30)));
        assert_eq!(sealed.duration_seconds, Some(90 * 60));
        assert_eq!(sealed.termination_reason.as_deref(), Some("normal"));
        assert_eq!(sealed.recording_size, Some(4096));
    }

    #[tokio::test]
    async fn stale_sessions_are_reconciled_on_startup() {
        let store = store().await;
        let user = store.insert_user("bob", false).await.unwrap();
        let backend = store.insert_backend("b1", ip("10.0.0.4")).await.unwrap();

        let orphan = store.insert_session(new_session(backend, user, "s-1")).await.unwrap();
        let closed = store.insert_session(new_session(backend, user, "s-2")).await.unwrap();
        store
            .close_session(
                closed,
                SessionEnd {
                    ended_at: at(2026, 2, 10, 14, 5),
                    reason: TerminationReason::Normal,
                    recording_size: None,
                },
            )
            .await
            .unwrap();

        let touched = store.close_stale_sessions(at(2026, 2, 11, 8, 0)).await.unwrap();
        assert_eq!(touched, 1);

        let reconciled = store.session_by_row_id(orphan).await.unwrap().unwrap();
        assert!(!reconciled.is_active);
        assert_eq!(reconciled.termination_reason.as_deref(), Some("service_restart"));
        assert_eq!(reconciled.duration_seconds, Some(18 * 60 * 60));

        let untouched = store.session_by_row_id(closed).await.unwrap().unwrap();
        assert_eq!(untouched.termination_reason.as_deref(), Some("normal"));
    }

    #[tokio::test]
    async fn transfer_counters_accumulate() {
        let store = store().await;
        let user = store.insert_user("bob", true).await.unwrap();
        let backend = store.insert_backend("b1", ip("10.0.0.4")).await.unwrap();
        let session = store.insert_session(new_session(backend, user, "s-1")).await.unwrap();

        let transfer = store
            .insert_transfer(NewTransfer {
                session_id: session,
                kind: grant_store::TransferKind::PortForwardLocal,
                file_path: None,
                local_addr: Some("127.0.0.1".to_owned()),
                local_port: Some(5432),
                remote_addr: Some("127.0.0.1".to_owned()),
                remote_port: Some(5432),
                started_at: at(2026, 2, 10, 14, 1),
            })
            .await
            .unwrap();

        store.finish_transfer(transfer, 1024, 2048, at(2026, 2, 10, 14, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn group_reparenting_refuses_cycles() {
        let store = store().await;
        let root = store.insert_user_group("ops", None, false).await.unwrap();
        let child = store.insert_user_group("ops-eu", Some(root), false).await.unwrap();

        assert!(store.set_user_group_parent(root, Some(child)).await.is_err());
        store.set_user_group_parent(child, None).await.unwrap();
    }

    #[tokio::test]
    async fn policies_decode_subject_and_scope() {
        let store = store().await;
        let user = store.insert_user("bob", false).await.unwrap();
        let backend = store.insert_backend("b1", ip("10.0.0.4")).await.unwrap();
        let group = store.insert_backend_group("db-servers", None).await.unwrap();

        store
            .insert_policy(NewPolicy {
                subject: PolicySubject::User(user),
                source_ip_id: None,
                scope: PolicyScope::Server { backend_id: backend },
                protocol: Some(Protocol::Ssh),
                start_time: at(2026, 2, 1, 0, 0),
                end_time: Some(at(2026, 2, 28, 0, 0)),
                port_forwarding_allowed: false,
                use_schedules: false,
            })
            .await
            .unwrap();
        store
            .insert_policy(NewPolicy {
                subject: PolicySubject::User(user),
                source_ip_id: None,
                scope: PolicyScope::Group { group_id: group },
                protocol: None,
                start_time: at(2026, 2, 1, 0, 0),
                end_time: None,
                port_forwarding_allowed: true,
                use_schedules: false,
            })
            .await
            .unwrap();

        let policies = store.policies_for_user(user).await.unwrap();
        assert_eq!(policies.len(), 2);
        assert!(policies.iter().any(|p| p.scope == PolicyScope::Server { backend_id: backend }));
        assert!(policies.iter().any(|p| p.scope == PolicyScope::Group { group_id: group }));
        assert!(policies.iter().all(|p| p.subject == PolicySubject::User(user)));
    }

    #[tokio::test]
    async fn schedule_rules_round_trip() {
        let store = store().await;
        let user = store.insert_user("bob", false).await.unwrap();
        let backend = store.insert_backend("b1", ip("10.0.0.4")).await.unwrap();
        let policy = store
            .insert_policy(NewPolicy {
                subject: PolicySubject::User(user),
                source_ip_id: None,
                scope: PolicyScope::Server { backend_id: backend },
                protocol: Some(Protocol::Ssh),
                start_time: at(2026, 2, 1, 0, 0),
                end_time: None,
                port_forwarding_allowed: false,
                use_schedules: true,
            })
            .await
            .unwrap();

        store
            .add_schedule_rule(
                policy,
                NewScheduleRule {
                    name: Some("Business hours".to_owned()),
                    weekdays: Some(vec![0, 1, 2, 3, 4]),
                    time_start: NaiveTime::from_hms_opt(8, 0, 0),
                    time_end: NaiveTime::from_hms_opt(16, 0, 0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let rules = store.schedule_rules(policy).await.unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.weekdays.as_deref(), Some(&[0, 1, 2, 3, 4][..]));
        assert_eq!(rule.time_start, NaiveTime::from_hms_opt(8, 0, 0));
        assert_eq!(rule.time_end, NaiveTime::from_hms_opt(16, 0, 0));
        assert_eq!(rule.timezone, "Europe/Warsaw");
        assert!(rule.months.is_none());
    }
}
