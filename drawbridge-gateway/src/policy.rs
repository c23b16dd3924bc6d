//! Policy decision engine.
//!
//! Resolves `(source IP, destination IP, protocol, login, now)` against the
//! grant store and produces a typed decision. Denial is a value carrying one
//! reason from a closed taxonomy; nothing in the decision path is signalled
//! through errors except genuine store failures, which map to
//! [`DenyReason::InternalError`].

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use grant_store::groups::expand_memberships;
use grant_store::{
    AuditAction, AuditEntry, Backend, DynAuditSink, DynGrantStore, IpAllocation, Policy, PolicySubject, Protocol,
    SourceIp, User,
};

use crate::schedule;

/// Why access was refused. Every denial carries exactly one of these.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DenyReason {
    UnknownSourceIp,
    UserInactive,
    UnknownBackend,
    NoMatchingPolicy,
    LoginNotAllowed,
    ScheduleClosed,
    InternalError,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::UnknownSourceIp => "unknown_source_ip",
            DenyReason::UserInactive => "user_inactive",
            DenyReason::UnknownBackend => "unknown_backend",
            DenyReason::NoMatchingPolicy => "no_matching_policy",
            DenyReason::LoginNotAllowed => "login_not_allowed",
            DenyReason::ScheduleClosed => "schedule_closed",
            DenyReason::InternalError => "internal_error",
        }
    }

    /// Text shown to remote users in the denial banner.
    pub fn human_message(self, source_ip: IpAddr, login: Option<&str>) -> String {
        match self {
            DenyReason::UnknownSourceIp => format!("Unknown source IP {source_ip}"),
            DenyReason::UserInactive => "User account is inactive".to_owned(),
            DenyReason::UnknownBackend => "No backend server for this destination".to_owned(),
            DenyReason::NoMatchingPolicy => "No matching access policy".to_owned(),
            DenyReason::LoginNotAllowed => match login {
                Some(login) => format!("SSH login {login:?} is not allowed by your access policy"),
                None => "SSH login is not allowed by your access policy".to_owned(),
            },
            DenyReason::ScheduleClosed => "Access is outside the allowed schedule window".to_owned(),
            DenyReason::InternalError => "Internal error during access resolution".to_owned(),
        }
    }
}

/// Everything the data plane needs after a successful grant.
#[derive(Clone, Debug)]
pub struct GrantedAccess {
    pub user: User,
    pub source_ip: SourceIp,
    pub backend: Backend,
    pub allocation: IpAllocation,
    pub policies: Vec<Policy>,
    /// Earliest UTC instant at which the session must be torn down; `None`
    /// means no timed teardown.
    pub effective_end: Option<DateTime<Utc>>,
    /// Name of the schedule window that admitted the session, if any.
    pub matched_schedule: Option<String>,
}

#[derive(Clone, Debug)]
pub enum AccessDecision {
    Granted(Box<GrantedAccess>),
    Denied {
        reason: DenyReason,
        /// Set when the user was identified before the decision failed.
        user: Option<User>,
    },
}

impl AccessDecision {
    pub fn granted(&self) -> Option<&GrantedAccess> {
        match self {
            AccessDecision::Granted(access) => Some(access),
            AccessDecision::Denied { .. } => None,
        }
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            AccessDecision::Granted(_) => None,
            AccessDecision::Denied { reason, .. } => Some(*reason),
        }
    }
}

pub struct PolicyEngine {
    store: DynGrantStore,
}

impl PolicyEngine {
    pub fn new(store: DynGrantStore) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Full resolution; never fails. Store errors surface as
    /// `DenyReason::InternalError` denials and are logged with their chain.
    pub async fn check_access(
        &self,
        source_ip: IpAddr,
        dest_ip: IpAddr,
        protocol: Protocol,
        login: Option<&str>,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        match self.resolve(source_ip, dest_ip, protocol, login, now).await {
            Ok(decision) => decision,
            Err(error) => {
                error!(
                    error = format!("{error:#}"),
                    %source_ip, %dest_ip, %protocol,
                    "Access resolution failed"
                );
                AccessDecision::Denied {
                    reason: DenyReason::InternalError,
                    user: None,
                }
            }
        }
    }

    async fn resolve(
        &self,
        source_ip: IpAddr,
        dest_ip: IpAddr,
        protocol: Protocol,
        login: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<AccessDecision> {
        // Step 1: identify the user by source IP.
        let Some(ip_row) = self.store.source_ip_by_address(source_ip).await? else {
            debug!(%source_ip, "No active source IP row");
            return Ok(AccessDecision::Denied {
                reason: DenyReason::UnknownSourceIp,
                user: None,
            });
        };

        let user = self.store.user_by_id(ip_row.user_id).await?;
        let Some(user) = user.filter(|user| user.is_active) else {
            debug!(%source_ip, user.id = ip_row.user_id, "User missing or inactive");
            return Ok(AccessDecision::Denied {
                reason: DenyReason::UserInactive,
                user: None,
            });
        };

        // Step 2: resolve the backend by destination IP.
        let allocation = self.store.allocation_by_proxy_address(dest_ip).await?;
        let backend = match &allocation {
            Some(allocation) => self
                .store
                .backend_by_id(allocation.backend_id)
                .await?
                .filter(|backend| backend.is_active),
            None => None,
        };
        let (Some(allocation), Some(backend)) = (allocation, backend) else {
            debug!(%dest_ip, "No active backend behind destination IP");
            return Ok(AccessDecision::Denied {
                reason: DenyReason::UnknownBackend,
                user: Some(user),
            });
        };

        let backend_groups = expand_memberships(
            &self.store.backend_group_memberships(backend.id).await?,
            &self.store.backend_group_parents().await?,
        )?;

        let retain_candidate = |policy: &Policy| {
            // Steps 3 and 5: temporal + protocol window, then scope.
            if !policy.in_force(now) {
                return false;
            }
            if policy.protocol.is_some_and(|p| p != protocol) {
                return false;
            }
            match policy.scope.target_backend_id() {
                Some(backend_id) => backend_id == backend.id,
                None => policy
                    .scope
                    .target_group_id()
                    .is_some_and(|group_id| backend_groups.contains(&group_id)),
            }
        };

        // Steps 4, 6, 7: direct user policies take absolute priority. The
        // source-IP constraint applies to direct policies only.
        let direct: Vec<Policy> = self
            .store
            .policies_for_user(user.id)
            .await?
            .into_iter()
            .filter(&retain_candidate)
            .filter(|policy| policy.source_ip_id.is_none_or(|id| id == ip_row.id))
            .collect();

        let (candidates, used_direct) = if direct.is_empty() {
            let user_groups = expand_memberships(
                &self.store.user_group_memberships(user.id).await?,
                &self.store.user_group_parents().await?,
            )?;
            let group_ids: Vec<i64> = user_groups.into_iter().collect();
            let group_policies: Vec<Policy> = self
                .store
                .policies_for_user_groups(&group_ids)
                .await?
                .into_iter()
                .filter(&retain_candidate)
                .collect();
            (group_policies, false)
        } else {
            (direct, true)
        };

        if candidates.is_empty() {
            debug!(user.name = %user.username, backend.name = %backend.name, "No matching policy");
            return Ok(AccessDecision::Denied {
                reason: DenyReason::NoMatchingPolicy,
                user: Some(user),
            });
        }

        // Step 8: SSH login whitelist. No fallback from direct policies to
        // group policies: an empty direct set after this filter is final.
        let candidates = match (protocol, login) {
            (Protocol::Ssh, Some(login)) if !login.is_empty() => {
                let mut surviving = Vec::new();
                for policy in candidates {
                    let whitelist = self.store.ssh_logins(policy.id).await?;
                    if whitelist.is_empty() || whitelist.iter().any(|allowed| allowed == login) {
                        surviving.push(policy);
                    }
                }
                if surviving.is_empty() {
                    debug!(
                        user.name = %user.username,
                        login,
                        direct = used_direct,
                        "Login not whitelisted by any matching policy"
                    );
                    return Ok(AccessDecision::Denied {
                        reason: DenyReason::LoginNotAllowed,
                        user: Some(user),
                    });
                }
                surviving
            }
            _ => candidates,
        };

        // Step 9: schedule windows.
        let mut surviving = Vec::new();
        let mut matched_schedule = None;
        let mut earliest_schedule_end: Option<DateTime<Utc>> = None;
        for policy in candidates {
            if !policy.use_schedules {
                surviving.push(policy);
                continue;
            }
            let rules = self.store.schedule_rules(policy.id).await?;
            let (open, name) = schedule::any_matches(&rules, now);
            if !open {
                continue;
            }
            if matched_schedule.is_none() {
                matched_schedule = name.map(str::to_owned);
            }
            if let Some(end) = schedule::earliest_window_end(&rules, now) {
                earliest_schedule_end = Some(earliest_schedule_end.map_or(end, |current| current.min(end)));
            }
            surviving.push(policy);
        }

        if surviving.is_empty() {
            debug!(user.name = %user.username, backend.name = %backend.name, "All policies outside schedule windows");
            return Ok(AccessDecision::Denied {
                reason: DenyReason::ScheduleClosed,
                user: Some(user),
            });
        }

        // Effective deadline: min over policy end times and schedule window
        // ends of the surviving set.
        let policy_end = surviving.iter().filter_map(|policy| policy.end_time).min();
        let effective_end = match (policy_end, earliest_schedule_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (end, None) | (None, end) => end,
        };

        info!(
            user.name = %user.username,
            backend.name = %backend.name,
            %protocol,
            policies = surviving.len(),
            direct = used_direct,
            effective_end = effective_end.map(|end| end.to_rfc3339()).unwrap_or_default(),
            "Access granted"
        );

        Ok(AccessDecision::Granted(Box::new(GrantedAccess {
            user,
            source_ip: ip_row,
            backend,
            allocation,
            policies: surviving,
            effective_end,
            matched_schedule,
        })))
    }

    /// Whether port forwarding is permitted for this source/destination
    /// pair: some surviving policy, the user, or one of the user's expanded
    /// groups must carry the flag.
    pub async fn port_forwarding_allowed(
        &self,
        source_ip: IpAddr,
        dest_ip: IpAddr,
        protocol: Protocol,
        now: DateTime<Utc>,
    ) -> bool {
        let AccessDecision::Granted(access) = self.check_access(source_ip, dest_ip, protocol, None, now).await else {
            return false;
        };

        if access.user.port_forwarding_allowed {
            return true;
        }
        if access.policies.iter().any(|policy| policy.port_forwarding_allowed) {
            return true;
        }

        match self.group_port_forwarding(&access.user).await {
            Ok(allowed) => allowed,
            Err(error) => {
                error!(error = format!("{error:#}"), "Group port-forwarding lookup failed");
                false
            }
        }
    }

    async fn group_port_forwarding(&self, user: &User) -> anyhow::Result<bool> {
        let groups = expand_memberships(
            &self.store.user_group_memberships(user.id).await?,
            &self.store.user_group_parents().await?,
        )?;

        for group_id in groups {
            if let Some(group) = self.store.user_group_by_id(group_id).await?
                && group.port_forwarding_allowed
            {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Appends an audit record for a decision; failures are logged and swallowed.
pub async fn audit_decision(
    audit: &DynAuditSink,
    source_ip: IpAddr,
    dest_ip: IpAddr,
    protocol: Protocol,
    login: Option<&str>,
    decision: &AccessDecision,
    now: DateTime<Utc>,
) {
    let (action, success, user_id, details) = match decision {
        AccessDecision::Granted(access) => (
            AuditAction::AccessGranted,
            true,
            Some(access.user.id),
            format!(
                "Protocol: {protocol}, Destination: {dest_ip} ({}){}",
                access.backend.name,
                login.map(|login| format!(", Login: {login}")).unwrap_or_default(),
            ),
        ),
        AccessDecision::Denied { reason, user } => (
            if protocol == Protocol::Rdp {
                AuditAction::RdpAccessDenied
            } else {
                AuditAction::AccessDenied
            },
            false,
            user.as_ref().map(|user| user.id),
            format!(
                "Protocol: {protocol}, Destination: {dest_ip}. {}",
                reason.human_message(source_ip, login)
            ),
        ),
    };

    let entry = AuditEntry {
        user_id,
        action,
        resource_type: "access_attempt",
        resource_id: None,
        source_ip: Some(source_ip),
        success,
        details,
        timestamp: now,
    };

    if let Err(error) = audit.record(entry).await {
        error!(error = format!("{error:#}"), "Failed to append audit record");
    }
}
