//! Decision-engine scenarios against an in-memory store.

#![allow(clippy::unwrap_used)]

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, TimeZone as _, Utc};
use drawbridge_gateway::policy::{AccessDecision, DenyReason, PolicyEngine};
use grant_store::{PolicyScope, PolicySubject, Protocol};
use grant_store_libsql::{LibSqlGrantStore, NewPolicy, NewScheduleRule};

const CLIENT_IP: &str = "203.0.113.5";
const PROXY_IP: &str = "198.51.100.20";
const BACKEND_IP: &str = "10.0.0.4";

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

struct Fixture {
    store: Arc<LibSqlGrantStore>,
    engine: Arc<PolicyEngine>,
    user_id: i64,
    backend_id: i64,
}

impl Fixture {
    async fn new() -> Self {
        let store = LibSqlGrantStore::open(":memory:").await.unwrap();
        store.setup().await.unwrap();

        let user_id = store.insert_user("bob", false).await.unwrap();
        store.insert_source_ip(user_id, ip(CLIENT_IP), Some("office")).await.unwrap();
        let backend_id = store.insert_backend("b1", ip(BACKEND_IP)).await.unwrap();
        store.insert_allocation(ip(PROXY_IP), backend_id).await.unwrap();

        let store = Arc::new(store);
        let engine = PolicyEngine::new(Arc::clone(&store) as _);

        Self {
            store,
            engine,
            user_id,
            backend_id,
        }
    }

    fn server_policy(&self) -> NewPolicy {
        NewPolicy {
            subject: PolicySubject::User(self.user_id),
            source_ip_id: None,
            scope: PolicyScope::Server {
                backend_id: self.backend_id,
            },
            protocol: Some(Protocol::Ssh),
            start_time: at(2026, 2, 1, 0, 0),
            end_time: Some(at(2026, 2, 28, 0, 0)),
            port_forwarding_allowed: false,
            use_schedules: false,
        }
    }

    async fn check(&self, login: Option<&str>, now: DateTime<Utc>) -> AccessDecision {
        self.engine.check_access(ip(CLIENT_IP), ip(PROXY_IP), Protocol::Ssh, login, now).await
    }
}

#[tokio::test]
async fn unknown_source_ip_is_denied() {
    let fx = Fixture::new().await;

    let decision = fx
        .engine
        .check_access(ip("203.0.113.9"), ip("198.51.100.10"), Protocol::Ssh, Some("alice"), at(2026, 2, 5, 10, 0))
        .await;

    assert_eq!(decision.deny_reason(), Some(DenyReason::UnknownSourceIp));
}

#[tokio::test]
async fn inactive_user_is_denied() {
    let fx = Fixture::new().await;
    fx.store.set_user_active(fx.user_id, false).await.unwrap();

    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::UserInactive));
}

#[tokio::test]
async fn unmapped_destination_is_denied() {
    let fx = Fixture::new().await;

    let decision = fx
        .engine
        .check_access(ip(CLIENT_IP), ip("198.51.100.99"), Protocol::Ssh, Some("root"), at(2026, 2, 10, 14, 0))
        .await;

    assert_eq!(decision.deny_reason(), Some(DenyReason::UnknownBackend));
}

#[tokio::test]
async fn direct_server_policy_grants_with_policy_end() {
    let fx = Fixture::new().await;
    let policy_id = fx.store.insert_policy(fx.server_policy()).await.unwrap();

    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    let access = decision.granted().expect("access should be granted");

    assert_eq!(access.user.username, "bob");
    assert_eq!(access.backend.id, fx.backend_id);
    assert_eq!(access.policies.len(), 1);
    assert_eq!(access.policies[0].id, policy_id);
    assert_eq!(access.effective_end, Some(at(2026, 2, 28, 0, 0)));
}

#[tokio::test]
async fn schedule_window_narrows_effective_end() {
    let fx = Fixture::new().await;

    let mut policy = fx.server_policy();
    policy.end_time = Some(at(2026, 2, 28, 23, 59));
    policy.use_schedules = true;
    let policy_id = fx.store.insert_policy(policy).await.unwrap();

    fx.store
        .add_schedule_rule(
            policy_id,
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

    // Tuesday 2026-02-10, 10:00 in Warsaw.
    let decision = fx.check(Some("root"), at(2026, 2, 10, 9, 0)).await;
    let access = decision.granted().expect("inside the schedule window");

    // 16:00 Warsaw that day, not the policy end three weeks later.
    assert_eq!(access.effective_end, Some(at(2026, 2, 10, 15, 0)));

    // Saturday: the same policy is schedule-closed.
    let decision = fx.check(Some("root"), at(2026, 2, 14, 9, 0)).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::ScheduleClosed));
}

#[tokio::test]
async fn direct_policy_login_whitelist_blocks_group_rescue() {
    let fx = Fixture::new().await;

    // Direct policy restricted to "deploy".
    let direct = fx.store.insert_policy(fx.server_policy()).await.unwrap();
    fx.store.add_policy_login(direct, "deploy").await.unwrap();

    // Group policy on the same backend, unrestricted.
    let group = fx.store.insert_user_group("ops", None, false).await.unwrap();
    fx.store.add_user_to_group(fx.user_id, group).await.unwrap();
    let mut group_policy = fx.server_policy();
    group_policy.subject = PolicySubject::UserGroup(group);
    fx.store.insert_policy(group_policy).await.unwrap();

    // The direct policy is used exclusively; the group one cannot rescue.
    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::LoginNotAllowed));

    // The whitelisted login works through the direct policy.
    let decision = fx.check(Some("deploy"), at(2026, 2, 10, 14, 0)).await;
    let access = decision.granted().expect("whitelisted login");
    assert!(access.policies.iter().all(|policy| policy.subject == PolicySubject::User(fx.user_id)));
}

#[tokio::test]
async fn empty_login_skips_the_whitelist() {
    let fx = Fixture::new().await;
    let direct = fx.store.insert_policy(fx.server_policy()).await.unwrap();
    fx.store.add_policy_login(direct, "deploy").await.unwrap();

    // The pre-auth probe runs without a login and must see a grant.
    let decision = fx.check(None, at(2026, 2, 10, 14, 0)).await;
    assert!(decision.granted().is_some());
}

#[tokio::test]
async fn group_policy_reaches_through_parent_groups() {
    let fx = Fixture::new().await;

    // bob ∈ ops-eu, ops-eu ⊂ ops; backend ∈ db-servers ⊂ all-servers.
    let ops = fx.store.insert_user_group("ops", None, false).await.unwrap();
    let ops_eu = fx.store.insert_user_group("ops-eu", Some(ops), false).await.unwrap();
    fx.store.add_user_to_group(fx.user_id, ops_eu).await.unwrap();

    let all_servers = fx.store.insert_backend_group("all-servers", None).await.unwrap();
    let db_servers = fx.store.insert_backend_group("db-servers", Some(all_servers)).await.unwrap();
    fx.store.add_backend_to_group(fx.backend_id, db_servers).await.unwrap();

    // Policy: group `ops` may reach backend group `all-servers`.
    let mut policy = fx.server_policy();
    policy.subject = PolicySubject::UserGroup(ops);
    policy.scope = PolicyScope::Group { group_id: all_servers };
    fx.store.insert_policy(policy).await.unwrap();

    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    let access = decision.granted().expect("transitive group grant");
    assert!(access.policies.iter().all(|policy| matches!(policy.subject, PolicySubject::UserGroup(_))));
}

#[tokio::test]
async fn no_policy_means_no_matching_policy() {
    let fx = Fixture::new().await;

    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::NoMatchingPolicy));
}

#[tokio::test]
async fn expired_policy_does_not_match() {
    let fx = Fixture::new().await;
    fx.store.insert_policy(fx.server_policy()).await.unwrap();

    let decision = fx.check(Some("root"), at(2026, 3, 1, 0, 0)).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::NoMatchingPolicy));
}

#[tokio::test]
async fn protocol_scoped_policy_does_not_leak() {
    let fx = Fixture::new().await;
    let mut policy = fx.server_policy();
    policy.protocol = Some(Protocol::Rdp);
    fx.store.insert_policy(policy).await.unwrap();

    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::NoMatchingPolicy));

    let decision = fx
        .engine
        .check_access(ip(CLIENT_IP), ip(PROXY_IP), Protocol::Rdp, None, at(2026, 2, 10, 14, 0))
        .await;
    assert!(decision.granted().is_some());
}

#[tokio::test]
async fn source_ip_pinned_policy_only_matches_that_ip() {
    let fx = Fixture::new().await;

    let other_ip = fx.store.insert_source_ip(fx.user_id, ip("203.0.113.6"), Some("home")).await.unwrap();
    let mut policy = fx.server_policy();
    policy.source_ip_id = Some(other_ip);
    fx.store.insert_policy(policy).await.unwrap();

    // Dialing from the office IP: the pinned policy does not apply.
    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::NoMatchingPolicy));

    // From the pinned IP it does.
    let decision = fx
        .engine
        .check_access(ip("203.0.113.6"), ip(PROXY_IP), Protocol::Ssh, Some("root"), at(2026, 2, 10, 14, 0))
        .await;
    assert!(decision.granted().is_some());
}

#[tokio::test]
async fn grant_policies_are_never_mixed_between_subjects() {
    let fx = Fixture::new().await;

    // Both a direct and a group policy match; only the direct set is used.
    fx.store.insert_policy(fx.server_policy()).await.unwrap();
    let group = fx.store.insert_user_group("ops", None, false).await.unwrap();
    fx.store.add_user_to_group(fx.user_id, group).await.unwrap();
    let mut group_policy = fx.server_policy();
    group_policy.subject = PolicySubject::UserGroup(group);
    fx.store.insert_policy(group_policy).await.unwrap();

    let decision = fx.check(Some("root"), at(2026, 2, 10, 14, 0)).await;
    let access = decision.granted().unwrap();

    let all_direct = access.policies.iter().all(|policy| matches!(policy.subject, PolicySubject::User(_)));
    let all_group = access.policies.iter().all(|policy| matches!(policy.subject, PolicySubject::UserGroup(_)));
    assert!(all_direct || all_group);
    assert!(all_direct, "direct policies take priority");
}

#[tokio::test]
async fn port_forwarding_follows_policy_user_and_group_flags() {
    let fx = Fixture::new().await;
    let now = at(2026, 2, 10, 14, 0);

    // No grant at all: no forwarding.
    assert!(!fx.engine.port_forwarding_allowed(ip(CLIENT_IP), ip(PROXY_IP), Protocol::Ssh, now).await);

    // Grant without any flag: still no forwarding.
    fx.store.insert_policy(fx.server_policy()).await.unwrap();
    assert!(!fx.engine.port_forwarding_allowed(ip(CLIENT_IP), ip(PROXY_IP), Protocol::Ssh, now).await);

    // A policy carrying the flag enables it.
    let mut flagged = fx.server_policy();
    flagged.port_forwarding_allowed = true;
    fx.store.insert_policy(flagged).await.unwrap();
    assert!(fx.engine.port_forwarding_allowed(ip(CLIENT_IP), ip(PROXY_IP), Protocol::Ssh, now).await);
}

#[tokio::test]
async fn port_forwarding_via_group_flag() {
    let fx = Fixture::new().await;
    let now = at(2026, 2, 10, 14, 0);

    fx.store.insert_policy(fx.server_policy()).await.unwrap();

    // Flag sits on a parent group of the user's group.
    let ops = fx.store.insert_user_group("ops", None, true).await.unwrap();
    let ops_eu = fx.store.insert_user_group("ops-eu", Some(ops), false).await.unwrap();
    fx.store.add_user_to_group(fx.user_id, ops_eu).await.unwrap();

    assert!(fx.engine.port_forwarding_allowed(ip(CLIENT_IP), ip(PROXY_IP), Protocol::Ssh, now).await);
}

#[tokio::test]
async fn policies_without_schedules_keep_policy_end() {
    let fx = Fixture::new().await;

    // Two policies: permanent without schedule, bounded with schedule. The
    // effective end is the minimum of the surviving constraints.
    let mut permanent = fx.server_policy();
    permanent.end_time = None;
    fx.store.insert_policy(permanent).await.unwrap();

    let mut scheduled = fx.server_policy();
    scheduled.use_schedules = true;
    let scheduled_id = fx.store.insert_policy(scheduled).await.unwrap();
    fx.store
        .add_schedule_rule(
            scheduled_id,
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

    let decision = fx.check(Some("root"), at(2026, 2, 10, 9, 0)).await;
    let access = decision.granted().unwrap();
    assert_eq!(access.policies.len(), 2);
    // Schedule window end (15:00 UTC) < bounded policy end (Feb 28).
    assert_eq!(access.effective_end, Some(at(2026, 2, 10, 15, 0)));
}
