//! Per-session grant-expiry monitor.
//!
//! When a shell session has an effective deadline, this worker announces it,
//! warns in-band at T-5m and T-1m, and tears the session down at T by firing
//! the session kill. The monitor is owned by the session bridge; when the
//! session ends first, the bridge drops it and it exits silently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Europe::Warsaw;
use russh::ChannelId;
use russh::server::Handle;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::session::{KillResult, SessionMessageSender};

const RULER: &str = "======================================================================";

/// Warning offsets before the deadline, in descending order.
const WARNINGS: [(i64, &str); 2] = [(300, "5 minutes"), (60, "1 minute")];

pub fn remaining_text(deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (deadline - now).num_seconds().max(0) as f64;
    if seconds < 3600.0 {
        format!("{:.1} minutes", seconds / 60.0)
    } else {
        format!("{:.1} hours", seconds / 3600.0)
    }
}

/// Shown once at shell start when the session has a deadline. The expiry
/// instant is displayed in the jump host's local display zone.
pub fn welcome_message(deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let local = deadline.with_timezone(&Warsaw);
    format!(
        "\r\n{RULER}\r\n  Access Grant Information\r\n  Your access expires at: {}\r\n  Time remaining: {}\r\n  \r\n  You will receive warnings before your access expires.\r\n  Your session will be automatically disconnected at expiry time.\r\n{RULER}\r\n\r\n",
        local.format("%Y-%m-%d %H:%M:%S %Z"),
        remaining_text(deadline, now),
    )
}

pub fn warning_message(remaining: &str, deadline: DateTime<Utc>) -> String {
    format!(
        "\r\n\r\n{RULER}\r\n  *** WARNING: Your access grant expires in {remaining} ***\r\n  Your session will be automatically disconnected at {} UTC\r\n{RULER}\r\n\r\n",
        deadline.format("%Y-%m-%d %H:%M:%S"),
    )
}

pub fn final_message() -> String {
    format!("\r\n\r\n{RULER}\r\n  *** Your access grant has expired ***\r\n  Disconnecting now...\r\n{RULER}\r\n\r\n")
}

/// The instants at which warnings fire, keeping only those still ahead of
/// `now`.
pub fn warning_instants(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, &'static str)> {
    WARNINGS
        .iter()
        .map(|&(seconds, text)| (deadline - Duration::seconds(seconds), text))
        .filter(|&(instant, _)| instant > now)
        .collect()
}

pub struct ExpiryMonitor {
    pub deadline: DateTime<Utc>,
    pub handle: Handle,
    pub channel: ChannelId,
    pub sessions: SessionMessageSender,
    pub session_id: Uuid,
    /// Set right before the kill so the bridge seals the row with
    /// `grant_expired` instead of `normal`.
    pub expired: Arc<AtomicBool>,
    /// Fired by the bridge when the session ends for another reason.
    pub session_gone: Arc<Notify>,
}

impl ExpiryMonitor {
    pub async fn run(self) {
        let ExpiryMonitor {
            deadline,
            handle,
            channel,
            sessions,
            session_id,
            expired,
            session_gone,
        } = self;

        info!(
            session.id = %session_id,
            deadline = %deadline.to_rfc3339(),
            "Grant expiry monitor started"
        );

        for (instant, text) in warning_instants(deadline, Utc::now()) {
            if !sleep_until(instant, &session_gone).await {
                return;
            }

            let message = warning_message(text, deadline);
            if handle.data(channel, message.into_bytes().into()).await.is_err() {
                debug!(session.id = %session_id, "Channel closed before {text} warning");
                return;
            }
            info!(session.id = %session_id, warning = text, "Sent expiry warning");
        }

        if !sleep_until(deadline, &session_gone).await {
            return;
        }

        let _ = handle.data(channel, final_message().into_bytes().into()).await;
        // Leave the final notice a moment to reach the terminal.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        expired.store(true, Ordering::SeqCst);

        match sessions.kill_session(session_id).await {
            Ok(KillResult::Success) => {
                info!(session.id = %session_id, "Session terminated: grant expired");
            }
            Ok(KillResult::NotFound) => {
                debug!(session.id = %session_id, "Session already ended at expiry");
            }
            Err(error) => {
                warn!(session.id = %session_id, error = format!("{error:#}"), "Couldn't kill expired session");
            }
        }
    }
}

/// Sleeps until `instant`; returns false when the session ended first.
async fn sleep_until(instant: DateTime<Utc>, session_gone: &Notify) -> bool {
    let now = Utc::now();
    let Ok(wait) = (instant - now).to_std() else {
        // Already past.
        return true;
    };

    tokio::select! {
        () = tokio::time::sleep(wait) => true,
        () = session_gone.notified() => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, h, m, 0).unwrap()
    }

    #[test]
    fn warnings_fire_at_fixed_offsets() {
        let deadline = at(14, 6);
        let plan = warning_instants(deadline, at(14, 0));
        assert_eq!(plan, vec![(at(14, 1), "5 minutes"), (at(14, 5), "1 minute")]);
    }

    #[test]
    fn past_warnings_are_skipped() {
        let deadline = at(14, 3);
        // Only the 1-minute warning is still ahead.
        let plan = warning_instants(deadline, at(14, 0));
        assert_eq!(plan, vec![(at(14, 2), "1 minute")]);

        assert!(warning_instants(deadline, at(14, 2)).is_empty());
    }

    #[test]
    fn remaining_shows_minutes_under_an_hour() {
        assert_eq!(remaining_text(at(14, 30), at(14, 0)), "30.0 minutes");
        assert_eq!(remaining_text(at(16, 0), at(14, 0)), "2.0 hours");
    }

    #[test]
    fn welcome_message_quotes_local_expiry() {
        // 15:00 UTC in February is 16:00 in Warsaw (CET).
        let message = welcome_message(at(15, 0), at(14, 0));
        assert!(message.contains("2026-02-10 16:00:00 CET"));
        assert!(message.contains("1.0 hours"));
    }

    #[test]
    fn warning_message_quotes_utc_deadline() {
        let message = warning_message("5 minutes", at(15, 0));
        assert!(message.contains("expires in 5 minutes"));
        assert!(message.contains("2026-02-10 15:00:00 UTC"));
    }
}
