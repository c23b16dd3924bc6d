//! Durable transcript of an interactive SSH session.
//!
//! The whole JSON document is rewritten after every event, so a reader that
//! parses the file mid-session always sees a valid document. Recording
//! failures are logged and swallowed: a session never fails because its
//! transcript cannot be written.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

const MAX_EVENT_PAYLOAD: usize = 1000;
const TRUNCATION_MARKER: &str = "... [truncated]";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    ClientToServer,
    ServerToClient,
    SessionEnd,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: String,
    pub username: String,
    pub server_ip: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub events: Vec<TranscriptEvent>,
}

/// Single-writer transcript recorder; owned by the session's relay worker.
pub struct SessionRecorder {
    path: Utf8PathBuf,
    document: Transcript,
    started_at: DateTime<Utc>,
    event_count: usize,
}

fn iso(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Single-character keystrokes are echoed back by the server, so the
/// transcript drops them and keeps the echo.
pub fn is_suppressed_keystroke(data: &[u8]) -> bool {
    data.len() < 2 && !data.contains(&b'\r') && !data.contains(&b'\n')
}

impl SessionRecorder {
    /// Creates the transcript file eagerly so a crash right after session
    /// start still leaves a parseable document behind.
    pub async fn create(
        directory: &Utf8Path,
        session_id: &str,
        username: &str,
        server_ip: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(directory).await?;

        let file_name = format!(
            "{}_{}_{}_{}.log",
            now.format("%Y%m%d_%H%M%S"),
            username,
            server_ip.replace(['.', ':'], "_"),
            session_id,
        );
        let path = directory.join(file_name);

        let recorder = Self {
            path,
            document: Transcript {
                session_id: session_id.to_owned(),
                username: username.to_owned(),
                server_ip: server_ip.to_owned(),
                start_time: iso(now),
                end_time: None,
                duration_seconds: None,
                events: Vec::new(),
            },
            started_at: now,
            event_count: 0,
        };
        recorder.flush().await?;

        info!(path = %recorder.path, "Recording session transcript");
        Ok(recorder)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Appends one event and rewrites the document. Errors are swallowed.
    pub async fn record(&mut self, kind: EventKind, data: &str, now: DateTime<Utc>) {
        let data = if data.len() > MAX_EVENT_PAYLOAD {
            let mut cut = MAX_EVENT_PAYLOAD;
            while !data.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}{TRUNCATION_MARKER}", &data[..cut])
        } else {
            data.to_owned()
        };

        self.document.events.push(TranscriptEvent {
            timestamp: iso(now),
            kind,
            data,
        });
        self.event_count += 1;

        if let Err(error) = self.flush().await {
            error!(error = format!("{error:#}"), path = %self.path, "Failed to write transcript event");
        }
    }

    /// Seals the transcript and returns its size in bytes, when known.
    pub async fn finalize(mut self, now: DateTime<Utc>) -> Option<u64> {
        self.document.end_time = Some(iso(now));
        self.document.duration_seconds = Some((now - self.started_at).as_seconds_f64());

        if let Err(error) = self.flush().await {
            error!(error = format!("{error:#}"), path = %self.path, "Failed to finalize transcript");
            return None;
        }

        debug!(path = %self.path, events = self.event_count, "Transcript sealed");
        tokio::fs::metadata(&self.path).await.ok().map(|meta| meta.len())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(&self.document)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 14, 0, secs).unwrap()
    }

    async fn recorder(dir: &tempfile::TempDir) -> SessionRecorder {
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        SessionRecorder::create(dir, "s-1", "bob", "10.0.0.4", at(0)).await.unwrap()
    }

    #[tokio::test]
    async fn file_is_valid_json_mid_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(&dir).await;

        rec.record(EventKind::SessionStart, "bob connecting to 10.0.0.4", at(0)).await;
        rec.record(EventKind::ServerToClient, "login banner", at(1)).await;

        let parsed: Transcript = serde_json::from_slice(&std::fs::read(rec.path()).unwrap()).unwrap();
        assert_eq!(parsed.events.len(), 2);
        assert!(parsed.end_time.is_none());
        assert_eq!(parsed.events[1].kind, EventKind::ServerToClient);
    }

    #[tokio::test]
    async fn finalize_sets_end_time_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(&dir).await;
        rec.record(EventKind::SessionStart, "start", at(0)).await;

        let path = rec.path().to_owned();
        let size = rec.finalize(at(42)).await;
        assert!(size.is_some());

        let parsed: Transcript = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert!(parsed.end_time.is_some());
        assert_eq!(parsed.duration_seconds, Some(42.0));
    }

    #[tokio::test]
    async fn long_payloads_are_truncated_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(&dir).await;

        let payload = "x".repeat(5000);
        rec.record(EventKind::ServerToClient, &payload, at(1)).await;

        let parsed: Transcript = serde_json::from_slice(&std::fs::read(rec.path()).unwrap()).unwrap();
        let data = &parsed.events[0].data;
        assert!(data.ends_with(TRUNCATION_MARKER));
        assert_eq!(data.len(), MAX_EVENT_PAYLOAD + TRUNCATION_MARKER.len());
    }

    #[test]
    fn keystroke_suppression() {
        assert!(is_suppressed_keystroke(b"a"));
        assert!(is_suppressed_keystroke(b""));
        assert!(!is_suppressed_keystroke(b"\r"));
        assert!(!is_suppressed_keystroke(b"\n"));
        assert!(!is_suppressed_keystroke(b"ls"));
    }
}
