//! Auto-discovery of assistant sessions the daemon does not manage yet.
//!
//! Three sources are polled on one ten-second cadence: the claude history
//! log, the claude per-project transcript directories, and the copilot
//! session-state directory. Hits are announced to the frontend; nothing is
//! materialized until it asks.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::service::SessionSupervisor;
use crate::domains::agents::claude::{scan_project_sessions, HistoryLogReader};
use crate::domains::agents::copilot::scan_session_state;
use crate::domains::agents::AgentKind;
use crate::shared::paths::{claude_dir, copilot_dir};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSession {
    pub session_id: String,
    pub kind: AgentKind,
    pub working_dir: String,
    pub name: String,
    pub last_message: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct DiscoveryWatcher {
    supervisor: Arc<SessionSupervisor>,
    claude_root: PathBuf,
    copilot_root: PathBuf,
    history: HistoryLogReader,
    seen_sessions: HashSet<String>,
    claimed_dirs: HashSet<String>,
}

impl DiscoveryWatcher {
    pub fn new(supervisor: Arc<SessionSupervisor>) -> Self {
        Self::with_roots(supervisor, claude_dir(), copilot_dir())
    }

    pub fn with_roots(
        supervisor: Arc<SessionSupervisor>,
        claude_root: PathBuf,
        copilot_root: PathBuf,
    ) -> Self {
        let history = HistoryLogReader::new(claude_root.join("history.jsonl"));
        Self {
            supervisor,
            claude_root,
            copilot_root,
            history,
            seen_sessions: HashSet::new(),
            claimed_dirs: HashSet::new(),
        }
    }

    /// Poll immediately (so pre-existing sessions surface at startup), then
    /// on the fixed interval.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let hits = self.poll_once().await;
                for discovered in hits {
                    self.supervisor.announce_discovered(discovered);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
    }

    /// One polling pass over all three sources, deduplicated. A session id
    /// is reported at most once ever; the first report for a working
    /// directory claims it and later ids for the same directory are
    /// silently absorbed.
    pub async fn poll_once(&mut self) -> Vec<DiscoveredSession> {
        let known_dirs = self.supervisor.known_working_dirs().await;
        let mut hits = Vec::new();

        for candidate in self.collect_candidates() {
            if self.seen_sessions.contains(&candidate.session_id) {
                continue;
            }
            self.seen_sessions.insert(candidate.session_id.clone());

            if known_dirs.contains(&candidate.working_dir) {
                self.claimed_dirs.insert(candidate.working_dir.clone());
                continue;
            }
            if !self.claimed_dirs.insert(candidate.working_dir.clone()) {
                continue;
            }
            hits.push(candidate);
        }
        hits
    }

    fn collect_candidates(&mut self) -> Vec<DiscoveredSession> {
        let mut candidates = Vec::new();

        for entry in self.history.poll() {
            candidates.push(DiscoveredSession {
                name: dir_basename(&entry.project),
                working_dir: entry.project,
                session_id: entry.session_id,
                kind: AgentKind::Claude,
                last_message: if entry.display.is_empty() {
                    None
                } else {
                    Some(entry.display)
                },
                timestamp: entry
                    .timestamp
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            });
        }

        for project in scan_project_sessions(&self.claude_root) {
            let working_dir = project.working_dir.to_string_lossy().into_owned();
            candidates.push(DiscoveredSession {
                name: dir_basename(&working_dir),
                working_dir,
                session_id: project.session_id,
                kind: AgentKind::Claude,
                last_message: None,
                timestamp: None,
            });
        }

        for workspace in scan_session_state(&self.copilot_root) {
            candidates.push(DiscoveredSession {
                name: workspace
                    .summary
                    .clone()
                    .unwrap_or_else(|| dir_basename(&workspace.cwd)),
                working_dir: workspace.cwd,
                session_id: workspace.session_id,
                kind: AgentKind::Copilot,
                last_message: workspace.summary,
                timestamp: workspace.updated_at,
            });
        }

        candidates
    }
}

fn dir_basename(dir: &str) -> String {
    Path::new(dir)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::storage::SessionStore;
    use crate::domains::sessions::CreateSessionParams;
    use std::fs;

    fn watcher_in(tmp: &Path) -> DiscoveryWatcher {
        let supervisor = SessionSupervisor::new(SessionStore::new(tmp.join("sessions.json")));
        DiscoveryWatcher::with_roots(
            supervisor,
            tmp.join(".claude"),
            tmp.join(".copilot"),
        )
    }

    fn write_history_line(claude_root: &Path, session_id: &str, project: &str) {
        fs::create_dir_all(claude_root).unwrap();
        let line = format!(
            "{{\"sessionId\":\"{session_id}\",\"project\":\"{project}\",\"display\":\"doing things\",\"timestamp\":1700000000000}}\n"
        );
        let existing = fs::read_to_string(claude_root.join("history.jsonl")).unwrap_or_default();
        fs::write(claude_root.join("history.jsonl"), existing + &line).unwrap();
    }

    #[tokio::test]
    async fn discovers_history_sessions_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(tmp.path());
        write_history_line(&tmp.path().join(".claude"), "sid-1", "/work/alpha");

        let first = watcher.poll_once().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].session_id, "sid-1");
        assert_eq!(first[0].working_dir, "/work/alpha");
        assert_eq!(first[0].name, "alpha");
        assert_eq!(first[0].kind, AgentKind::Claude);
        assert_eq!(first[0].last_message.as_deref(), Some("doing things"));

        // Same id again: nothing.
        assert!(watcher.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn second_session_for_claimed_directory_is_absorbed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(tmp.path());
        let claude_root = tmp.path().join(".claude");

        write_history_line(&claude_root, "sid-1", "/work/alpha");
        assert_eq!(watcher.poll_once().await.len(), 1);

        write_history_line(&claude_root, "sid-2", "/work/alpha");
        assert!(watcher.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn directories_of_known_sessions_are_not_rediscovered() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor =
            SessionSupervisor::new(SessionStore::new(tmp.path().join("sessions.json")));
        supervisor
            .create(CreateSessionParams {
                kind: AgentKind::Claude,
                working_dir: "/work/alpha".to_string(),
                name: None,
                resume: false,
                id: None,
            })
            .await
            .unwrap();

        let mut watcher = DiscoveryWatcher::with_roots(
            Arc::clone(&supervisor),
            tmp.path().join(".claude"),
            tmp.path().join(".copilot"),
        );
        write_history_line(&tmp.path().join(".claude"), "sid-1", "/work/alpha");

        assert!(watcher.poll_once().await.is_empty());
        supervisor.close_all().await;
    }

    #[tokio::test]
    async fn copilot_workspaces_surface_with_summary_name() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(tmp.path());

        let state_dir = tmp
            .path()
            .join(".copilot")
            .join("session-state")
            .join("5b2e9a10-1234-4abc-9def-aabbccddeeff");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(
            state_dir.join("workspace.yaml"),
            "cwd: /work/beta\nsummary: Wiring the API\nupdated_at: 2026-07-01T10:00:00Z\n",
        )
        .unwrap();

        let hits = watcher.poll_once().await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, AgentKind::Copilot);
        assert_eq!(hits[0].name, "Wiring the API");
        assert_eq!(hits[0].working_dir, "/work/beta");
        assert!(hits[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn project_transcripts_surface_decoded_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(tmp.path());

        let workdir = tmp.path().join("gamma");
        fs::create_dir_all(&workdir).unwrap();
        let encoded = crate::shared::paths::encode_project_dir(&workdir);
        let project_dir = tmp.path().join(".claude").join("projects").join(encoded);
        fs::create_dir_all(&project_dir).unwrap();
        fs::write(
            project_dir.join("0de5c4bc-3c55-4c3a-8f71-0123456789ab.jsonl"),
            "{}",
        )
        .unwrap();

        let hits = watcher.poll_once().await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].working_dir, workdir.to_string_lossy());
        assert_eq!(hits[0].name, "gamma");
    }
}
