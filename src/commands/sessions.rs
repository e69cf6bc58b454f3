//! Session requests from the frontend. Write and resize accept tunnel ids
//! and route to the owning peer; everything else addresses local sessions.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::App;
use crate::domains::agents::claude::list_project_dirs;
use crate::domains::agents::AgentKind;
use crate::domains::sessions::service::CreateSessionParams;
use crate::domains::sessions::Session;
use crate::shared::paths::{claude_dir, expand_home};
use crate::shared::tunnel_id::parse_tunnel_id;

pub async fn create_session(
    app: &App,
    kind: &str,
    working_dir: &str,
    name: Option<String>,
) -> Result<Session, String> {
    let kind = AgentKind::from_str(kind)?;
    app.supervisor
        .create(CreateSessionParams {
            kind,
            working_dir: expand_home(working_dir).to_string_lossy().into_owned(),
            name,
            resume: false,
            id: None,
        })
        .await
}

pub async fn close_session(app: &App, id: &str) -> Result<(), String> {
    app.supervisor.close(id).await
}

pub async fn remove_session(app: &App, id: &str) -> Result<(), String> {
    app.supervisor.remove(id).await
}

pub async fn restart_session(app: &App, id: &str) -> Result<Session, String> {
    app.supervisor.restart(id).await
}

pub async fn rename_session(app: &App, id: &str, name: &str) -> Result<Session, String> {
    app.supervisor.rename(id, name).await
}

pub async fn list_sessions(app: &App) -> Vec<Session> {
    app.supervisor.list().await
}

pub async fn get_session(app: &App, id: &str) -> Option<Session> {
    app.supervisor.get(id).await
}

/// Oneway. Remote-owned ids (`tunnel:…`) route through the peer client.
pub async fn write_session(app: &App, id: &str, data: &[u8]) -> Result<(), String> {
    match parse_tunnel_id(id) {
        Some((instance_id, remote_id)) => {
            app.tunnel
                .write_remote_session(instance_id, remote_id, data)
                .await
        }
        None => app.supervisor.write(id, data).await,
    }
}

/// Oneway. Remote-owned ids (`tunnel:…`) route through the peer client.
pub async fn resize_session(app: &App, id: &str, cols: u16, rows: u16) -> Result<(), String> {
    match parse_tunnel_id(id) {
        Some((instance_id, remote_id)) => {
            app.tunnel
                .resize_remote_session(instance_id, remote_id, cols, rows)
                .await
        }
        None => app.supervisor.resize(id, cols, rows).await,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportableProject {
    pub path: String,
    pub name: String,
}

/// Claude projects with transcripts on disk that no current session covers.
pub async fn get_importable(app: &App) -> Vec<ImportableProject> {
    let known = app.supervisor.known_working_dirs().await;
    list_project_dirs(&claude_dir())
        .into_iter()
        .filter_map(|dir| {
            let path = dir.to_string_lossy().into_owned();
            if known.contains(&path) {
                return None;
            }
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            Some(ImportableProject { path, name })
        })
        .collect()
}

/// Materialize a session for an existing claude project, resuming its most
/// recent conversation.
pub async fn import_project(
    app: &App,
    project: &str,
    name: Option<String>,
) -> Result<Session, String> {
    let working_dir = expand_home(project);
    let name = name.or_else(|| {
        working_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    });
    app.supervisor
        .create(CreateSessionParams {
            kind: AgentKind::Claude,
            working_dir: working_dir.to_string_lossy().into_owned(),
            name,
            resume: true,
            id: None,
        })
        .await
}

#[derive(Debug, Deserialize)]
struct BulkFile {
    sessions: Vec<BulkEntry>,
}

#[derive(Debug, Deserialize)]
struct BulkEntry {
    #[serde(rename = "type")]
    kind: String,
    folder: String,
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub created: usize,
    pub skipped: usize,
}

/// Bulk-load sessions from a JSON file of shape
/// `{"sessions": [{"type", "folder", "name"?}, …]}`. A (kind, folder) pair
/// that already has a session is counted as skipped, not an error.
pub async fn load_sessions_from_file(app: &App, path: &str) -> Result<LoadReport, String> {
    let path = expand_home(path);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let bulk: BulkFile =
        serde_json::from_str(&text).map_err(|e| format!("Invalid sessions file: {e}"))?;

    let mut report = LoadReport {
        created: 0,
        skipped: 0,
    };
    for entry in bulk.sessions {
        let kind = match AgentKind::from_str(&entry.kind) {
            Ok(kind) => kind,
            Err(err) => {
                log::warn!("Skipping bulk entry with {err}");
                report.skipped += 1;
                continue;
            }
        };
        let folder = expand_home(&entry.folder).to_string_lossy().into_owned();
        if app.supervisor.has_session_for(kind, &folder).await {
            report.skipped += 1;
            continue;
        }
        match app
            .supervisor
            .create(CreateSessionParams {
                kind,
                working_dir: folder,
                name: entry.name,
                resume: false,
                id: None,
            })
            .await
        {
            Ok(_) => report.created += 1,
            Err(err) => {
                log::warn!("Bulk create failed: {err}");
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}
