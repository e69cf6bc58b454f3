//! Discovery source backed by the copilot CLI's session-state directory:
//! `<copilot-dir>/session-state/<uuid>/workspace.yaml`, a flat `key: value`
//! text file.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::claude::is_canonical_uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct CopilotWorkspace {
    pub session_id: String,
    pub cwd: String,
    pub summary: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Scan the session-state directory for workspaces. Entries without a `cwd`
/// are unusable and skipped.
pub fn scan_session_state(copilot_dir: &Path) -> Vec<CopilotWorkspace> {
    let state_dir = copilot_dir.join("session-state");
    let entries = match fs::read_dir(&state_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut workspaces = Vec::new();
    for entry in entries.flatten() {
        let dir_path = entry.path();
        if !dir_path.is_dir() {
            continue;
        }
        let Some(session_id) = dir_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_canonical_uuid(session_id) {
            continue;
        }

        let workspace_file = dir_path.join("workspace.yaml");
        let text = match fs::read_to_string(&workspace_file) {
            Ok(text) => text,
            Err(_) => continue,
        };
        let fields = parse_flat_yaml(&text);
        let Some(cwd) = fields.get("cwd").filter(|v| !v.is_empty()) else {
            log::debug!(
                "Copilot workspace {} has no cwd; skipping",
                workspace_file.display()
            );
            continue;
        };

        workspaces.push(CopilotWorkspace {
            session_id: session_id.to_string(),
            cwd: cwd.clone(),
            summary: fields.get("summary").filter(|v| !v.is_empty()).cloned(),
            updated_at: fields
                .get("updated_at")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        });
    }
    workspaces
}

/// Parse flat `key: value` lines. Quoted values are unquoted; nested
/// structures are not expected and not supported.
fn parse_flat_yaml(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        fields.insert(key.trim().to_string(), value.to_string());
    }
    fields
}
