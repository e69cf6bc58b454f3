//! Discovery sources backed by the claude CLI's on-disk state: the
//! append-only history log and the per-project transcript directories.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::shared::paths::decode_project_dir;

static CANONICAL_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("uuid regex")
});

pub fn is_canonical_uuid(s: &str) -> bool {
    CANONICAL_UUID.is_match(s)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryLogEntry {
    pub session_id: String,
    pub project: String,
    pub display: String,
    pub timestamp: Option<i64>,
}

/// Incremental reader over `~/.claude/history.jsonl`.
///
/// A size+mtime snapshot decides whether anything new arrived; only the
/// suffix past the previous offset is read. A shrinking file means the log
/// was truncated or rotated: the offset resets and the cycle is skipped so
/// the next poll starts clean.
#[derive(Debug)]
pub struct HistoryLogReader {
    path: PathBuf,
    offset: u64,
    last_mtime: Option<SystemTime>,
}

impl HistoryLogReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            last_mtime: None,
        }
    }

    pub fn poll(&mut self) -> Vec<HistoryLogEntry> {
        let metadata = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(_) => return Vec::new(),
        };
        let size = metadata.len();
        let mtime = metadata.modified().ok();

        if size < self.offset {
            log::debug!(
                "History log {} shrank ({} -> {size}); resetting offset",
                self.path.display(),
                self.offset
            );
            self.offset = 0;
            self.last_mtime = mtime;
            return Vec::new();
        }

        if size == self.offset && mtime == self.last_mtime {
            return Vec::new();
        }

        let mut file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                log::debug!("Failed to open history log {}: {err}", self.path.display());
                return Vec::new();
            }
        };

        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }

        let mut suffix = String::new();
        if let Err(err) = file.read_to_string(&mut suffix) {
            log::debug!("Failed to read history log {}: {err}", self.path.display());
            return Vec::new();
        }

        self.offset = size;
        self.last_mtime = mtime;

        suffix.lines().filter_map(parse_history_line).collect()
    }
}

fn parse_history_line(line: &str) -> Option<HistoryLogEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            log::debug!("Skipping unparseable history line: {err}");
            return None;
        }
    };
    let session_id = value.get("sessionId").and_then(|v| v.as_str())?.to_string();
    let project = value.get("project").and_then(|v| v.as_str())?.to_string();
    let display = value
        .get("display")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let timestamp = value.get("timestamp").and_then(|v| v.as_i64());
    Some(HistoryLogEntry {
        session_id,
        project,
        display,
        timestamp,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSession {
    pub session_id: String,
    pub working_dir: PathBuf,
}

/// Scan `<claude-dir>/projects/<encoded>/<sessionId>.jsonl` for transcript
/// files. Directory names decode back to working directories; file stems
/// outside the canonical UUID shape are ignored.
pub fn scan_project_sessions(claude_dir: &Path) -> Vec<ProjectSession> {
    let projects_dir = claude_dir.join("projects");
    let entries = match fs::read_dir(&projects_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let dir_path = entry.path();
        if !dir_path.is_dir() {
            continue;
        }
        let Some(encoded) = dir_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let working_dir = decode_project_dir(encoded);

        let files = match fs::read_dir(&dir_path) {
            Ok(files) => files,
            Err(_) => continue,
        };
        for file in files.flatten() {
            let file_path = file.path();
            if file_path.extension().map(|ext| ext != "jsonl").unwrap_or(true) {
                continue;
            }
            let Some(stem) = file_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_canonical_uuid(stem) {
                continue;
            }
            sessions.push(ProjectSession {
                session_id: stem.to_string(),
                working_dir: working_dir.clone(),
            });
        }
    }
    sessions
}

/// Enumerate decoded project directories, for the import picker.
pub fn list_project_dirs(claude_dir: &Path) -> Vec<PathBuf> {
    let projects_dir = claude_dir.join("projects");
    let entries = match fs::read_dir(&projects_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(encoded) = entry.file_name().to_str() {
            dirs.push(decode_project_dir(encoded));
        }
    }
    dirs.sort();
    dirs.dedup();
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn uuid_filter_accepts_only_canonical_form() {
        assert!(is_canonical_uuid("0de5c4bc-3c55-4c3a-8f71-0123456789ab"));
        assert!(!is_canonical_uuid("0DE5C4BC-3C55-4C3A-8F71-0123456789AB"));
        assert!(!is_canonical_uuid("not-a-uuid"));
        assert!(!is_canonical_uuid(""));
    }

    #[test]
    fn history_reader_reads_only_the_delta_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("history.jsonl");
        let mut file = fs::File::create(&log_path).unwrap();
        writeln!(
            file,
            r#"{{"sessionId":"s1","project":"/p/one","display":"first","timestamp":100}}"#
        )
        .unwrap();
        file.sync_all().unwrap();

        let mut reader = HistoryLogReader::new(log_path.clone());
        let first = reader.poll();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].session_id, "s1");
        assert_eq!(first[0].project, "/p/one");

        // Nothing new: no entries.
        assert!(reader.poll().is_empty());

        let mut file = fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        writeln!(
            file,
            r#"{{"sessionId":"s2","project":"/p/two","display":"second","timestamp":200}}"#
        )
        .unwrap();
        file.sync_all().unwrap();

        let second = reader.poll();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].session_id, "s2");
    }

    #[test]
    fn history_reader_resets_on_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("history.jsonl");
        fs::write(
            &log_path,
            r#"{"sessionId":"s1","project":"/p","display":"x","timestamp":1}"#.to_string() + "\n",
        )
        .unwrap();

        let mut reader = HistoryLogReader::new(log_path.clone());
        assert_eq!(reader.poll().len(), 1);

        // Truncate below the previous offset: the cycle is skipped entirely.
        fs::write(&log_path, "").unwrap();
        assert!(reader.poll().is_empty());

        fs::write(
            &log_path,
            r#"{"sessionId":"s3","project":"/q","display":"y","timestamp":2}"#.to_string() + "\n",
        )
        .unwrap();
        let after = reader.poll();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].session_id, "s3");
    }

    #[test]
    fn malformed_history_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("history.jsonl");
        fs::write(
            &log_path,
            "not json\n{\"sessionId\":\"ok\",\"project\":\"/p\",\"display\":\"d\"}\n{}\n",
        )
        .unwrap();

        let mut reader = HistoryLogReader::new(log_path);
        let entries = reader.poll();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "ok");
        assert_eq!(entries[0].timestamp, None);
    }

    #[test]
    fn project_scan_filters_non_uuid_transcripts() {
        let tmp = tempfile::tempdir().unwrap();
        let claude_dir = tmp.path().join(".claude");
        let workdir = tmp.path().join("repo");
        fs::create_dir_all(&workdir).unwrap();

        let encoded = crate::shared::paths::encode_project_dir(&workdir);
        let project_dir = claude_dir.join("projects").join(encoded);
        fs::create_dir_all(&project_dir).unwrap();

        fs::write(
            project_dir.join("0de5c4bc-3c55-4c3a-8f71-0123456789ab.jsonl"),
            "{}",
        )
        .unwrap();
        fs::write(project_dir.join("summary.jsonl"), "{}").unwrap();
        fs::write(project_dir.join("notes.txt"), "").unwrap();

        let sessions = scan_project_sessions(&claude_dir);
        assert_eq!(sessions.len(), 1);
        assert_eq!(
            sessions[0].session_id,
            "0de5c4bc-3c55-4c3a-8f71-0123456789ab"
        );
        assert_eq!(sessions[0].working_dir, workdir);
    }

    #[test]
    fn missing_projects_dir_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(scan_project_sessions(&tmp.path().join(".claude")).is_empty());
        assert!(list_project_dirs(&tmp.path().join(".claude")).is_empty());
    }
}
