use std::path::{Path, PathBuf};

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    if let Some(stripped) = path.strip_prefix("~/") {
        return home_dir().join(stripped);
    }
    PathBuf::from(path)
}

pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Per-user data directory for persisted state (saved sessions, instance id).
pub fn user_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| home_dir().join(".local").join("share"))
        .join("funkwerk")
}

/// Root of the claude CLI's on-disk state.
pub fn claude_dir() -> PathBuf {
    home_dir().join(".claude")
}

/// Root of the copilot CLI's on-disk state.
pub fn copilot_dir() -> PathBuf {
    home_dir().join(".copilot")
}

/// Encode an absolute path the way the claude CLI names its per-project
/// transcript directories: `/`, `.` and `_` all collapse to `-`.
pub fn encode_project_dir(path: &Path) -> String {
    path.to_string_lossy().replace(['/', '.', '_'], "-")
}

/// Decode a claude project directory name back into a filesystem path.
///
/// The encoding is lossy (`-Users-john-doe-app` could have been
/// `/Users/john.doe/app` or `/Users/john/doe/app`), so boundaries are
/// resolved against the filesystem: starting from `/`, each directory's real
/// entries are encoded the same way and matched against the upcoming
/// segments, which lets one component absorb several segments (`john.doe`,
/// `.hidden`, `my_app`). The deepest confirmed prefix is kept even when the
/// tail no longer exists on disk; unresolved boundaries decode as `/`.
pub fn decode_project_dir(encoded: &str) -> PathBuf {
    let trimmed = encoded.strip_prefix('-').unwrap_or(encoded);
    if trimmed.is_empty() {
        return PathBuf::from("/");
    }
    let segments: Vec<&str> = trimmed.split('-').collect();

    let mut best = Resolution {
        path: PathBuf::from("/"),
        consumed: 0,
    };
    descend(PathBuf::from("/"), &segments, 0, &mut best);

    let Resolution { mut path, consumed } = best;
    for segment in &segments[consumed..] {
        if !segment.is_empty() {
            path.push(segment);
        }
    }
    path
}

struct Resolution {
    path: PathBuf,
    consumed: usize,
}

fn descend(dir: PathBuf, segments: &[&str], consumed: usize, best: &mut Resolution) {
    if consumed > best.consumed {
        best.path = dir.clone();
        best.consumed = consumed;
    }
    if consumed == segments.len() {
        return;
    }
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let encoded_name = name.replace(['.', '_'], "-");
        let parts: Vec<&str> = encoded_name.split('-').collect();
        let remaining = &segments[consumed..];
        if remaining.len() >= parts.len() && remaining[..parts.len()] == parts[..] {
            descend(entry.path(), segments, consumed + parts.len(), best);
            if best.consumed == segments.len() {
                return;
            }
        }
    }
}
