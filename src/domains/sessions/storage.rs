//! Durable list of saved sessions under `<userData>/sessions.json`.
//! Persistence is best-effort: every failure is logged and swallowed so the
//! supervisor never trips over a bad disk.

use std::fs;
use std::path::PathBuf;

use super::entity::SavedSession;

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> PathBuf {
        crate::shared::paths::user_data_dir().join("sessions.json")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the saved list. A missing or unparseable file reads as empty.
    /// Duplicate ids collapse to the latest occurrence; when that shrank the
    /// list, the cleaned version is written back.
    pub fn load(&self) -> Vec<SavedSession> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        let parsed: Vec<SavedSession> = match serde_json::from_str(&text) {
            Ok(list) => list,
            Err(err) => {
                log::warn!(
                    "Saved sessions file {} is unreadable ({err}); treating as empty",
                    self.path.display()
                );
                return Vec::new();
            }
        };

        let before = parsed.len();
        let deduped = dedup_latest_wins(parsed);
        if deduped.len() < before {
            log::info!(
                "Removed {} duplicate saved session(s) from {}",
                before - deduped.len(),
                self.path.display()
            );
            self.save(&deduped);
        }
        deduped
    }

    /// Full-file rewrite, indented for hand inspection.
    pub fn save(&self, sessions: &[SavedSession]) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                log::warn!(
                    "Failed to create data directory {}: {err}",
                    parent.display()
                );
                return;
            }
        }
        let json = match serde_json::to_string_pretty(sessions) {
            Ok(json) => json,
            Err(err) => {
                log::warn!("Failed to serialize saved sessions: {err}");
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, json) {
            log::warn!(
                "Failed to write saved sessions to {}: {err}",
                self.path.display()
            );
        }
    }

    pub fn add_or_replace(&self, record: SavedSession) {
        let mut sessions = self.load();
        match sessions.iter().position(|s| s.id == record.id) {
            Some(index) => sessions[index] = record,
            None => sessions.push(record),
        }
        self.save(&sessions);
    }

    pub fn remove(&self, id: &str) {
        let mut sessions = self.load();
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() != before {
            self.save(&sessions);
        }
    }

    pub fn update<F>(&self, id: &str, patch: F)
    where
        F: FnOnce(&mut SavedSession),
    {
        let mut sessions = self.load();
        if let Some(record) = sessions.iter_mut().find(|s| s.id == id) {
            patch(record);
            self.save(&sessions);
        }
    }
}

fn dedup_latest_wins(sessions: Vec<SavedSession>) -> Vec<SavedSession> {
    let mut result: Vec<SavedSession> = Vec::with_capacity(sessions.len());
    for session in sessions {
        match result.iter().position(|s| s.id == session.id) {
            Some(index) => result[index] = session,
            None => result.push(session),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::agents::AgentKind;

    fn record(id: &str, name: &str) -> SavedSession {
        SavedSession {
            id: id.to_string(),
            name: name.to_string(),
            kind: AgentKind::Claude,
            working_dir: "/tmp/project".to_string(),
        }
    }

    fn store_in(dir: &std::path::Path) -> SessionStore {
        SessionStore::new(dir.join("data").join("sessions.json"))
    }

    #[test]
    fn load_on_missing_file_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_creates_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&[record("a", "one")]);
        assert!(store.path().exists());
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn duplicate_ids_collapse_to_latest_and_rewrite() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        let raw = serde_json::to_string(&[
            record("a", "old"),
            record("b", "other"),
            record("a", "new"),
        ])
        .unwrap();
        fs::write(store.path(), raw).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "new");

        // The dedup pass rewrote the file; a second load is stable.
        let reloaded = store.load();
        assert_eq!(reloaded, loaded);
    }

    #[test]
    fn save_load_round_trip_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&[record("a", "one"), record("b", "two")]);

        let first = store.load();
        store.save(&first);
        let second = store.load();
        assert_eq!(first, second);
    }

    #[test]
    fn add_or_replace_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        store.add_or_replace(record("a", "one"));
        store.add_or_replace(record("b", "two"));
        store.add_or_replace(record("a", "renamed"));

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "renamed");

        store.remove("a");
        assert_eq!(store.load().len(), 1);
        store.remove("missing");
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn update_patches_a_single_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&[record("a", "one")]);

        store.update("a", |s| s.name = "patched".to_string());
        assert_eq!(store.load()[0].name, "patched");

        // Updating an unknown id leaves the file untouched.
        store.update("zzz", |s| s.name = "nope".to_string());
        assert_eq!(store.load().len(), 1);
    }
}
