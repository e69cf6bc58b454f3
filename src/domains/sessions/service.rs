//! The session supervisor: source of truth for all local sessions, owner of
//! every PTY, and the single writer of the persistence file. PTY events are
//! funneled through one dispatcher task so per-session ordering holds.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use super::discovery::DiscoveredSession;
use super::entity::{SavedSession, Session, SessionMetadata, SessionStatus};
use super::storage::SessionStore;
use crate::domains::agents::metadata::extract_metadata;
use crate::domains::agents::AgentKind;
use crate::domains::terminal::{PtyEvent, PtySession, SpawnParams, DEFAULT_COLS, DEFAULT_ROWS};

#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub kind: AgentKind,
    pub working_dir: String,
    pub name: Option<String>,
    pub resume: bool,
    pub id: Option<String>,
}

/// Everything observers can learn about local sessions. Consumed by the IPC
/// pump and by the peer server's broadcaster.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output { id: String, data: Vec<u8> },
    Updated { session: Session },
    Exited { id: String, code: Option<i32> },
    Discovered { discovered: DiscoveredSession },
}

struct ManagedSession {
    record: Session,
    pty: Option<Arc<PtySession>>,
}

pub struct SessionSupervisor {
    sessions: RwLock<HashMap<String, ManagedSession>>,
    counters: Mutex<HashMap<AgentKind, u32>>,
    store: SessionStore,
    events: broadcast::Sender<SessionEvent>,
    pty_tx: mpsc::UnboundedSender<(String, PtyEvent)>,
    shutting_down: AtomicBool,
}

impl SessionSupervisor {
    pub fn new(store: SessionStore) -> Arc<Self> {
        let (events, _) = broadcast::channel(4096);
        let (pty_tx, pty_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            store,
            events,
            pty_tx,
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(Self::run_dispatcher(Arc::clone(&supervisor), pty_rx));
        supervisor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }

    async fn run_dispatcher(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<(String, PtyEvent)>,
    ) {
        while let Some((id, event)) = rx.recv().await {
            match event {
                PtyEvent::Data(bytes) => self.handle_output(id, bytes).await,
                PtyEvent::Exit { code } => self.handle_exit(id, code).await,
            }
        }
    }

    async fn handle_output(&self, id: String, bytes: Vec<u8>) {
        self.emit(SessionEvent::Output {
            id: id.clone(),
            data: bytes.clone(),
        });

        let patch = extract_metadata(&bytes);
        if patch.is_empty() {
            return;
        }

        let updated = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(&id).and_then(|managed| {
                managed
                    .record
                    .metadata
                    .apply_patch(&patch)
                    .then(|| managed.record.clone())
            })
        };
        if let Some(session) = updated {
            self.emit(SessionEvent::Updated { session });
        }
    }

    async fn handle_exit(&self, id: String, code: Option<i32>) {
        let updated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&id) {
                Some(managed) => {
                    managed.pty = None;
                    managed.record.status = SessionStatus::Closed;
                    Some(managed.record.clone())
                }
                None => None,
            }
        };
        let Some(session) = updated else {
            return;
        };
        log::info!("Session {id} exited with code {code:?}");
        self.emit(SessionEvent::Exited {
            id: id.clone(),
            code,
        });
        self.emit(SessionEvent::Updated { session });
    }

    async fn next_default_name(&self, kind: AgentKind) -> String {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(kind).or_insert(0);
        *counter += 1;
        format!("{}-{}", kind.as_str(), counter)
    }

    /// Create a session and spawn its PTY. A supplied id means "restore":
    /// the record is trusted to exist in persistence already and is not
    /// re-written.
    pub async fn create(&self, params: CreateSessionParams) -> Result<Session, String> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err("Supervisor is shutting down".to_string());
        }

        let restoring = params.id.is_some();
        let id = params
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.sessions.read().await.contains_key(&id) {
            return Err(format!("Session {id} already exists"));
        }

        let name = match params.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.next_default_name(params.kind).await,
        };

        let pty = PtySession::spawn(
            SpawnParams {
                id: id.clone(),
                working_dir: params.working_dir.clone(),
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            },
            self.pty_tx.clone(),
        )?;
        pty.schedule_launch(params.kind.launch_command(params.resume))
            .await;

        let session = Session {
            id: id.clone(),
            name,
            kind: params.kind,
            status: SessionStatus::Active,
            metadata: SessionMetadata::for_working_dir(&params.working_dir),
            created_at: Utc::now(),
        };

        if !restoring {
            self.store.add_or_replace(SavedSession::from(&session));
        }

        self.sessions.write().await.insert(
            id,
            ManagedSession {
                record: session.clone(),
                pty: Some(pty),
            },
        );

        self.emit(SessionEvent::Updated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Kill the PTY but keep the record and its persistence entry.
    pub async fn close(&self, id: &str) -> Result<(), String> {
        let (pty, session) = {
            let mut sessions = self.sessions.write().await;
            let managed = sessions
                .get_mut(id)
                .ok_or_else(|| format!("Session {id} not found"))?;
            managed.record.status = SessionStatus::Closed;
            (managed.pty.take(), managed.record.clone())
        };

        if let Some(pty) = pty {
            pty.kill().await;
        }

        self.emit(SessionEvent::Exited {
            id: id.to_string(),
            code: None,
        });
        self.emit(SessionEvent::Updated { session });
        Ok(())
    }

    /// Kill the PTY, drop the record, drop the persistence entry.
    pub async fn remove(&self, id: &str) -> Result<(), String> {
        let managed = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(id)
                .ok_or_else(|| format!("Session {id} not found"))?
        };

        if let Some(pty) = managed.pty {
            pty.kill().await;
        }
        self.store.remove(id);

        self.emit(SessionEvent::Exited {
            id: id.to_string(),
            code: None,
        });
        Ok(())
    }

    /// Respawn the PTY of a closed session in its original working
    /// directory, resuming the assistant's conversation where supported.
    pub async fn restart(&self, id: &str) -> Result<Session, String> {
        let (kind, working_dir) = {
            let sessions = self.sessions.read().await;
            let managed = sessions
                .get(id)
                .ok_or_else(|| format!("Session {id} not found"))?;
            if managed.record.status.is_running() {
                return Err(format!("Session {id} is still running"));
            }
            (
                managed.record.kind,
                managed.record.metadata.working_dir.clone(),
            )
        };

        let pty = PtySession::spawn(
            SpawnParams {
                id: id.to_string(),
                working_dir,
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            },
            self.pty_tx.clone(),
        )?;
        pty.schedule_launch(kind.launch_command(true)).await;

        let session = {
            let mut sessions = self.sessions.write().await;
            let managed = sessions
                .get_mut(id)
                .ok_or_else(|| format!("Session {id} vanished during restart"))?;
            managed.pty = Some(pty);
            managed.record.status = SessionStatus::Active;
            managed.record.clone()
        };

        self.emit(SessionEvent::Updated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Materialize every persisted record with its original id, resuming
    /// each assistant. Failures are logged per-session and never abort the
    /// pass.
    pub async fn restore_sessions(&self) {
        for saved in self.store.load() {
            let params = CreateSessionParams {
                kind: saved.kind,
                working_dir: saved.working_dir,
                name: Some(saved.name),
                resume: true,
                id: Some(saved.id.clone()),
            };
            if let Err(err) = self.create(params).await {
                log::warn!("Failed to restore session {}: {err}", saved.id);
            }
        }
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<Session, String> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let managed = sessions
                .get_mut(id)
                .ok_or_else(|| format!("Session {id} not found"))?;
            managed.record.name = name.to_string();
            managed.record.clone()
        };
        let new_name = name.to_string();
        self.store.update(id, move |s| s.name = new_name);
        self.emit(SessionEvent::Updated {
            session: session.clone(),
        });
        Ok(session)
    }

    async fn pty_of(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .and_then(|managed| managed.pty.clone())
    }

    /// No-op when the PTY is not running.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), String> {
        match self.pty_of(id).await {
            Some(pty) => pty.write(data).await,
            None => Ok(()),
        }
    }

    /// No-op when the PTY is not running.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), String> {
        match self.pty_of(id).await {
            Some(pty) => pty.resize(cols, rows).await,
            None => Ok(()),
        }
    }

    pub async fn list(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<Session> = sessions.values().map(|m| m.record.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|m| m.record.clone())
    }

    /// Working directories already represented by a session of any status;
    /// the watcher uses this to suppress re-discovery.
    pub async fn known_working_dirs(&self) -> HashSet<String> {
        self.sessions
            .read()
            .await
            .values()
            .map(|m| m.record.metadata.working_dir.clone())
            .collect()
    }

    pub async fn has_session_for(&self, kind: AgentKind, working_dir: &str) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|m| m.record.kind == kind && m.record.metadata.working_dir == working_dir)
    }

    /// Announce a watcher hit to the frontend. Discovered sessions are never
    /// materialized here; creation stays an explicit request.
    pub fn announce_discovered(&self, discovered: DiscoveredSession) {
        self.emit(SessionEvent::Discovered { discovered });
    }

    /// Kill everything for shutdown. The flag flips first so no event can
    /// race into a torn-down IPC channel.
    pub async fn close_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ptys: Vec<Arc<PtySession>> = {
            let mut sessions = self.sessions.write().await;
            sessions
                .values_mut()
                .filter_map(|managed| {
                    managed.record.status = SessionStatus::Closed;
                    managed.pty.take()
                })
                .collect()
        };
        for pty in ptys {
            pty.kill().await;
        }
        log::info!("All sessions closed");
    }
}
