//! The IPC surface: request handlers plus the pump that turns internal
//! event streams into the frontend event channel. This layer is the single
//! place remote session ids gain their `tunnel:` prefix.

use std::path::PathBuf;
use std::sync::Arc;

use crate::domains::sessions::discovery::DiscoveryWatcher;
use crate::domains::sessions::service::{SessionEvent, SessionSupervisor};
use crate::domains::sessions::storage::SessionStore;
use crate::domains::terminal::Utf8Stream;
use crate::domains::tunnel::{TunnelEvent, TunnelManager};
use crate::infrastructure::events::{emit_event, EventBus, FunkEvent};
use crate::shared::tunnel_id::make_tunnel_id;

pub mod sessions;
pub mod tunnel;

pub struct App {
    pub supervisor: Arc<SessionSupervisor>,
    pub tunnel: Arc<TunnelManager>,
    pub events: EventBus,
}

impl App {
    pub fn new() -> Arc<Self> {
        Self::with_store_path(SessionStore::default_path())
    }

    pub fn with_store_path(store_path: PathBuf) -> Arc<Self> {
        let supervisor = SessionSupervisor::new(SessionStore::new(store_path));
        let tunnel = TunnelManager::new(Arc::clone(&supervisor));
        let app = Arc::new(Self {
            supervisor,
            tunnel,
            events: EventBus::new(),
        });
        tokio::spawn(pump_supervisor_events(Arc::clone(&app)));
        tokio::spawn(pump_tunnel_events(Arc::clone(&app)));
        app
    }

    /// Full startup: restore persisted sessions, bring up the peer fabric,
    /// start watching for unmanaged assistant sessions.
    pub async fn bootstrap() -> Arc<Self> {
        let app = Self::new();
        app.supervisor.restore_sessions().await;
        if let Err(err) = app.tunnel.start().await {
            log::error!("Peer fabric failed to start: {err}");
        }
        DiscoveryWatcher::new(Arc::clone(&app.supervisor)).spawn();
        app
    }

    pub async fn shutdown(&self) {
        self.supervisor.close_all().await;
        self.tunnel.shutdown().await;
    }
}

async fn pump_supervisor_events(app: Arc<App>) {
    let mut rx = app.supervisor.subscribe();
    // Chunk boundaries can split multibyte sequences; one decoder per
    // session reassembles them before the text leaves the process.
    let mut decoders: std::collections::HashMap<String, Utf8Stream> =
        std::collections::HashMap::new();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("IPC event pump lagged by {skipped} event(s)");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let result = match event {
            SessionEvent::Output { id, data } => {
                let text = decoders
                    .entry(id.clone())
                    .or_insert_with(Utf8Stream::new)
                    .decode_chunk(&data);
                emit_event(
                    &app.events,
                    FunkEvent::SessionOutput,
                    &serde_json::json!({ "id": id, "data": text }),
                )
            }
            SessionEvent::Updated { session } => {
                emit_event(&app.events, FunkEvent::SessionUpdate, &session)
            }
            SessionEvent::Exited { id, code } => {
                decoders.remove(&id);
                emit_event(
                    &app.events,
                    FunkEvent::SessionExit,
                    &serde_json::json!({ "id": id, "code": code }),
                )
            }
            SessionEvent::Discovered { discovered } => {
                emit_event(&app.events, FunkEvent::SessionDiscovered, &discovered)
            }
        };
        if let Err(err) = result {
            log::warn!("Failed to emit IPC event: {err}");
        }
    }
}

async fn pump_tunnel_events(app: Arc<App>) {
    let mut rx = app.tunnel.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Tunnel event pump lagged by {skipped} event(s)");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let result = match event {
            TunnelEvent::HostFound { host } => {
                emit_event(&app.events, FunkEvent::TunnelHostFound, &host)
            }
            TunnelEvent::HostLost { instance_id } => emit_event(
                &app.events,
                FunkEvent::TunnelHostLost,
                &serde_json::json!({ "instanceId": instance_id }),
            ),
            TunnelEvent::Connected { instance_id } => emit_event(
                &app.events,
                FunkEvent::TunnelConnected,
                &serde_json::json!({ "instanceId": instance_id }),
            ),
            TunnelEvent::Disconnected { instance_id } => emit_event(
                &app.events,
                FunkEvent::TunnelDisconnected,
                &serde_json::json!({ "instanceId": instance_id }),
            ),
            TunnelEvent::RemoteOutput {
                instance_id,
                id,
                data,
            } => emit_event(
                &app.events,
                FunkEvent::SessionOutput,
                &serde_json::json!({
                    "id": make_tunnel_id(&instance_id, &id),
                    "data": data,
                }),
            ),
            TunnelEvent::RemoteUpdate {
                instance_id,
                mut session,
            } => {
                session.id = make_tunnel_id(&instance_id, &session.id);
                emit_event(&app.events, FunkEvent::SessionUpdate, &session)
            }
            TunnelEvent::RemoteExit {
                instance_id,
                id,
                code,
            } => emit_event(
                &app.events,
                FunkEvent::SessionExit,
                &serde_json::json!({
                    "id": make_tunnel_id(&instance_id, &id),
                    "code": code,
                }),
            ),
        };
        if let Err(err) = result {
            log::warn!("Failed to emit tunnel IPC event: {err}");
        }
    }
}
