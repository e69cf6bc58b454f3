//! Peer-fabric requests from the frontend. Sessions returned from remote
//! peers cross this boundary with their ids wrapped into tunnel ids.

use std::str::FromStr;

use super::App;
use crate::domains::agents::AgentKind;
use crate::domains::sessions::Session;
use crate::domains::tunnel::manager::TunnelStatus;
use crate::domains::tunnel::PeerHost;
use crate::shared::tunnel_id::{make_tunnel_id, parse_tunnel_id};

pub fn tunnel_status(app: &App) -> TunnelStatus {
    app.tunnel.status()
}

pub async fn get_discovered_hosts(app: &App) -> Vec<PeerHost> {
    app.tunnel.discovered_hosts().await
}

pub async fn get_connected_hosts(app: &App) -> Vec<PeerHost> {
    app.tunnel.connected_hosts().await
}

pub async fn connect_host(app: &App, instance_id: &str) -> Result<(), String> {
    app.tunnel.connect(instance_id).await
}

pub async fn disconnect_host(app: &App, instance_id: &str) -> Result<(), String> {
    app.tunnel.disconnect(instance_id).await
}

pub async fn list_remote_sessions(
    app: &App,
    instance_id: &str,
) -> Result<Vec<Session>, String> {
    let sessions = app.tunnel.list_remote_sessions(instance_id).await?;
    Ok(sessions
        .into_iter()
        .map(|session| tunnel_wrapped(instance_id, session))
        .collect())
}

pub async fn create_remote_session(
    app: &App,
    instance_id: &str,
    kind: &str,
    working_dir: &str,
    name: Option<String>,
) -> Result<Session, String> {
    let kind = AgentKind::from_str(kind)?;
    let session = app
        .tunnel
        .create_remote_session(instance_id, kind, working_dir.to_string(), name)
        .await?;
    Ok(tunnel_wrapped(instance_id, session))
}

pub async fn close_remote_session(
    app: &App,
    instance_id: &str,
    session_id: &str,
) -> Result<(), String> {
    // Accept both the remote-form id and a full tunnel id.
    let remote_id = match parse_tunnel_id(session_id) {
        Some((_, remote_id)) => remote_id,
        None => session_id,
    };
    app.tunnel
        .close_remote_session(instance_id, remote_id)
        .await
}

fn tunnel_wrapped(instance_id: &str, mut session: Session) -> Session {
    session.id = make_tunnel_id(instance_id, &session.id);
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::domains::sessions::{SessionMetadata, SessionStatus};

    #[test]
    fn remote_sessions_gain_tunnel_ids() {
        let session = Session {
            id: "remote-1".to_string(),
            name: "claude-1".to_string(),
            kind: AgentKind::Claude,
            status: SessionStatus::Active,
            metadata: SessionMetadata::default(),
            created_at: Utc::now(),
        };
        let wrapped = tunnel_wrapped("peer-x", session);
        assert_eq!(wrapped.id, "tunnel:peer-x:remote-1");
    }

    #[tokio::test]
    async fn status_reflects_identity_presence() {
        let tmp = tempfile::tempdir().unwrap();
        let app = App::with_store_path(tmp.path().join("sessions.json"));
        // Whether or not the host machine has a git email, the status call
        // answers instead of crashing.
        let status = tunnel_status(&app);
        assert_eq!(status.enabled, status.identity.is_some());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn remote_calls_without_connection_fail_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let app = App::with_store_path(tmp.path().join("sessions.json"));

        assert!(list_remote_sessions(&app, "peer-x").await.is_err());
        assert!(
            create_remote_session(&app, "peer-x", "claude", "/tmp", None)
                .await
                .is_err()
        );
        assert!(close_remote_session(&app, "peer-x", "s1").await.is_err());

        app.shutdown().await;
    }
}
