//! Orchestrates the peer fabric: owns the host table (the only writer), the
//! server, the discovery channels, and one client per connected peer. The
//! supervisor is a pure dependency; it never learns the manager exists.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::client::{ClientEvent, PeerClient};
use super::discovery::{PeerDiscovery, PeerSighting, HOST_TIMEOUT};
use super::identity::{resolve_identity, Identity};
use super::server::PeerServer;
use super::{HostStatus, PeerHost};
use crate::domains::agents::AgentKind;
use crate::domains::sessions::service::SessionSupervisor;
use crate::domains::sessions::Session;
use crate::shared::paths::user_data_dir;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Events the manager surfaces to the IPC layer. Remote session ids are
/// still in their remote form here; the IPC pump applies the tunnel-id
/// transform.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    HostFound { host: PeerHost },
    HostLost { instance_id: String },
    Connected { instance_id: String },
    Disconnected { instance_id: String },
    RemoteOutput {
        instance_id: String,
        id: String,
        data: String,
    },
    RemoteUpdate {
        instance_id: String,
        session: Session,
    },
    RemoteExit {
        instance_id: String,
        id: String,
        code: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub enabled: bool,
    pub identity: Option<Identity>,
}

struct TrackedHost {
    descriptor: PeerHost,
    last_seen: Instant,
}

pub struct TunnelManager {
    identity: Option<Identity>,
    supervisor: Arc<SessionSupervisor>,
    hosts: RwLock<HashMap<String, TrackedHost>>,
    clients: RwLock<HashMap<String, Arc<PeerClient>>>,
    events: broadcast::Sender<TunnelEvent>,
    server: Mutex<Option<PeerServer>>,
    discovery: Mutex<Option<PeerDiscovery>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelManager {
    pub fn new(supervisor: Arc<SessionSupervisor>) -> Arc<Self> {
        let identity = resolve_identity(&user_data_dir());
        if identity.is_none() {
            log::info!("No git user.email configured; peer fabric disabled");
        }
        Self::with_identity(supervisor, identity)
    }

    pub fn with_identity(
        supervisor: Arc<SessionSupervisor>,
        identity: Option<Identity>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(4096);
        Arc::new(Self {
            identity,
            supervisor,
            hosts: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            events,
            server: Mutex::new(None),
            discovery: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            enabled: self.identity.is_some(),
            identity: self.identity.clone(),
        }
    }

    /// Bring up server, discovery, and the staleness sweep. A missing
    /// identity leaves the whole fabric off without error.
    pub async fn start(self: &Arc<Self>) -> Result<(), String> {
        let Some(identity) = self.identity.clone() else {
            return Ok(());
        };

        let (sightings_tx, sightings_rx) = mpsc::unbounded_channel();
        let mut server = PeerServer::start(
            identity.clone(),
            Arc::clone(&self.supervisor),
            sightings_tx,
        )
        .await?;
        server.start_broadcasting(&self.supervisor);
        let server_port = server.port();
        *self.server.lock().await = Some(server);

        let (discovery, discovery_rx) = PeerDiscovery::start(identity, server_port).await;
        *self.discovery.lock().await = Some(discovery);

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).consume_sightings(discovery_rx)));
        tasks.push(tokio::spawn(Arc::clone(self).consume_sightings(sightings_rx)));
        tasks.push(tokio::spawn(Arc::clone(self).sweep_stale_hosts()));
        Ok(())
    }

    async fn consume_sightings(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PeerSighting>,
    ) {
        while let Some(sighting) = rx.recv().await {
            self.upsert_sighting(sighting).await;
        }
    }

    /// Register or refresh a host. Transport-owned states (connecting,
    /// connected) are never downgraded by discovery traffic.
    async fn upsert_sighting(&self, sighting: PeerSighting) {
        let mut hosts = self.hosts.write().await;
        let now = Instant::now();
        if let Some(tracked) = hosts.get_mut(&sighting.instance_id) {
            tracked.last_seen = now;
            tracked.descriptor.hostname = sighting.hostname;
            if sighting.port != 0 {
                tracked.descriptor.address = sighting.address.to_string();
                tracked.descriptor.port = sighting.port;
            }
            return;
        }

        let descriptor = PeerHost {
            instance_id: sighting.instance_id.clone(),
            hostname: sighting.hostname,
            identity_hash: sighting.identity_hash,
            address: sighting.address.to_string(),
            port: sighting.port,
            status: HostStatus::Discovered,
        };
        hosts.insert(
            sighting.instance_id,
            TrackedHost {
                descriptor: descriptor.clone(),
                last_seen: now,
            },
        );
        drop(hosts);
        log::info!(
            "Discovered peer {} at {}:{}",
            descriptor.instance_id,
            descriptor.address,
            descriptor.port
        );
        let _ = self.events.send(TunnelEvent::HostFound { host: descriptor });
    }

    /// Drop hosts whose beacons stopped. Hosts the transport owns survive
    /// until the connection itself reports loss.
    async fn sweep_stale_hosts(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let mut lost = Vec::new();
            {
                let mut hosts = self.hosts.write().await;
                hosts.retain(|instance_id, tracked| {
                    let pinned = matches!(
                        tracked.descriptor.status,
                        HostStatus::Connecting | HostStatus::Connected
                    );
                    let fresh = tracked.last_seen.elapsed() < HOST_TIMEOUT;
                    if pinned || fresh {
                        true
                    } else {
                        lost.push(instance_id.clone());
                        false
                    }
                });
            }
            for instance_id in lost {
                log::info!("Peer {instance_id} timed out");
                self.teardown_client(&instance_id).await;
                let _ = self.events.send(TunnelEvent::HostLost {
                    instance_id,
                });
            }
        }
    }

    pub async fn discovered_hosts(&self) -> Vec<PeerHost> {
        let hosts = self.hosts.read().await;
        let mut list: Vec<PeerHost> = hosts.values().map(|t| t.descriptor.clone()).collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    pub async fn connected_hosts(&self) -> Vec<PeerHost> {
        self.discovered_hosts()
            .await
            .into_iter()
            .filter(|h| h.status == HostStatus::Connected)
            .collect()
    }

    async fn set_host_status(&self, instance_id: &str, status: HostStatus) {
        if let Some(tracked) = self.hosts.write().await.get_mut(instance_id) {
            tracked.descriptor.status = status;
            tracked.last_seen = Instant::now();
        }
    }

    /// Dial a discovered host. On failure the host reverts to plain
    /// `discovered` so the frontend can retry.
    pub async fn connect(self: &Arc<Self>, instance_id: &str) -> Result<(), String> {
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| "Peer fabric is not enabled".to_string())?;

        let (address, port) = {
            let hosts = self.hosts.read().await;
            let tracked = hosts
                .get(instance_id)
                .ok_or_else(|| format!("Unknown host {instance_id}"))?;
            if tracked.descriptor.status == HostStatus::Connected {
                return Err(format!("Already connected to {instance_id}"));
            }
            if tracked.descriptor.port == 0 {
                return Err(format!("No dialable address for {instance_id}"));
            }
            (
                tracked.descriptor.address.clone(),
                tracked.descriptor.port,
            )
        };

        self.set_host_status(instance_id, HostStatus::Connecting).await;

        let client = match PeerClient::connect(address, port, identity).await {
            Ok(client) => client,
            Err(err) => {
                self.set_host_status(instance_id, HostStatus::Discovered).await;
                return Err(err);
            }
        };

        let events = client.subscribe();
        self.clients
            .write()
            .await
            .insert(instance_id.to_string(), Arc::clone(&client));
        self.set_host_status(instance_id, HostStatus::Connected).await;
        let _ = self.events.send(TunnelEvent::Connected {
            instance_id: instance_id.to_string(),
        });

        let manager = Arc::clone(self);
        let owner = instance_id.to_string();
        self.tasks
            .lock()
            .await
            .push(tokio::spawn(manager.forward_client_events(owner, events)));
        Ok(())
    }

    /// Mirror one client's event stream onto the manager bus until the
    /// client gives up for good.
    async fn forward_client_events(
        self: Arc<Self>,
        instance_id: String,
        mut events: broadcast::Receiver<ClientEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Client {instance_id} event stream lagged by {skipped}");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                ClientEvent::SessionOutput { id, data } => {
                    let _ = self.events.send(TunnelEvent::RemoteOutput {
                        instance_id: instance_id.clone(),
                        id,
                        data,
                    });
                }
                ClientEvent::SessionUpdate { session } => {
                    let _ = self.events.send(TunnelEvent::RemoteUpdate {
                        instance_id: instance_id.clone(),
                        session,
                    });
                }
                ClientEvent::SessionExit { id, code } => {
                    let _ = self.events.send(TunnelEvent::RemoteExit {
                        instance_id: instance_id.clone(),
                        id,
                        code,
                    });
                }
                ClientEvent::Reconnected => {
                    self.set_host_status(&instance_id, HostStatus::Connected).await;
                    let _ = self.events.send(TunnelEvent::Connected {
                        instance_id: instance_id.clone(),
                    });
                }
                ClientEvent::Disconnected => {
                    let gone = {
                        let clients = self.clients.read().await;
                        clients
                            .get(&instance_id)
                            .map(|c| !c.will_reconnect())
                            .unwrap_or(true)
                    };
                    if gone {
                        self.clients.write().await.remove(&instance_id);
                        self.set_host_status(&instance_id, HostStatus::Disconnected)
                            .await;
                        let _ = self.events.send(TunnelEvent::Disconnected {
                            instance_id: instance_id.clone(),
                        });
                        break;
                    }
                }
                ClientEvent::Connected | ClientEvent::AuthDenied { .. } => {}
            }
        }
    }

    async fn teardown_client(&self, instance_id: &str) {
        let client = self.clients.write().await.remove(instance_id);
        if let Some(client) = client {
            client.disconnect().await;
            let _ = self.events.send(TunnelEvent::Disconnected {
                instance_id: instance_id.to_string(),
            });
        }
    }

    pub async fn disconnect(&self, instance_id: &str) -> Result<(), String> {
        let had_client = self.clients.read().await.contains_key(instance_id);
        if !had_client {
            return Err(format!("Not connected to {instance_id}"));
        }
        self.teardown_client(instance_id).await;
        self.set_host_status(instance_id, HostStatus::Disconnected).await;
        Ok(())
    }

    async fn client_for(&self, instance_id: &str) -> Result<Arc<PeerClient>, String> {
        self.clients
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| format!("Not connected to {instance_id}"))
    }

    pub async fn list_remote_sessions(&self, instance_id: &str) -> Result<Vec<Session>, String> {
        self.client_for(instance_id).await?.list_sessions().await
    }

    pub async fn create_remote_session(
        &self,
        instance_id: &str,
        kind: AgentKind,
        working_dir: String,
        name: Option<String>,
    ) -> Result<Session, String> {
        self.client_for(instance_id)
            .await?
            .create_session(kind, working_dir, name)
            .await
    }

    pub async fn close_remote_session(
        &self,
        instance_id: &str,
        session_id: &str,
    ) -> Result<(), String> {
        self.client_for(instance_id)
            .await?
            .close_session(session_id)
            .await
    }

    pub async fn write_remote_session(
        &self,
        instance_id: &str,
        session_id: &str,
        data: &[u8],
    ) -> Result<(), String> {
        self.client_for(instance_id)
            .await?
            .write(session_id, data)
            .await
    }

    pub async fn resize_remote_session(
        &self,
        instance_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), String> {
        self.client_for(instance_id)
            .await?
            .resize(session_id, cols, rows)
            .await
    }

    /// Full teardown for process shutdown.
    pub async fn shutdown(&self) {
        let instance_ids: Vec<String> =
            self.clients.read().await.keys().cloned().collect();
        for instance_id in instance_ids {
            self.teardown_client(&instance_id).await;
        }
        if let Some(mut discovery) = self.discovery.lock().await.take() {
            discovery.shutdown().await;
        }
        if let Some(mut server) = self.server.lock().await.take() {
            server.shutdown().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::storage::SessionStore;
    use std::net::{IpAddr, Ipv4Addr};

    fn sighting(instance_id: &str, port: u16) -> PeerSighting {
        PeerSighting {
            instance_id: instance_id.to_string(),
            hostname: format!("{instance_id}-host"),
            identity_hash: "aaaabbbbccccdddd".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port,
        }
    }

    fn manager(tmp: &std::path::Path) -> Arc<TunnelManager> {
        let supervisor = SessionSupervisor::new(SessionStore::new(tmp.join("sessions.json")));
        TunnelManager::with_identity(
            supervisor,
            Some(Identity {
                email: "dev@example.com".to_string(),
                identity_hash: "aaaabbbbccccdddd".to_string(),
                instance_id: "local".to_string(),
                hostname: "local-host".to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn disabled_fabric_reports_not_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor =
            SessionSupervisor::new(SessionStore::new(tmp.path().join("sessions.json")));
        let manager = TunnelManager::with_identity(supervisor, None);

        assert!(!manager.status().enabled);
        assert!(manager.start().await.is_ok());
        assert!(manager.discovered_hosts().await.is_empty());
        assert!(manager.connect("anyone").await.is_err());
    }

    #[tokio::test]
    async fn sightings_create_hosts_and_emit_host_found() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        let mut events = manager.subscribe();

        manager.upsert_sighting(sighting("peer-a", 9500)).await;

        let hosts = manager.discovered_hosts().await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].instance_id, "peer-a");
        assert_eq!(hosts[0].status, HostStatus::Discovered);
        assert_eq!(hosts[0].port, 9500);

        match events.recv().await.unwrap() {
            TunnelEvent::HostFound { host } => assert_eq!(host.instance_id, "peer-a"),
            other => panic!("unexpected event {other:?}"),
        }

        // A refresh does not re-announce.
        manager.upsert_sighting(sighting("peer-a", 9500)).await;
        assert_eq!(manager.discovered_hosts().await.len(), 1);
    }

    #[tokio::test]
    async fn discovery_never_downgrades_transport_states() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());

        manager.upsert_sighting(sighting("peer-a", 9500)).await;
        manager
            .set_host_status("peer-a", HostStatus::Connected)
            .await;

        manager.upsert_sighting(sighting("peer-a", 9501)).await;
        let hosts = manager.discovered_hosts().await;
        assert_eq!(hosts[0].status, HostStatus::Connected);
        // Address refreshes are still applied.
        assert_eq!(hosts[0].port, 9501);
    }

    #[tokio::test]
    async fn reverse_sightings_do_not_clobber_dialable_port() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());

        manager.upsert_sighting(sighting("peer-a", 9500)).await;
        // The server's synthesized sighting carries no listener port.
        manager.upsert_sighting(sighting("peer-a", 0)).await;

        assert_eq!(manager.discovered_hosts().await[0].port, 9500);
    }

    #[tokio::test]
    async fn connecting_requires_a_known_host() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        assert!(manager.connect("never-seen").await.is_err());
        assert!(manager.disconnect("never-seen").await.is_err());
        assert!(manager.list_remote_sessions("never-seen").await.is_err());
    }

    #[tokio::test]
    async fn failed_dial_reverts_host_to_discovered() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());

        // Nothing listens at this sighting's address/port.
        let mut dead = sighting("peer-a", 9);
        dead.address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        manager.upsert_sighting(dead).await;

        assert!(manager.connect("peer-a").await.is_err());
        assert_eq!(
            manager.discovered_hosts().await[0].status,
            HostStatus::Discovered
        );
    }
}
