//! Dual-stack peer discovery: an mDNS service registration plus a periodic
//! UDP broadcast beacon. Both channels produce [`PeerSighting`]s on one
//! stream; the manager owns the host table and its staleness sweep.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::identity::Identity;
use super::BEACON_PORT;

pub const SERVICE_TYPE: &str = "_terminal-manager._tcp.local.";
pub const BEACON_MAGIC: &str = "TM_BEACON_V1";
pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);
/// A host is stale once this long passes without a sighting.
pub const HOST_TIMEOUT: Duration = Duration::from_secs(20);

/// One observation of a peer, from either discovery channel or from the
/// server's reverse registration.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSighting {
    pub instance_id: String,
    pub hostname: String,
    pub identity_hash: String,
    pub address: IpAddr,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeaconPayload {
    magic: String,
    instance_id: String,
    hostname: String,
    identity_hash: String,
    port: u16,
}

pub struct PeerDiscovery {
    mdns: Option<ServiceDaemon>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerDiscovery {
    /// Publish the local instance and start consuming both channels.
    /// Sightings of peers sharing the local identity hash arrive on the
    /// returned receiver; everything else is filtered out here.
    pub async fn start(
        identity: Identity,
        server_port: u16,
    ) -> (Self, mpsc::UnboundedReceiver<PeerSighting>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let mdns = match start_mdns(&identity, server_port, tx.clone(), &mut tasks) {
            Ok(daemon) => Some(daemon),
            Err(err) => {
                log::warn!("mDNS unavailable: {err}; continuing with beacon only");
                None
            }
        };

        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, BEACON_PORT)).await {
            Ok(socket) => {
                if let Err(err) = socket.set_broadcast(true) {
                    log::warn!("Failed to enable SO_BROADCAST: {err}");
                }
                let socket = Arc::new(socket);
                tasks.push(spawn_beacon_sender(
                    Arc::clone(&socket),
                    identity.clone(),
                    server_port,
                ));
                tasks.push(spawn_beacon_receiver(socket, identity, tx));
            }
            Err(err) => {
                log::warn!("Failed to bind beacon socket on {BEACON_PORT}: {err}; continuing without beacon");
            }
        }

        (Self { mdns, tasks }, rx)
    }

    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mdns) = self.mdns.take() {
            let _ = mdns.shutdown();
        }
    }
}

fn start_mdns(
    identity: &Identity,
    server_port: u16,
    tx: mpsc::UnboundedSender<PeerSighting>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<ServiceDaemon, String> {
    let mdns = ServiceDaemon::new().map_err(|e| e.to_string())?;

    let mut props = HashMap::new();
    props.insert("instanceId".to_string(), identity.instance_id.clone());
    props.insert("hostname".to_string(), identity.hostname.clone());
    props.insert("identityHash".to_string(), identity.identity_hash.clone());

    let service = ServiceInfo::new(
        SERVICE_TYPE,
        &identity.instance_id,
        &format!("{}.local.", identity.instance_id),
        "",
        server_port,
        props,
    )
    .map_err(|e| e.to_string())?
    .enable_addr_auto();

    mdns.register(service).map_err(|e| e.to_string())?;

    let browser = mdns.browse(SERVICE_TYPE).map_err(|e| e.to_string())?;
    let local = identity.clone();
    tasks.push(tokio::spawn(async move {
        while let Ok(event) = browser.recv_async().await {
            if let ServiceEvent::ServiceResolved(info) = event {
                if let Some(sighting) = sighting_from_mdns(&local, &info) {
                    if tx.send(sighting).is_err() {
                        break;
                    }
                }
            }
        }
    }));

    Ok(mdns)
}

fn sighting_from_mdns(local: &Identity, info: &ServiceInfo) -> Option<PeerSighting> {
    let instance_id = info.get_property_val_str("instanceId")?.to_string();
    let identity_hash = info.get_property_val_str("identityHash")?.to_string();
    let hostname = info
        .get_property_val_str("hostname")
        .unwrap_or_default()
        .to_string();

    if instance_id == local.instance_id || identity_hash != local.identity_hash {
        return None;
    }

    let address = pick_routable_address(info.get_addresses().iter().copied())?;
    Some(PeerSighting {
        instance_id,
        hostname,
        identity_hash,
        address,
        port: info.get_port(),
    })
}

/// Prefer a routable IPv4 address: loopback and link-local entries are only
/// noise from the announcing side's interface list.
fn pick_routable_address(addresses: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for address in addresses {
        match address {
            IpAddr::V4(v4) if is_routable_ipv4(&v4) => return Some(address),
            other => fallback = fallback.or(Some(other)),
        }
    }
    fallback
}

fn is_routable_ipv4(ip: &Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local()
}

fn spawn_beacon_sender(
    socket: Arc<UdpSocket>,
    identity: Identity,
    server_port: u16,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let payload = BeaconPayload {
            magic: BEACON_MAGIC.to_string(),
            instance_id: identity.instance_id.clone(),
            hostname: identity.hostname.clone(),
            identity_hash: identity.identity_hash.clone(),
            port: server_port,
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("Failed to serialize beacon payload: {err}");
                return;
            }
        };

        let mut interval = tokio::time::interval(BEACON_INTERVAL);
        loop {
            interval.tick().await;
            for target in beacon_targets() {
                // Broadcast sends fail transiently on some networks.
                if let Err(err) = socket.send_to(&bytes, target).await {
                    log::debug!("Beacon send to {target} failed: {err}");
                }
            }
        }
    })
}

/// Each interface's directed broadcast address plus the limited broadcast.
fn beacon_targets() -> Vec<SocketAddr> {
    let mut targets = Vec::new();
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for interface in interfaces {
            if let if_addrs::IfAddr::V4(v4) = interface.addr {
                if let Some(broadcast) = v4.broadcast {
                    targets.push(SocketAddr::from((broadcast, BEACON_PORT)));
                }
            }
        }
    }
    targets.push(SocketAddr::from((Ipv4Addr::BROADCAST, BEACON_PORT)));
    targets.sort();
    targets.dedup();
    targets
}

fn spawn_beacon_receiver(
    socket: Arc<UdpSocket>,
    identity: Identity,
    tx: mpsc::UnboundedSender<PeerSighting>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (len, sender) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    log::debug!("Beacon receive failed: {err}");
                    continue;
                }
            };
            if let Some(sighting) = sighting_from_beacon(&identity, &buf[..len], sender.ip()) {
                if tx.send(sighting).is_err() {
                    break;
                }
            }
        }
    })
}

/// Parse and filter one received beacon datagram. Wrong magic, our own
/// instance, and foreign identities are all dropped silently. The sender IP
/// is taken as-is, loopback included.
fn sighting_from_beacon(
    local: &Identity,
    datagram: &[u8],
    sender: IpAddr,
) -> Option<PeerSighting> {
    let payload: BeaconPayload = serde_json::from_slice(datagram).ok()?;
    if payload.magic != BEACON_MAGIC {
        return None;
    }
    if payload.instance_id == local.instance_id {
        return None;
    }
    if payload.identity_hash != local.identity_hash {
        return None;
    }
    Some(PeerSighting {
        instance_id: payload.instance_id,
        hostname: payload.hostname,
        identity_hash: payload.identity_hash,
        address: sender,
        port: payload.port,
    })
}
