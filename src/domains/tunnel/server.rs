//! Accepting side of the peer fabric. Every connection runs its own key
//! exchange and carries its own shared secret; broadcast traffic is sealed
//! per client.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::crypto::KeyPair;
use super::discovery::PeerSighting;
use super::identity::Identity;
use super::protocol::{self, Frame};
use super::{BASE_SERVER_PORT, PORT_PROBE_RANGE};
use crate::domains::sessions::service::{CreateSessionParams, SessionEvent, SessionSupervisor};
use crate::domains::terminal::Utf8Stream;

/// Drain window between the disconnect frames and dropping the listener.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(200);

struct ClientHandle {
    instance_id: String,
    secret: [u8; 32],
    out: mpsc::UnboundedSender<Message>,
}

type ClientMap = Arc<Mutex<HashMap<u64, ClientHandle>>>;

pub struct PeerServer {
    port: u16,
    clients: ClientMap,
    accept_task: Option<JoinHandle<()>>,
    broadcast_task: Option<JoinHandle<()>>,
}

impl PeerServer {
    /// Bind the listener (probing the port range), start accepting peers,
    /// and start broadcasting supervisor events to authenticated clients.
    pub async fn start(
        identity: Identity,
        supervisor: Arc<SessionSupervisor>,
        sightings: mpsc::UnboundedSender<PeerSighting>,
    ) -> Result<Self, String> {
        let (listener, port) = bind_listener().await?;
        log::info!("Peer server listening on 0.0.0.0:{port}");

        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        let conn_counter = Arc::new(AtomicU64::new(0));

        let accept_clients = Arc::clone(&clients);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("Peer accept failed: {err}");
                        continue;
                    }
                };
                let conn_id = conn_counter.fetch_add(1, Ordering::Relaxed);
                log::info!("Peer connection {conn_id} from {addr}");
                tokio::spawn(handle_connection(
                    stream,
                    addr.ip(),
                    conn_id,
                    identity.clone(),
                    Arc::clone(&supervisor),
                    Arc::clone(&accept_clients),
                    sightings.clone(),
                ));
            }
        });

        Ok(Self {
            port,
            clients,
            accept_task: Some(accept_task),
            broadcast_task: None,
        })
    }

    /// Fan local session events out to every authenticated client,
    /// independently sealed with each client's secret.
    pub fn start_broadcasting(&mut self, supervisor: &SessionSupervisor) {
        let mut events = supervisor.subscribe();
        let clients = Arc::clone(&self.clients);
        self.broadcast_task = Some(tokio::spawn(async move {
            let mut decoders: HashMap<String, Utf8Stream> = HashMap::new();
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Peer broadcast lagging; dropped {skipped} event(s)");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(frame) = broadcast_frame(event, &mut decoders) else {
                    continue;
                };
                let clients = clients.lock().await;
                for client in clients.values() {
                    match protocol::seal(&client.secret, &frame) {
                        Ok(sealed) => {
                            let _ = client.out.send(Message::Text(sealed));
                        }
                        Err(err) => {
                            log::warn!(
                                "Failed to seal broadcast for {}: {err}",
                                client.instance_id
                            );
                        }
                    }
                }
            }
        }));
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Notify clients, give the frames a moment to flush, then stop.
    pub async fn shutdown(&mut self) {
        let clients: Vec<ClientHandle> = {
            let mut guard = self.clients.lock().await;
            guard.drain().map(|(_, client)| client).collect()
        };
        for client in &clients {
            if let Ok(sealed) = protocol::seal(&client.secret, &Frame::Disconnect) {
                let _ = client.out.send(Message::Text(sealed));
            }
            let _ = client.out.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "shutting down".into(),
            })));
        }
        tokio::time::sleep(SHUTDOWN_DRAIN).await;

        if let Some(task) = self.broadcast_task.take() {
            task.abort();
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        log::info!("Peer server stopped");
    }
}

async fn bind_listener() -> Result<(TcpListener, u16), String> {
    for port in BASE_SERVER_PORT..BASE_SERVER_PORT + PORT_PROBE_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                log::debug!("Port {port} in use; probing next");
            }
            Err(err) => return Err(format!("Failed to bind peer server: {err}")),
        }
    }
    Err(format!(
        "All ports in range {}-{} are in use",
        BASE_SERVER_PORT,
        BASE_SERVER_PORT + PORT_PROBE_RANGE - 1
    ))
}

fn broadcast_frame(
    event: SessionEvent,
    decoders: &mut HashMap<String, Utf8Stream>,
) -> Option<Frame> {
    match event {
        SessionEvent::Output { id, data } => {
            let text = decoders
                .entry(id.clone())
                .or_insert_with(Utf8Stream::new)
                .decode_chunk(&data);
            Some(Frame::SessionOutput { id, data: text })
        }
        SessionEvent::Updated { session } => Some(Frame::SessionUpdate { session }),
        SessionEvent::Exited { id, code } => {
            decoders.remove(&id);
            Some(Frame::SessionExit { id, code })
        }
        // Watcher hits are a local concern.
        SessionEvent::Discovered { .. } => None,
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_ip: std::net::IpAddr,
    conn_id: u64,
    identity: Identity,
    supervisor: Arc<SessionSupervisor>,
    clients: ClientMap,
    sightings: mpsc::UnboundedSender<PeerSighting>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            log::warn!("WebSocket handshake failed for connection {conn_id}: {err}");
            return;
        }
    };
    let (mut sink, mut reader) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || is_close {
                break;
            }
        }
    });

    // DH generation is CPU-bound; keep it off the accept path.
    let keypair = match tokio::task::spawn_blocking(KeyPair::generate).await {
        Ok(keypair) => keypair,
        Err(err) => {
            log::warn!("Key generation failed for connection {conn_id}: {err}");
            return;
        }
    };

    let hello = Frame::KeyExchange {
        public_key: keypair.public_key_b64(),
    };
    match protocol::encode_plain(&hello) {
        Ok(text) => {
            let _ = out_tx.send(Message::Text(text));
        }
        Err(err) => {
            log::warn!("Failed to encode key exchange: {err}");
            return;
        }
    }

    let mut secret: Option<[u8; 32]> = None;
    let mut authed = false;

    while let Some(message) = reader.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                log::debug!("Connection {conn_id} read error: {err}");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let Some(key) = secret else {
            // Plaintext phase: only the client's key exchange is legal.
            match protocol::decode_plain(&text) {
                Ok(Frame::KeyExchange { public_key }) => {
                    match keypair.compute_secret(&public_key) {
                        Ok(derived) => secret = Some(derived),
                        Err(err) => {
                            log::warn!("Connection {conn_id} key exchange failed: {err}");
                            break;
                        }
                    }
                }
                Ok(_) | Err(_) => {
                    log::warn!("Connection {conn_id} spoke out of turn before key exchange");
                    break;
                }
            }
            continue;
        };

        let frame = match protocol::open(&key, &text) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("Connection {conn_id} sent an unreadable frame: {err}");
                break;
            }
        };

        if !authed {
            match frame {
                Frame::AuthRequest {
                    identity_hash,
                    hostname,
                    instance_id,
                } => {
                    if identity_hash != identity.identity_hash {
                        log::info!("Connection {conn_id} denied: identity mismatch");
                        if let Ok(sealed) = protocol::seal(
                            &key,
                            &Frame::AuthDenied {
                                reason: "identity mismatch".to_string(),
                            },
                        ) {
                            let _ = out_tx.send(Message::Text(sealed));
                        }
                        let _ = out_tx.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Policy,
                            reason: "identity mismatch".into(),
                        })));
                        break;
                    }

                    if let Ok(sealed) = protocol::seal(&key, &Frame::AuthApproved) {
                        let _ = out_tx.send(Message::Text(sealed));
                    }
                    authed = true;
                    log::info!(
                        "Connection {conn_id} authenticated as {instance_id} ({hostname})"
                    );

                    clients.lock().await.insert(
                        conn_id,
                        ClientHandle {
                            instance_id: instance_id.clone(),
                            secret: key,
                            out: out_tx.clone(),
                        },
                    );

                    // Reverse discovery: the accepting side learns about
                    // peers whose own announcements never reach us.
                    let _ = sightings.send(PeerSighting {
                        instance_id,
                        hostname,
                        identity_hash,
                        address: peer_ip,
                        port: 0,
                    });
                }
                other => {
                    log::warn!(
                        "Connection {conn_id} sent {:?} before authenticating",
                        frame_name(&other)
                    );
                    break;
                }
            }
            continue;
        }

        handle_rpc(frame, &key, &out_tx, &supervisor).await;
    }

    clients.lock().await.remove(&conn_id);
    writer_task.abort();
    log::info!("Peer connection {conn_id} closed");
}

async fn handle_rpc(
    frame: Frame,
    key: &[u8; 32],
    out: &mpsc::UnboundedSender<Message>,
    supervisor: &SessionSupervisor,
) {
    let response = match frame {
        Frame::SessionList { request_id } => Some(Frame::SessionListResponse {
            request_id,
            sessions: supervisor.list().await,
        }),
        Frame::SessionCreate {
            request_id,
            kind,
            working_dir,
            name,
        } => {
            let result = supervisor
                .create(CreateSessionParams {
                    kind,
                    working_dir,
                    name,
                    resume: false,
                    id: None,
                })
                .await;
            let (session, error) = match result {
                Ok(session) => (Some(session), None),
                Err(err) => (None, Some(err)),
            };
            Some(Frame::SessionCreateResponse {
                request_id,
                session,
                error,
            })
        }
        Frame::SessionClose { request_id, id } => Some(Frame::SessionCloseResponse {
            request_id,
            error: supervisor.close(&id).await.err(),
        }),
        Frame::SessionWrite { id, data } => {
            if let Err(err) = supervisor.write(&id, data.as_bytes()).await {
                log::warn!("Remote write to {id} failed: {err}");
            }
            None
        }
        Frame::SessionResize { id, cols, rows } => {
            if let Err(err) = supervisor.resize(&id, cols, rows).await {
                log::warn!("Remote resize of {id} failed: {err}");
            }
            None
        }
        other => {
            log::debug!("Ignoring unexpected frame {:?}", frame_name(&other));
            None
        }
    };

    if let Some(response) = response {
        match protocol::seal(key, &response) {
            Ok(sealed) => {
                let _ = out.send(Message::Text(sealed));
            }
            Err(err) => log::warn!("Failed to seal RPC response: {err}"),
        }
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::KeyExchange { .. } => "key:exchange",
        Frame::AuthRequest { .. } => "auth:request",
        Frame::AuthApproved => "auth:approved",
        Frame::AuthDenied { .. } => "auth:denied",
        Frame::SessionList { .. } => "session:list",
        Frame::SessionListResponse { .. } => "session:list:response",
        Frame::SessionCreate { .. } => "session:create",
        Frame::SessionCreateResponse { .. } => "session:create:response",
        Frame::SessionClose { .. } => "session:close",
        Frame::SessionCloseResponse { .. } => "session:close:response",
        Frame::SessionWrite { .. } => "session:write",
        Frame::SessionResize { .. } => "session:resize",
        Frame::SessionOutput { .. } => "session:output",
        Frame::SessionUpdate { .. } => "session:update",
        Frame::SessionExit { .. } => "session:exit",
        Frame::Disconnect => "disconnect",
    }
}
