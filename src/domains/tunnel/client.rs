//! Connecting side of the peer fabric: one object per remote peer, with
//! correlation-id RPC, event forwarding, and exponential-backoff reconnect.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::crypto::KeyPair;
use super::identity::Identity;
use super::protocol::{self, Frame, RPC_TIMEOUT_SECS};
use crate::domains::agents::AgentKind;
use crate::domains::sessions::Session;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Events observed on one peer connection. Session ids stay in their remote
/// form; the IPC layer wraps them into tunnel ids.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Reconnected,
    Disconnected,
    AuthDenied { reason: String },
    SessionOutput { id: String, data: String },
    SessionUpdate { session: Session },
    SessionExit { id: String, code: Option<i32> },
}

/// Why a connection attempt or an established connection ended.
enum ConnectionEnd {
    /// Transport dropped or errored; reconnect if still allowed.
    Lost,
    /// The far side told us to stop (normal close, disconnect frame, denial).
    Final,
}

#[derive(Debug)]
pub struct PeerClient {
    address: String,
    port: u16,
    identity: Identity,
    events: broadcast::Sender<ClientEvent>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>,
    out: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    secret: Arc<Mutex<Option<[u8; 32]>>>,
    should_reconnect: Arc<AtomicBool>,
    is_connected: Arc<AtomicBool>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerClient {
    /// Connect and complete the handshake. Fails on auth denial, transport
    /// error, or a 15 s handshake timeout; after success the client keeps
    /// itself connected until [`disconnect`](Self::disconnect).
    pub async fn connect(
        address: String,
        port: u16,
        identity: Identity,
    ) -> Result<Arc<Self>, String> {
        let (events, _) = broadcast::channel(4096);
        let client = Arc::new(Self {
            address,
            port,
            identity,
            events,
            pending: Arc::new(Mutex::new(HashMap::new())),
            out: Arc::new(Mutex::new(None)),
            secret: Arc::new(Mutex::new(None)),
            should_reconnect: Arc::new(AtomicBool::new(true)),
            is_connected: Arc::new(AtomicBool::new(false)),
            run_task: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(&client).run(ready_tx));
        *client.run_task.lock().await = Some(task);

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(client),
            Ok(Ok(Err(reason))) => Err(reason),
            Ok(Err(_)) => Err("Connection closed".to_string()),
            Err(_) => {
                client.disconnect().await;
                Err("Peer handshake timed out".to_string())
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn will_reconnect(&self) -> bool {
        self.should_reconnect.load(Ordering::SeqCst)
    }

    /// Tear the connection down for good; pending RPCs are rejected and no
    /// reconnect is scheduled.
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        if let Some(out) = self.out.lock().await.as_ref() {
            let _ = out.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            })));
        }
        if let Some(task) = self.run_task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }
    }

    async fn run(self: Arc<Self>, ready: oneshot::Sender<Result<(), String>>) {
        let mut ready = Some(ready);
        let mut ever_connected = false;
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            let end = self
                .run_connection(&mut ready, &mut ever_connected, &mut delay)
                .await;

            *self.out.lock().await = None;
            *self.secret.lock().await = None;
            self.fail_pending().await;
            if self.is_connected.swap(false, Ordering::SeqCst) {
                let _ = self.events.send(ClientEvent::Disconnected);
            }

            if matches!(end, ConnectionEnd::Final) {
                self.should_reconnect.store(false, Ordering::SeqCst);
            }
            if !self.should_reconnect.load(Ordering::SeqCst) {
                break;
            }

            log::info!(
                "Reconnecting to {}:{} in {:?}",
                self.address,
                self.port,
                delay
            );
            tokio::time::sleep(delay).await;
            delay = next_backoff(delay);
        }

        if let Some(ready) = ready.take() {
            let _ = ready.send(Err("Connection closed".to_string()));
        }
    }

    async fn run_connection(
        &self,
        ready: &mut Option<oneshot::Sender<Result<(), String>>>,
        ever_connected: &mut bool,
        delay: &mut Duration,
    ) -> ConnectionEnd {
        let url = format!("ws://{}:{}", self.address, self.port);
        let (ws, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                log::debug!("Failed to connect to {url}: {err}");
                return ConnectionEnd::Lost;
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
        *self.out.lock().await = Some(out_tx.clone());

        let keypair = match tokio::task::spawn_blocking(KeyPair::generate).await {
            Ok(keypair) => keypair,
            Err(err) => {
                log::warn!("Key generation failed: {err}");
                writer_task.abort();
                return ConnectionEnd::Lost;
            }
        };

        let end = loop {
            let message = match reader.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    log::debug!("Peer read error: {err}");
                    break ConnectionEnd::Lost;
                }
                None => break ConnectionEnd::Lost,
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    // A normal close is final; anything else reconnects.
                    let normal = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    break if normal {
                        ConnectionEnd::Final
                    } else {
                        ConnectionEnd::Lost
                    };
                }
                _ => continue,
            };

            let current_secret = *self.secret.lock().await;
            let Some(key) = current_secret else {
                // The server opens with its public key; answer with ours and
                // authenticate straight away.
                match protocol::decode_plain(&text) {
                    Ok(Frame::KeyExchange { public_key }) => {
                        let derived = match keypair.compute_secret(&public_key) {
                            Ok(derived) => derived,
                            Err(err) => {
                                log::warn!("Key exchange with {url} failed: {err}");
                                break ConnectionEnd::Final;
                            }
                        };
                        *self.secret.lock().await = Some(derived);

                        let reply = Frame::KeyExchange {
                            public_key: keypair.public_key_b64(),
                        };
                        match protocol::encode_plain(&reply) {
                            Ok(encoded) => {
                                let _ = out_tx.send(Message::Text(encoded));
                            }
                            Err(err) => {
                                log::warn!("Failed to encode key exchange: {err}");
                                break ConnectionEnd::Lost;
                            }
                        }
                        let auth = Frame::AuthRequest {
                            identity_hash: self.identity.identity_hash.clone(),
                            hostname: self.identity.hostname.clone(),
                            instance_id: self.identity.instance_id.clone(),
                        };
                        match protocol::seal(&derived, &auth) {
                            Ok(sealed) => {
                                let _ = out_tx.send(Message::Text(sealed));
                            }
                            Err(err) => {
                                log::warn!("Failed to seal auth request: {err}");
                                break ConnectionEnd::Lost;
                            }
                        }
                    }
                    Ok(_) | Err(_) => {
                        log::warn!("Unexpected plaintext frame from {url}");
                        break ConnectionEnd::Lost;
                    }
                }
                continue;
            };

            let frame = match protocol::open(&key, &text) {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("Unreadable frame from {url}: {err}");
                    break ConnectionEnd::Lost;
                }
            };

            match frame {
                Frame::AuthApproved => {
                    self.is_connected.store(true, Ordering::SeqCst);
                    *delay = INITIAL_RECONNECT_DELAY;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    let event = if *ever_connected {
                        ClientEvent::Reconnected
                    } else {
                        ClientEvent::Connected
                    };
                    *ever_connected = true;
                    let _ = self.events.send(event);
                }
                Frame::AuthDenied { reason } => {
                    log::warn!("Peer {url} denied authentication: {reason}");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(reason.clone()));
                    }
                    let _ = self.events.send(ClientEvent::AuthDenied { reason });
                    break ConnectionEnd::Final;
                }
                Frame::Disconnect => {
                    log::info!("Peer {url} requested disconnect");
                    break ConnectionEnd::Final;
                }
                Frame::SessionListResponse { .. }
                | Frame::SessionCreateResponse { .. }
                | Frame::SessionCloseResponse { .. } => {
                    let request_id = frame
                        .request_id()
                        .expect("response frames carry a request id")
                        .to_string();
                    if let Some(waiter) = self.pending.lock().await.remove(&request_id) {
                        let _ = waiter.send(frame);
                    } else {
                        log::debug!("Dropping response for unknown request {request_id}");
                    }
                }
                Frame::SessionOutput { id, data } => {
                    let _ = self.events.send(ClientEvent::SessionOutput { id, data });
                }
                Frame::SessionUpdate { session } => {
                    let _ = self.events.send(ClientEvent::SessionUpdate { session });
                }
                Frame::SessionExit { id, code } => {
                    let _ = self.events.send(ClientEvent::SessionExit { id, code });
                }
                other => {
                    log::debug!("Ignoring unexpected frame: {other:?}");
                }
            }
        };

        writer_task.abort();
        end
    }

    async fn fail_pending(&self) {
        // Dropping the senders rejects every waiter with "Connection closed".
        self.pending.lock().await.clear();
    }

    async fn send_sealed(&self, frame: &Frame) -> Result<(), String> {
        let secret = self
            .secret
            .lock()
            .await
            .ok_or_else(|| "Not connected".to_string())?;
        let sealed = protocol::seal(&secret, frame).map_err(|e| e.to_string())?;
        let guard = self.out.lock().await;
        let out = guard.as_ref().ok_or_else(|| "Not connected".to_string())?;
        out.send(Message::Text(sealed))
            .map_err(|_| "Not connected".to_string())
    }

    async fn request(&self, frame: Frame) -> Result<Frame, String> {
        let request_id = frame
            .request_id()
            .ok_or_else(|| "Frame has no request id".to_string())?
            .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = self.send_sealed(&frame).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(Duration::from_secs(RPC_TIMEOUT_SECS), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err("Connection closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err("Request timed out".to_string())
            }
        }
    }

    fn next_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, String> {
        let response = self
            .request(Frame::SessionList {
                request_id: Self::next_request_id(),
            })
            .await?;
        match response {
            Frame::SessionListResponse { sessions, .. } => Ok(sessions),
            other => Err(format!("Unexpected response: {other:?}")),
        }
    }

    pub async fn create_session(
        &self,
        kind: AgentKind,
        working_dir: String,
        name: Option<String>,
    ) -> Result<Session, String> {
        let response = self
            .request(Frame::SessionCreate {
                request_id: Self::next_request_id(),
                kind,
                working_dir,
                name,
            })
            .await?;
        match response {
            Frame::SessionCreateResponse {
                session, error, ..
            } => match error {
                Some(error) => Err(error),
                None => session.ok_or_else(|| "Empty create response".to_string()),
            },
            other => Err(format!("Unexpected response: {other:?}")),
        }
    }

    pub async fn close_session(&self, id: &str) -> Result<(), String> {
        let response = self
            .request(Frame::SessionClose {
                request_id: Self::next_request_id(),
                id: id.to_string(),
            })
            .await?;
        match response {
            Frame::SessionCloseResponse { error: None, .. } => Ok(()),
            Frame::SessionCloseResponse {
                error: Some(error), ..
            } => Err(error),
            other => Err(format!("Unexpected response: {other:?}")),
        }
    }

    /// Oneway; no response frame exists for this request.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), String> {
        self.send_sealed(&Frame::SessionWrite {
            id: id.to_string(),
            data: String::from_utf8_lossy(data).into_owned(),
        })
        .await
    }

    /// Oneway; no response frame exists for this request.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), String> {
        self.send_sealed(&Frame::SessionResize {
            id: id.to_string(),
            cols,
            rows,
        })
        .await
    }
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RECONNECT_DELAY)
}
