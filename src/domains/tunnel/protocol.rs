//! Peer wire protocol: one JSON message per WebSocket frame. The two
//! `key:exchange` frames travel in plaintext; everything after is encrypted
//! with the per-connection shared secret and base64-packed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto;
use crate::domains::agents::AgentKind;
use crate::domains::sessions::Session;

/// Request-level deadline for peer RPCs.
pub const RPC_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("crypto failure: {0}")]
    Crypto(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "key:exchange", rename_all = "camelCase")]
    KeyExchange { public_key: String },

    #[serde(rename = "auth:request", rename_all = "camelCase")]
    AuthRequest {
        identity_hash: String,
        hostname: String,
        instance_id: String,
    },
    #[serde(rename = "auth:approved")]
    AuthApproved,
    #[serde(rename = "auth:denied")]
    AuthDenied { reason: String },

    #[serde(rename = "session:list", rename_all = "camelCase")]
    SessionList { request_id: String },
    #[serde(rename = "session:list:response", rename_all = "camelCase")]
    SessionListResponse {
        request_id: String,
        sessions: Vec<Session>,
    },

    #[serde(rename = "session:create", rename_all = "camelCase")]
    SessionCreate {
        request_id: String,
        kind: AgentKind,
        working_dir: String,
        name: Option<String>,
    },
    #[serde(rename = "session:create:response", rename_all = "camelCase")]
    SessionCreateResponse {
        request_id: String,
        session: Option<Session>,
        error: Option<String>,
    },

    #[serde(rename = "session:close", rename_all = "camelCase")]
    SessionClose { request_id: String, id: String },
    #[serde(rename = "session:close:response", rename_all = "camelCase")]
    SessionCloseResponse {
        request_id: String,
        error: Option<String>,
    },

    // Oneway: no response frames.
    #[serde(rename = "session:write")]
    SessionWrite { id: String, data: String },
    #[serde(rename = "session:resize")]
    SessionResize { id: String, cols: u16, rows: u16 },

    // Server-initiated broadcasts.
    #[serde(rename = "session:output")]
    SessionOutput { id: String, data: String },
    #[serde(rename = "session:update")]
    SessionUpdate { session: Session },
    #[serde(rename = "session:exit")]
    SessionExit { id: String, code: Option<i32> },

    #[serde(rename = "disconnect")]
    Disconnect,
}

impl Frame {
    /// The correlation id for request/response frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::SessionList { request_id }
            | Frame::SessionListResponse { request_id, .. }
            | Frame::SessionCreate { request_id, .. }
            | Frame::SessionCreateResponse { request_id, .. }
            | Frame::SessionClose { request_id, .. }
            | Frame::SessionCloseResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

pub fn encode_plain(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode_plain(text: &str) -> Result<Frame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Serialize and encrypt a post-handshake frame.
pub fn seal(key: &[u8; 32], frame: &Frame) -> Result<String, ProtocolError> {
    let json = serde_json::to_string(frame)?;
    crypto::encrypt(key, json.as_bytes()).map_err(|e| ProtocolError::Crypto(e.to_string()))
}

/// Decrypt and parse a post-handshake frame.
pub fn open(key: &[u8; 32], packed: &str) -> Result<Frame, ProtocolError> {
    let plain =
        crypto::decrypt(key, packed).map_err(|e| ProtocolError::Crypto(e.to_string()))?;
    Ok(serde_json::from_slice(&plain)?)
}
