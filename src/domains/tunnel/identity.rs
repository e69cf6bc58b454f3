//! Local identity for the peer fabric. Peers pair on the first 16 hex chars
//! of SHA-256 of the git global `user.email`; without an email the fabric
//! stays disabled for the whole process lifetime.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub email: String,
    pub identity_hash: String,
    pub instance_id: String,
    pub hostname: String,
}

pub fn identity_hash(email: &str) -> String {
    let digest = Sha256::digest(email.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Resolve the local identity, or `None` when no git email is configured
/// (the peer fabric reports "not enabled" in that case, it never crashes).
pub fn resolve_identity(data_dir: &Path) -> Option<Identity> {
    let email = crate::domains::git::global_user_email()?;
    Some(identity_from_email(email, data_dir))
}

pub fn identity_from_email(email: String, data_dir: &Path) -> Identity {
    let identity_hash = identity_hash(&email);
    let instance_id = load_or_create_instance_id(data_dir);
    let hostname = hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    Identity {
        email,
        identity_hash,
        instance_id,
        hostname,
    }
}

/// The instance id is a plain-text UUID persisted once per installation so
/// peers recognize this machine across restarts.
fn load_or_create_instance_id(data_dir: &Path) -> String {
    let path = data_dir.join("tunnel-instance-id");
    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let fresh = Uuid::new_v4().to_string();
    if let Err(err) = fs::create_dir_all(data_dir) {
        log::warn!(
            "Failed to create data directory {}: {err}",
            data_dir.display()
        );
        return fresh;
    }
    if let Err(err) = fs::write(&path, &fresh) {
        log::warn!("Failed to persist instance id to {}: {err}", path.display());
    }
    fresh
}
