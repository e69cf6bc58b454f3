//! Remote sessions cross the IPC boundary with a synthetic id of shape
//! `tunnel:<peer-instance-id>:<remote-id>`. This module is the only place the
//! transform is applied or reversed.

const TUNNEL_PREFIX: &str = "tunnel:";

pub fn make_tunnel_id(instance_id: &str, remote_id: &str) -> String {
    format!("{TUNNEL_PREFIX}{instance_id}:{remote_id}")
}

pub fn is_tunnel_id(id: &str) -> bool {
    id.starts_with(TUNNEL_PREFIX)
}

/// Split a tunnel id into `(instance_id, remote_id)`. Returns `None` for
/// local ids or malformed input.
pub fn parse_tunnel_id(id: &str) -> Option<(&str, &str)> {
    let rest = id.strip_prefix(TUNNEL_PREFIX)?;
    let (instance_id, remote_id) = rest.split_once(':')?;
    if instance_id.is_empty() || remote_id.is_empty() {
        return None;
    }
    Some((instance_id, remote_id))
}
