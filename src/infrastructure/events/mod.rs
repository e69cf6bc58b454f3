use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events crossing the IPC boundary to whatever frontend is attached.
/// The string names are the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunkEvent {
    SessionOutput,
    SessionUpdate,
    SessionExit,
    SessionDiscovered,
    TunnelHostFound,
    TunnelHostLost,
    TunnelConnected,
    TunnelDisconnected,
}

impl FunkEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunkEvent::SessionOutput => "session:output",
            FunkEvent::SessionUpdate => "session:update",
            FunkEvent::SessionExit => "session:exit",
            FunkEvent::SessionDiscovered => "session:discovered",
            FunkEvent::TunnelHostFound => "tunnel:host-found",
            FunkEvent::TunnelHostLost => "tunnel:host-lost",
            FunkEvent::TunnelConnected => "tunnel:connected",
            FunkEvent::TunnelDisconnected => "tunnel:disconnected",
        }
    }
}

/// One serialized event as delivered to the frontend channel.
#[derive(Debug, Clone, Serialize)]
pub struct IpcEvent {
    pub event: FunkEvent,
    pub name: &'static str,
    pub payload: serde_json::Value,
}

/// Broadcast fan-out for IPC events. Receivers that fall behind lose the
/// oldest events rather than blocking the emitters.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IpcEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpcEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn send(&self, event: IpcEvent) {
        // No receivers is not an error; the frontend may not be attached yet.
        let _ = self.tx.send(event);
    }
}

pub fn emit_event<T: Serialize>(
    bus: &EventBus,
    event: FunkEvent,
    payload: &T,
) -> Result<(), serde_json::Error> {
    let payload = serde_json::to_value(payload)?;
    bus.send(IpcEvent {
        event,
        name: event.as_str(),
        payload,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_the_ipc_contract() {
        assert_eq!(FunkEvent::SessionOutput.as_str(), "session:output");
        assert_eq!(FunkEvent::SessionUpdate.as_str(), "session:update");
        assert_eq!(FunkEvent::SessionExit.as_str(), "session:exit");
        assert_eq!(FunkEvent::TunnelHostFound.as_str(), "tunnel:host-found");
        assert_eq!(FunkEvent::TunnelHostLost.as_str(), "tunnel:host-lost");
    }

    #[tokio::test]
    async fn emitted_events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        emit_event(
            &bus,
            FunkEvent::SessionExit,
            &serde_json::json!({"id": "s1", "code": 0}),
        )
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name, "session:exit");
        assert_eq!(received.payload["id"], "s1");
    }

    #[test]
    fn emitting_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        emit_event(&bus, FunkEvent::SessionUpdate, &serde_json::json!({})).unwrap();
        assert_eq!(bus.receiver_count(), 0);
    }
}
