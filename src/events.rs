use crate::address::Address;
use tokio::sync::broadcast;

/// Change signals emitted by the store after a transaction commits.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    RoomChanged(Address),
    RoomDeleted(Address),
    DomainChanged(String),
    DomainDeleted(String),
}

pub struct EventBus {
    pub sender: broadcast::Sender<StoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: StoreEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}
