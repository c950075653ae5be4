/// A session-scoped event pushed through the manager's best-effort event
/// stream (see [`ChannelManager::push_event`](crate::ChannelManager::push_event)).
///
/// Events are opaque to the manager: an application-defined id plus a
/// payload blob. Delivery is FIFO among events, with no ordering guarantee
/// relative to per-channel data delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    id: u32,
    payload: Vec<u8>,
}

impl SessionEvent {
    pub fn new(id: u32, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
