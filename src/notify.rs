use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::BookingEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking lifecycle events.
///
/// Every event goes to the provider's channel, the requester's channel and
/// the firehose (audit log, unread counters).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
    all: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to events touching a party. Creates the channel if needed.
    pub fn subscribe(&self, party_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(party_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// Fan an event out. Never fails; no-op for parties nobody listens to.
    pub fn send(&self, event: &BookingEvent) {
        for party in [event.provider_id, event.requester_id] {
            if let Some(sender) = self.channels.get(&party) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop a party's channel once its last subscriber went away.
    pub fn remove_if_idle(&self, party_id: &Ulid) {
        self.channels
            .remove_if(party_id, |_, sender| sender.receiver_count() == 0);
    }
}
