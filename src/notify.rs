use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{OccupancyEvent, RestaurantId};
use crate::ports::OccupancyPublisher;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for occupancy events per restaurant.
pub struct NotifyHub {
    channels: DashMap<RestaurantId, broadcast::Sender<OccupancyEvent>>,
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
        }
    }

    /// Subscribe to events for a restaurant. Creates the channel if needed.
    pub fn subscribe(&self, restaurant_id: RestaurantId) -> broadcast::Receiver<OccupancyEvent> {
        let sender = self
            .channels
            .entry(restaurant_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, event: &OccupancyEvent) {
        if let Some(sender) = self.channels.get(&event.restaurant_id()) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a restaurant is closed).
    pub fn remove(&self, restaurant_id: &RestaurantId) {
        self.channels.remove(restaurant_id);
    }
}

impl OccupancyPublisher for NotifyHub {
    fn publish(&self, event: &OccupancyEvent) {
        self.send(event);
    }
}

/// Writes each event as one JSON line to the `slotguard::events` log target.
pub struct LogPublisher;

impl OccupancyPublisher for LogPublisher {
    fn publish(&self, event: &OccupancyEvent) {
        match serde_json::to_string(event) {
            Ok(json) => tracing::info!(target: "slotguard::events", "{json}"),
            Err(e) => tracing::warn!("occupancy event not serializable: {e}"),
        }
    }
}
