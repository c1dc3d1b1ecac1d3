//! Broadcast channel for tick advancement and cache invalidation

use tokio::sync::broadcast;

use crate::models::SyncTick;

const DEFAULT_CAPACITY: usize = 256;

/// Something other components may react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The lookup watermark for `record_type` moved to `watermark`
    TickAdvanced {
        record_type: String,
        watermark: SyncTick,
    },
    /// A setting was written; cached copies are stale
    SettingsChanged {
        key: String,
        facility_id: Option<String>,
    },
}

/// Cloneable handle to the event bus
#[derive(Debug, Clone)]
pub struct SyncEvents {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is fine
    pub fn publish(&self, event: SyncEvent) {
        tracing::trace!(?event, "Publishing sync event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for SyncEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
