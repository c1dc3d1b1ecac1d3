//! Data models for ticksync

mod device;
mod lookup;
mod session;
mod snapshot;
mod tick;

pub use device::{JournalSource, SyncDeviceTick, SyncQueuedDevice, SyncRequest};
pub use lookup::{SyncLookupRow, SyncLookupTick};
pub use session::{PullMetadata, PullRequest, SessionParameters, SessionStatus, SyncSession};
pub use snapshot::{IncomingChange, SnapshotDirection, SnapshotRecord, FIELD_TICKS_KEY};
pub use tick::{SyncTick, TickTock};
