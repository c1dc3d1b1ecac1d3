//! ticksync-core - Core library for ticksync
//!
//! This crate contains the sync engine shared by the central node and its
//! tooling: the tick sequencer, per-entity sync contracts, the lookup
//! materializer, the device queue, sync sessions and the device tick journal.

pub mod apply;
pub mod config;
pub mod contract;
pub mod db;
pub mod error;
pub mod events;
pub mod lookup;
pub mod manager;
pub mod models;
pub mod queue;
pub mod session;
pub mod snapshot;
pub mod tick;
mod util;


pub use error::{Error, Result};
pub use manager::{Admission, CentralSyncManager};
pub use models::SyncTick;
