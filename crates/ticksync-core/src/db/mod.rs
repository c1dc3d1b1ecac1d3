//! Database layer for ticksync

mod connection;
mod migrations;
mod settings_repository;

pub use connection::{begin, finish, Database};
pub use settings_repository::{LibSqlSettingsRepository, SettingsRepository};
