//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Execute migration statements atomically
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: sync engine tables
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Global sync clock lives here
        "CREATE TABLE IF NOT EXISTS local_system_facts (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        "INSERT OR IGNORE INTO local_system_facts (key, value) VALUES ('currentSyncTick', '0')",
        // Settings, global when facility_id is empty
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT NOT NULL,
            facility_id TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL,
            PRIMARY KEY (key, facility_id)
        )",
        "CREATE TABLE IF NOT EXISTS sync_lookup (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id TEXT NOT NULL,
            record_type TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            updated_at_sync_tick INTEGER NOT NULL,
            pushed_by_device_id TEXT,
            data TEXT NOT NULL DEFAULT '{}',
            patient_id TEXT,
            facility_id TEXT,
            encounter_id TEXT,
            is_lab_request INTEGER NOT NULL DEFAULT 0,
            updated_at_by_field_sum INTEGER,
            UNIQUE (record_type, record_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_lookup_tick ON sync_lookup(updated_at_sync_tick)",
        "CREATE INDEX IF NOT EXISTS idx_sync_lookup_patient ON sync_lookup(patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_lookup_facility ON sync_lookup(facility_id)",
        "CREATE TABLE IF NOT EXISTS sync_lookup_ticks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_type TEXT NOT NULL,
            source_start_tick INTEGER NOT NULL,
            lookup_end_tick INTEGER NOT NULL,
            completed_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_lookup_ticks_type ON sync_lookup_ticks(record_type, lookup_end_tick DESC)",
        "CREATE TABLE IF NOT EXISTS sync_device_ticks (
            persisted_at_sync_tick INTEGER NOT NULL,
            device_id TEXT NOT NULL,
            source TEXT NOT NULL CHECK (source IN ('push', 'pull')),
            PRIMARY KEY (persisted_at_sync_tick, device_id, source)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_device_ticks_device ON sync_device_ticks(device_id, source)",
        "CREATE TABLE IF NOT EXISTS sync_queued_devices (
            id TEXT PRIMARY KEY,
            facility_ids TEXT NOT NULL DEFAULT '[]',
            last_seen_time INTEGER NOT NULL,
            last_synced_tick INTEGER NOT NULL DEFAULT 0,
            urgent INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE TABLE IF NOT EXISTS sync_sessions (
            id TEXT PRIMARY KEY,
            device_id TEXT,
            status TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            last_connection_time INTEGER NOT NULL,
            snapshot_started_at INTEGER,
            snapshot_completed_at INTEGER,
            persist_completed_at INTEGER,
            completed_at INTEGER,
            started_at_tick INTEGER,
            pull_since INTEGER,
            pull_until INTEGER,
            errors TEXT NOT NULL DEFAULT '[]',
            debug_info TEXT NOT NULL DEFAULT '{}',
            parameters TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_sessions_device ON sync_sessions(device_id, completed_at)",
        "CREATE INDEX IF NOT EXISTS idx_sync_sessions_start ON sync_sessions(start_time DESC)",
        "CREATE TABLE IF NOT EXISTS sync_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sync_sessions(id) ON DELETE CASCADE,
            direction TEXT NOT NULL CHECK (direction IN ('OUTGOING', 'INCOMING')),
            record_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}',
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            updated_at_by_field_sum INTEGER,
            saved_at_sync_tick INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_snapshots_session ON sync_snapshots(session_id, direction, id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_snapshots_record ON sync_snapshots(session_id, record_type, record_id)",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: reference entity tables
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS facilities (
            id TEXT PRIMARY KEY,
            code TEXT,
            name TEXT,
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            updated_at_by_field TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS patients (
            id TEXT PRIMARY KEY,
            display_id TEXT,
            first_name TEXT,
            last_name TEXT,
            date_of_birth TEXT,
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            updated_at_by_field TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS patient_facilities (
            id TEXT PRIMARY KEY,
            patient_id TEXT,
            facility_id TEXT,
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            updated_at_by_field TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE INDEX IF NOT EXISTS idx_patient_facilities_facility ON patient_facilities(facility_id, patient_id)",
        "CREATE TABLE IF NOT EXISTS encounters (
            id TEXT PRIMARY KEY,
            patient_id TEXT,
            facility_id TEXT,
            reason TEXT,
            start_date TEXT,
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            updated_at_by_field TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE INDEX IF NOT EXISTS idx_encounters_patient ON encounters(patient_id)",
        "CREATE TABLE IF NOT EXISTS lab_requests (
            id TEXT PRIMARY KEY,
            encounter_id TEXT,
            status TEXT,
            display_id TEXT,
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            updated_at_by_field TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE INDEX IF NOT EXISTS idx_lab_requests_encounter ON lab_requests(encounter_id)",
        "CREATE TABLE IF NOT EXISTS access_logs (
            id TEXT PRIMARY KEY,
            patient_id TEXT,
            facility_id TEXT,
            device_id TEXT,
            action TEXT,
            logged_at TEXT,
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            updated_at_by_field TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS local_notes (
            id TEXT PRIMARY KEY,
            body TEXT,
            updated_at_sync_tick INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            updated_at_by_field TEXT NOT NULL DEFAULT '{}'
        )",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, CURRENT_VERSION, &statements).await
}
