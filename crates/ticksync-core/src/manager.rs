//! Central sync manager.
//!
//! Owns the database behind a single async mutex, so every operation below
//! runs against a consistent view and tick reservations never race an open
//! write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::Connection;
use tokio::sync::Mutex;

use crate::config::{SettingsCache, SyncConfig};
use crate::contract::SyncRegistry;
use crate::db::{begin, finish, Database, LibSqlSettingsRepository, SettingsRepository};
use crate::error::{Error, Result};
use crate::events::{SyncEvent, SyncEvents};
use crate::lookup::{LookupMaterializer, RunReport};
use crate::models::{
    IncomingChange, JournalSource, PullMetadata, PullRequest, SessionParameters, SessionStatus,
    SnapshotDirection, SnapshotRecord, SyncDeviceTick, SyncQueuedDevice, SyncRequest,
    SyncSession, SyncTick,
};
use crate::queue::SyncQueue;
use crate::session::SyncSessions;
use crate::snapshot::{OutgoingSnapshot, PullParams, SnapshotRepository, SnapshotStrategy};
use crate::tick::{DeviceTickJournal, EntityWrite, EntityWriter, TickSequencer};

/// Answer to a device asking for its sync turn
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The device was first in line; its session has started
    GoodToGo { session: SyncSession },
    /// Another device goes first
    WaitingInQueue { behind: String },
    /// Central is at its session limit
    ActiveSync,
}

/// Thread-safe entry point for devices and operators.
#[derive(Clone)]
pub struct CentralSyncManager {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    registry: Arc<SyncRegistry>,
    config: SyncConfig,
    events: SyncEvents,
    settings: Arc<SettingsCache>,
}

impl CentralSyncManager {
    pub fn new(db: Database, registry: SyncRegistry, config: SyncConfig) -> Self {
        let events = SyncEvents::default();
        let settings = Arc::new(SettingsCache::new(&events));
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            registry: Arc::new(registry),
            config,
            events,
            settings,
        }
    }

    /// Open a manager over the database at the given filesystem path.
    pub async fn open_path(
        db_path: impl Into<PathBuf>,
        registry: SyncRegistry,
        config: SyncConfig,
    ) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened sync database at {}", db_path.display());
        Ok(Self {
            db_path: Some(db_path),
            ..Self::new(db, registry, config)
        })
    }

    /// Open an in-memory manager (primarily for tests).
    pub async fn open_in_memory(registry: SyncRegistry, config: SyncConfig) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::new(db, registry, config))
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    /// Event bus carrying tick advancement and setting changes
    pub const fn events(&self) -> &SyncEvents {
        &self.events
    }

    const fn strategy(&self) -> SnapshotStrategy {
        if self.config.lookup_table_enabled {
            SnapshotStrategy::Lookup
        } else {
            SnapshotStrategy::Tables
        }
    }

    fn sessions<'c>(&self, conn: &'c Connection) -> SyncSessions<'c> {
        SyncSessions::new(conn, self.config.session_timeout)
    }

    // Admission

    /// Record a heartbeat for the device
    pub async fn check_sync_request(
        &self,
        device_id: &str,
        request: &SyncRequest,
    ) -> Result<Option<SyncQueuedDevice>> {
        let db = self.db.lock().await;
        SyncQueue::new(db.connection(), self.config.queue_freshness)
            .check_sync_request(device_id, request)
            .await
    }

    /// Queue the device and start its session if it is its turn
    pub async fn request_sync(
        &self,
        device_id: &str,
        request: &SyncRequest,
        is_mobile: bool,
    ) -> Result<Admission> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let queue = SyncQueue::new(conn, self.config.queue_freshness);
        let sessions = self.sessions(conn);

        sessions.close_lapsed_sessions().await?;
        let next = queue.check_sync_request(device_id, request).await?;

        let active = sessions.count_open_excluding(device_id).await?;
        if active >= u64::from(self.config.max_concurrent_sessions) {
            tracing::debug!(device_id, active, "Sync capacity reached");
            return Ok(Admission::ActiveSync);
        }
        if let Some(next) = next.filter(|next| next.id != device_id) {
            tracing::debug!(device_id, behind = %next.id, "Device waiting in sync queue");
            return Ok(Admission::WaitingInQueue { behind: next.id });
        }

        let parameters = SessionParameters {
            is_mobile,
            facility_ids: request.facility_ids.clone(),
            use_sync_lookup: self.config.lookup_table_enabled,
            tables_for_full_resync: Vec::new(),
        };
        let session = self.start_session_on(conn, device_id, &parameters).await?;
        Ok(Admission::GoodToGo { session })
    }

    /// Start a session without going through the queue
    pub async fn start_session(
        &self,
        device_id: &str,
        parameters: &SessionParameters,
    ) -> Result<SyncSession> {
        let db = self.db.lock().await;
        self.start_session_on(db.connection(), device_id, parameters)
            .await
    }

    async fn start_session_on(
        &self,
        conn: &Connection,
        device_id: &str,
        parameters: &SessionParameters,
    ) -> Result<SyncSession> {
        let sessions = self.sessions(conn);
        begin(conn).await?;
        let result: Result<SyncSession> = async {
            let session = sessions.create(Some(device_id), parameters).await?;
            sessions.close_device_sessions(device_id, &session.id).await?;
            SyncQueue::new(conn, self.config.queue_freshness)
                .remove(device_id)
                .await?;
            let tick = TickSequencer::new(conn).next().await?;
            sessions.mark_as_started_at(&session.id, tick).await?;
            sessions.require(&session.id).await
        }
        .await;
        let session = finish(conn, result).await?;

        tracing::info!(
            session_id = %session.id,
            device_id,
            tick = ?session.started_at_tick,
            "Sync session started"
        );
        Ok(session)
    }

    /// Refresh the session's heartbeat
    pub async fn connect_to_session(&self, session_id: &str) -> Result<SyncSession> {
        let db = self.db.lock().await;
        self.sessions(db.connection()).connect(session_id).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SyncSession>> {
        let db = self.db.lock().await;
        self.sessions(db.connection()).get(session_id).await
    }

    // Pull

    /// Fix the pull window and stage the session's outgoing snapshot
    pub async fn initiate_pull(
        &self,
        session_id: &str,
        request: &PullRequest,
    ) -> Result<PullMetadata> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let sessions = self.sessions(conn);

        let session = sessions.connect(session_id).await?;
        sessions
            .transition(session_id, SessionStatus::SnapshotInProgress)
            .await?;

        let result = self.stage_pull(conn, &session, request).await;
        match result {
            Ok(metadata) => Ok(metadata),
            Err(error) => Err(Self::fail_session(&sessions, session_id, error).await),
        }
    }

    async fn stage_pull(
        &self,
        conn: &Connection,
        session: &SyncSession,
        request: &PullRequest,
    ) -> Result<PullMetadata> {
        let sessions = self.sessions(conn);
        let strategy = self.strategy();
        let since = request.since;
        let pull_until = self.reserve_pull_until(conn, strategy).await?.max(since);
        sessions
            .set_pull_window(&session.id, since, pull_until)
            .await?;

        let mut parameters = session.parameters.clone();
        parameters
            .tables_for_full_resync
            .clone_from(&request.tables_for_full_resync);
        sessions.update_parameters(&session.id, &parameters).await?;

        let params = PullParams {
            session_id: session.id.clone(),
            device_id: session.device_id.clone().unwrap_or_default(),
            facility_ids: parameters.facility_ids.clone(),
            since,
            until: pull_until,
            is_mobile: parameters.is_mobile,
            sync_all_lab_requests: self
                .settings
                .sync_all_lab_requests(conn, &parameters.facility_ids)
                .await?,
            tables_to_include: request.tables_to_include.clone(),
            tables_for_full_resync: request.tables_for_full_resync.clone(),
        };
        let total_to_pull = OutgoingSnapshot::new(conn, &self.registry)
            .snapshot(&params, strategy)
            .await?;

        let mut debug_info = serde_json::Map::new();
        debug_info.insert("totalToPull".to_string(), total_to_pull.into());
        debug_info.insert(
            "syncAllLabRequests".to_string(),
            params.session_config().sync_all_lab_requests.into(),
        );
        debug_info.insert("strategy".to_string(), serde_json::to_value(strategy)?);
        sessions.add_debug_info(&session.id, &debug_info).await?;
        sessions
            .transition(&session.id, SessionStatus::SnapshotComplete)
            .await?;

        tracing::info!(
            session_id = %session.id,
            %since,
            %pull_until,
            total_to_pull,
            "Pull snapshot ready"
        );
        Ok(PullMetadata {
            total_to_pull,
            pull_until,
        })
    }

    /// Upper bound for a new pull.
    ///
    /// From the lookup table, that is the lowest watermark after a fresh
    /// materializer pass; from the entity tables, a newly reserved tick.
    async fn reserve_pull_until(
        &self,
        conn: &Connection,
        strategy: SnapshotStrategy,
    ) -> Result<SyncTick> {
        if strategy == SnapshotStrategy::Lookup {
            let materializer = LookupMaterializer::new(conn, &self.registry, &self.events);
            materializer.run().await?;
            if let Some(lowest) = materializer.watermarks().await?.into_values().min() {
                return Ok(lowest);
            }
        }

        begin(conn).await?;
        let reserved = async { TickSequencer::new(conn).tick_tock().await }.await;
        Ok(finish(conn, reserved).await?.tick)
    }

    pub async fn fetch_pull_metadata(&self, session_id: &str) -> Result<PullMetadata> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let session = self.sessions(conn).connect(session_id).await?;
        let Some(pull_until) = session.pull_until else {
            return Err(Error::InvalidInput(format!(
                "sync session '{session_id}' has not initiated a pull"
            )));
        };
        let total_to_pull = SnapshotRepository::new(conn)
            .count(session_id, SnapshotDirection::Outgoing)
            .await?;
        Ok(PullMetadata {
            total_to_pull,
            pull_until,
        })
    }

    /// Page through the staged pull, starting after `from_id`
    pub async fn get_outgoing_changes(
        &self,
        session_id: &str,
        from_id: i64,
        limit: u32,
    ) -> Result<Vec<SnapshotRecord>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let session = self.sessions(conn).connect(session_id).await?;
        if session.pull_until.is_none() || session.status == SessionStatus::SnapshotInProgress {
            return Err(Error::InvalidInput(format!(
                "sync session '{session_id}' has no pull snapshot ready"
            )));
        }
        SnapshotRepository::new(conn)
            .outgoing_page(session_id, from_id, limit)
            .await
    }

    // Push

    /// Stage records pushed by the device
    pub async fn add_incoming_changes(
        &self,
        session_id: &str,
        changes: &[IncomingChange],
    ) -> Result<u64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let session = self.sessions(conn).connect(session_id).await?;
        if session.status != SessionStatus::SnapshotComplete {
            return Err(Error::InvalidSessionTransition {
                session_id: session_id.to_string(),
                from: session.status,
                to: SessionStatus::PersistInProgress,
            });
        }
        let staged = SnapshotRepository::new(conn)
            .stage_incoming(session_id, changes)
            .await?;
        tracing::debug!(session_id, staged, "Staged pushed records");
        Ok(staged)
    }

    /// Persist every staged record at one tick and journal the push
    pub async fn complete_push(&self, session_id: &str, device_id: &str) -> Result<SyncTick> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let sessions = self.sessions(conn);

        let session = sessions.connect(session_id).await?;
        if session
            .device_id
            .as_deref()
            .is_some_and(|owner| owner != device_id)
        {
            return Err(Error::InvalidInput(format!(
                "sync session '{session_id}' does not belong to device '{device_id}'"
            )));
        }
        sessions
            .transition(session_id, SessionStatus::PersistInProgress)
            .await?;

        let result: Result<SyncTick> = async {
            let tick = self.persist_incoming(conn, session_id, device_id).await?;
            sessions.complete_persist(session_id).await?;
            Ok(tick)
        }
        .await;
        match result {
            Ok(tick) => {
                tracing::info!(session_id, device_id, %tick, "Persisted pushed records");
                Ok(tick)
            }
            Err(error) => Err(Self::fail_session(&sessions, session_id, error).await),
        }
    }

    async fn persist_incoming(
        &self,
        conn: &Connection,
        session_id: &str,
        device_id: &str,
    ) -> Result<SyncTick> {
        let snapshots = SnapshotRepository::new(conn);
        let incoming = snapshots.incoming(session_id).await?;
        for record in &incoming {
            let contract = self.registry.resolve(&record.record_type)?;
            if !contract.direction().is_pushed() {
                return Err(Error::PushNotAllowed(record.record_type.clone()));
            }
        }

        let writer = EntityWriter::new(conn, &self.registry);
        begin(conn).await?;
        let result: Result<SyncTick> = async {
            let tick = TickSequencer::new(conn).next().await?;
            for record in &incoming {
                let write = EntityWrite {
                    record_type: record.record_type.clone(),
                    id: record.record_id.clone(),
                    attributes: serde_json::Value::Object(record.data.clone()),
                    deleted: record.is_deleted,
                };
                writer.apply_at(&write, tick).await?;
            }
            snapshots.mark_saved(session_id, tick).await?;
            DeviceTickJournal::new(conn)
                .record(&SyncDeviceTick {
                    device_id: device_id.to_string(),
                    persisted_at_sync_tick: tick,
                    source: JournalSource::Push,
                })
                .await?;
            Ok(tick)
        }
        .await;
        finish(conn, result).await
    }

    /// Journal the device's pulled watermark and complete the session
    pub async fn end_session(&self, session_id: &str) -> Result<SyncSession> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let sessions = self.sessions(conn);
        let session = sessions.require_open(session_id).await?;

        begin(conn).await?;
        let result: Result<SyncSession> = async {
            if let (Some(device_id), Some(pull_until)) = (&session.device_id, session.pull_until)
            {
                DeviceTickJournal::new(conn)
                    .record(&SyncDeviceTick {
                        device_id: device_id.clone(),
                        persisted_at_sync_tick: pull_until,
                        source: JournalSource::Pull,
                    })
                    .await?;
            }
            let completed = sessions.complete(session_id).await?;
            SnapshotRepository::new(conn).clear(session_id).await?;
            Ok(completed)
        }
        .await;
        finish(conn, result).await
    }

    /// Fail a session with a caller-supplied reason
    pub async fn mark_session_errored(&self, session_id: &str, error: &str) -> Result<SyncSession> {
        let db = self.db.lock().await;
        self.sessions(db.connection())
            .mark_errored(session_id, error)
            .await
    }

    /// Record `error` on the session and hand back what the caller sees
    async fn fail_session(sessions: &SyncSessions<'_>, session_id: &str, error: Error) -> Error {
        let message = error.to_string();
        match sessions.mark_errored(session_id, &message).await {
            Ok(_) => Error::SessionErrored {
                session_id: session_id.to_string(),
                message,
            },
            Err(mark_error) => {
                tracing::error!(session_id, "Failed to record session error: {mark_error}");
                error
            }
        }
    }

    // Lookup & maintenance

    /// Run one materializer pass
    pub async fn update_lookup_table(&self) -> Result<RunReport> {
        let db = self.db.lock().await;
        LookupMaterializer::new(db.connection(), &self.registry, &self.events)
            .run()
            .await
    }

    pub async fn watermark(&self, record_type: &str) -> Result<SyncTick> {
        let db = self.db.lock().await;
        self.registry.resolve(record_type)?;
        LookupMaterializer::new(db.connection(), &self.registry, &self.events)
            .watermark(record_type)
            .await
    }

    pub async fn watermarks(&self) -> Result<BTreeMap<String, SyncTick>> {
        let db = self.db.lock().await;
        LookupMaterializer::new(db.connection(), &self.registry, &self.events)
            .watermarks()
            .await
    }

    /// Drop lookup tombstones every device has pulled past
    pub async fn prune_lookup(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let Some(boundary) = DeviceTickJournal::new(conn).gc_boundary().await? else {
            tracing::debug!("No device has completed a pull; nothing to prune");
            return Ok(0);
        };
        LookupMaterializer::new(conn, &self.registry, &self.events)
            .prune_tombstones(boundary)
            .await
    }

    pub async fn close_lapsed_sessions(&self) -> Result<u64> {
        let db = self.db.lock().await;
        self.sessions(db.connection()).close_lapsed_sessions().await
    }

    pub async fn queued_devices(&self) -> Result<Vec<SyncQueuedDevice>> {
        let db = self.db.lock().await;
        SyncQueue::new(db.connection(), self.config.queue_freshness)
            .list()
            .await
    }

    pub async fn recent_sessions(&self, limit: u32) -> Result<Vec<SyncSession>> {
        let db = self.db.lock().await;
        self.sessions(db.connection()).recent(limit).await
    }

    // Data & settings

    /// Commit one entity mutation under a fresh tick
    pub async fn write(&self, write: &EntityWrite) -> Result<SyncTick> {
        let db = self.db.lock().await;
        EntityWriter::new(db.connection(), &self.registry)
            .write(write)
            .await
    }

    /// Commit a batch of entity mutations under one tick
    pub async fn write_batch(&self, writes: &[EntityWrite]) -> Result<SyncTick> {
        let db = self.db.lock().await;
        EntityWriter::new(db.connection(), &self.registry)
            .write_batch(writes)
            .await
    }

    /// Store a setting and invalidate cached copies
    pub async fn set_setting(
        &self,
        key: &str,
        facility_id: Option<&str>,
        value: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection())
            .set(key, facility_id, value)
            .await?;
        self.events.publish(SyncEvent::SettingsChanged {
            key: key.to_string(),
            facility_id: facility_id.map(str::to_string),
        });
        Ok(())
    }

    /// Current value of the global sync clock
    pub async fn current_tick(&self) -> Result<SyncTick> {
        let db = self.db.lock().await;
        TickSequencer::new(db.connection()).current().await
    }
}
