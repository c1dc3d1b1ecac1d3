//! Sync session repository.
//!
//! Every status change is a guarded `UPDATE ... WHERE status = ?`, so a
//! session can only move along the lifecycle and never out of a terminal
//! state.

use std::time::Duration;

use libsql::{Connection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{SessionParameters, SessionStatus, SyncSession, SyncTick};
use crate::util::{duration_ms, normalize_text_option, now_ms, text_or_null};

const SELECT_COLUMNS: &str = "id, device_id, status, start_time, last_connection_time, \
    snapshot_started_at, snapshot_completed_at, persist_completed_at, completed_at, \
    started_at_tick, pull_since, pull_until, errors, debug_info, parameters";

pub const TIMED_OUT_MESSAGE: &str = "Sync session timed out";
pub const DEVICE_RECONNECTED_MESSAGE: &str =
    "Session marked as completed due to its device reconnecting";

pub struct SyncSessions<'a> {
    conn: &'a Connection,
    timeout: Duration,
}

impl<'a> SyncSessions<'a> {
    /// `timeout` is the idle time after which an open session lapses
    pub const fn new(conn: &'a Connection, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    pub async fn create(
        &self,
        device_id: Option<&str>,
        parameters: &SessionParameters,
    ) -> Result<SyncSession> {
        self.create_at(device_id, parameters, now_ms()).await
    }

    pub async fn create_at(
        &self,
        device_id: Option<&str>,
        parameters: &SessionParameters,
        now: i64,
    ) -> Result<SyncSession> {
        let id = Uuid::now_v7().to_string();
        let device_id = normalize_text_option(device_id.map(str::to_string));
        self.conn
            .execute(
                "INSERT INTO sync_sessions (id, device_id, status, start_time, last_connection_time, parameters)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                libsql::params![
                    id.as_str(),
                    text_or_null(device_id.as_deref()),
                    SessionStatus::Created.as_str(),
                    now,
                    serde_json::to_string(parameters)?
                ],
            )
            .await?;

        tracing::debug!(session_id = %id, ?device_id, "Created sync session");
        self.require(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<SyncSession>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM sync_sessions WHERE id = ?"),
                [id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_session(&row)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but a missing session is an error
    pub async fn require(&self, id: &str) -> Result<SyncSession> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync session '{id}'")))
    }

    /// Fetch a session that may still change.
    ///
    /// Errored sessions surface their latest error.
    pub async fn require_open(&self, id: &str) -> Result<SyncSession> {
        let session = self.require(id).await?;
        if session.is_errored() {
            return Err(Error::SessionErrored {
                session_id: session.id.clone(),
                message: session.last_error().unwrap_or_default().to_string(),
            });
        }
        if session.is_completed() {
            return Err(Error::SessionCompleted(session.id));
        }
        Ok(session)
    }

    /// Record the tick the session started at; it can only be set once
    pub async fn mark_as_started_at(&self, id: &str, tick: SyncTick) -> Result<()> {
        let session = self.require_open(id).await?;
        if session.started_at_tick.is_some() {
            return Err(Error::InvalidInput(format!(
                "sync session '{id}' already started at tick {}",
                session.started_at_tick.unwrap_or_default()
            )));
        }

        let changed = self
            .conn
            .execute(
                "UPDATE sync_sessions SET started_at_tick = ?1
                 WHERE id = ?2 AND started_at_tick IS NULL AND completed_at IS NULL",
                libsql::params![tick.value(), id],
            )
            .await?;
        if changed == 0 {
            return Err(Error::SessionCompleted(id.to_string()));
        }
        Ok(())
    }

    /// Move the session along its lifecycle
    pub async fn transition(&self, id: &str, to: SessionStatus) -> Result<SyncSession> {
        if to == SessionStatus::Errored {
            return Err(Error::InvalidInput(
                "use mark_errored to fail a session".to_string(),
            ));
        }
        self.transition_at(id, to, now_ms()).await
    }

    async fn transition_at(&self, id: &str, to: SessionStatus, now: i64) -> Result<SyncSession> {
        let session = self.require_open(id).await?;
        let from = session.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidSessionTransition {
                session_id: id.to_string(),
                from,
                to,
            });
        }

        let stamp = match to {
            SessionStatus::SnapshotInProgress => ", snapshot_started_at = ?4",
            SessionStatus::SnapshotComplete => ", snapshot_completed_at = ?4",
            SessionStatus::Complete => ", completed_at = ?4",
            _ => "",
        };
        let sql = format!(
            "UPDATE sync_sessions SET status = ?1{stamp}
             WHERE id = ?2 AND status = ?3 AND completed_at IS NULL"
        );
        let changed = if stamp.is_empty() {
            self.conn
                .execute(&sql, libsql::params![to.as_str(), id, from.as_str()])
                .await?
        } else {
            self.conn
                .execute(&sql, libsql::params![to.as_str(), id, from.as_str(), now])
                .await?
        };
        if changed == 0 {
            let current = self.require(id).await?;
            return Err(Error::InvalidSessionTransition {
                session_id: id.to_string(),
                from: current.status,
                to,
            });
        }

        tracing::debug!(session_id = id, %from, %to, "Sync session transitioned");
        self.require(id).await
    }

    /// Fix the pull window once the snapshot bounds are known
    pub async fn set_pull_window(&self, id: &str, since: SyncTick, until: SyncTick) -> Result<()> {
        self.require_open(id).await?;
        self.conn
            .execute(
                "UPDATE sync_sessions SET pull_since = ?1, pull_until = ?2
                 WHERE id = ?3 AND completed_at IS NULL",
                libsql::params![since.value(), until.value(), id],
            )
            .await?;
        Ok(())
    }

    /// Record that every pushed record has been persisted
    pub async fn complete_persist(&self, id: &str) -> Result<()> {
        let session = self.require_open(id).await?;
        if session.status != SessionStatus::PersistInProgress {
            return Err(Error::InvalidSessionTransition {
                session_id: id.to_string(),
                from: session.status,
                to: SessionStatus::Complete,
            });
        }
        self.conn
            .execute(
                "UPDATE sync_sessions SET persist_completed_at = ?1
                 WHERE id = ?2 AND status = ?3 AND completed_at IS NULL",
                libsql::params![now_ms(), id, SessionStatus::PersistInProgress.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Finish successfully; persistence must have completed first
    pub async fn complete(&self, id: &str) -> Result<SyncSession> {
        let session = self.require_open(id).await?;
        if session.persist_completed_at.is_none() {
            return Err(Error::InvalidSessionTransition {
                session_id: id.to_string(),
                from: session.status,
                to: SessionStatus::Complete,
            });
        }
        let session = self.transition(id, SessionStatus::Complete).await?;
        tracing::info!(session_id = id, "Sync session complete");
        Ok(session)
    }

    /// Fail the session, appending `error` to its error list
    pub async fn mark_errored(&self, id: &str, error: &str) -> Result<SyncSession> {
        self.mark_errored_at(id, error, now_ms()).await
    }

    async fn mark_errored_at(&self, id: &str, error: &str, now: i64) -> Result<SyncSession> {
        let session = self.require(id).await?;
        if session.is_completed() {
            return Err(Error::SessionCompleted(id.to_string()));
        }

        let mut errors = session.errors;
        errors.push(error.to_string());
        let changed = self
            .conn
            .execute(
                "UPDATE sync_sessions SET status = ?1, errors = ?2, completed_at = ?3
                 WHERE id = ?4 AND completed_at IS NULL",
                libsql::params![
                    SessionStatus::Errored.as_str(),
                    serde_json::to_string(&errors)?,
                    now,
                    id
                ],
            )
            .await?;
        if changed == 0 {
            return Err(Error::SessionCompleted(id.to_string()));
        }

        tracing::error!(session_id = id, "Sync session errored: {error}");
        self.require(id).await
    }

    /// Refresh the session's heartbeat, or error it if it has lapsed
    pub async fn connect(&self, id: &str) -> Result<SyncSession> {
        self.connect_at(id, now_ms()).await
    }

    pub async fn connect_at(&self, id: &str, now: i64) -> Result<SyncSession> {
        let session = self.require_open(id).await?;
        if self.is_lapsed(&session, now) {
            tracing::warn!(session_id = id, "Sync session timed out");
            self.mark_errored_at(id, TIMED_OUT_MESSAGE, now).await?;
            return Err(Error::SessionErrored {
                session_id: id.to_string(),
                message: TIMED_OUT_MESSAGE.to_string(),
            });
        }

        self.conn
            .execute(
                "UPDATE sync_sessions SET last_connection_time = ?1
                 WHERE id = ?2 AND completed_at IS NULL",
                libsql::params![now, id],
            )
            .await?;
        self.require(id).await
    }

    pub fn is_lapsed(&self, session: &SyncSession, now: i64) -> bool {
        !session.is_completed()
            && now.saturating_sub(session.last_connection_time) > duration_ms(self.timeout)
    }

    /// Error every open session idle past the timeout
    pub async fn close_lapsed_sessions(&self) -> Result<u64> {
        self.close_lapsed_sessions_at(now_ms()).await
    }

    pub async fn close_lapsed_sessions_at(&self, now: i64) -> Result<u64> {
        let cutoff = now.saturating_sub(duration_ms(self.timeout));
        let ids = self
            .open_ids("last_connection_time < ?1", libsql::params![cutoff])
            .await?;
        for id in &ids {
            self.mark_errored_at(id, TIMED_OUT_MESSAGE, now).await?;
        }
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "Closed lapsed sync sessions");
        }
        Ok(ids.len() as u64)
    }

    /// Close a device's other open sessions when it starts a new one
    pub async fn close_device_sessions(&self, device_id: &str, keep: &str) -> Result<u64> {
        let ids = self
            .open_ids("device_id = ?1 AND id != ?2", libsql::params![device_id, keep])
            .await?;
        for id in &ids {
            self.mark_errored(id, DEVICE_RECONNECTED_MESSAGE).await?;
        }
        Ok(ids.len() as u64)
    }

    /// Merge keys into an open session's debug info
    pub async fn add_debug_info(
        &self,
        id: &str,
        info: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let session = self.require_open(id).await?;
        let mut debug_info = session.debug_info;
        debug_info.extend(info.iter().map(|(key, value)| (key.clone(), value.clone())));
        let changed = self
            .conn
            .execute(
                "UPDATE sync_sessions SET debug_info = ?1
                 WHERE id = ?2 AND completed_at IS NULL",
                libsql::params![serde_json::to_string(&debug_info)?, id],
            )
            .await?;
        if changed == 0 {
            return Err(Error::SessionCompleted(id.to_string()));
        }
        Ok(())
    }

    /// Most recently started sessions first
    pub async fn recent(&self, limit: u32) -> Result<Vec<SyncSession>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM sync_sessions
                     ORDER BY start_time DESC, id DESC LIMIT ?"
                ),
                [i64::from(limit)],
            )
            .await?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(Self::parse_session(&row)?);
        }
        Ok(sessions)
    }

    /// Sessions that have neither completed nor errored
    pub async fn count_open(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_sessions WHERE completed_at IS NULL",
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(u64::try_from(row.get::<i64>(0)?).unwrap_or_default()),
            None => Ok(0),
        }
    }

    /// Open sessions belonging to other devices
    pub async fn count_open_excluding(&self, device_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_sessions
                 WHERE completed_at IS NULL AND (device_id IS NULL OR device_id != ?)",
                [device_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(u64::try_from(row.get::<i64>(0)?).unwrap_or_default()),
            None => Ok(0),
        }
    }

    pub async fn update_parameters(&self, id: &str, parameters: &SessionParameters) -> Result<()> {
        self.require_open(id).await?;
        self.conn
            .execute(
                "UPDATE sync_sessions SET parameters = ?1 WHERE id = ?2 AND completed_at IS NULL",
                libsql::params![serde_json::to_string(parameters)?, id],
            )
            .await?;
        Ok(())
    }

    async fn open_ids(
        &self,
        condition: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT id FROM sync_sessions
                     WHERE completed_at IS NULL AND {condition}
                     ORDER BY id"
                ),
                params,
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    fn parse_session(row: &Row) -> Result<SyncSession> {
        let status: String = row.get(2)?;
        let errors: String = row.get(12)?;
        let debug_info: String = row.get(13)?;
        let parameters: String = row.get(14)?;
        Ok(SyncSession {
            id: row.get(0)?,
            device_id: row.get(1)?,
            status: status.parse().map_err(Error::Database)?,
            start_time: row.get(3)?,
            last_connection_time: row.get(4)?,
            snapshot_started_at: row.get(5)?,
            snapshot_completed_at: row.get(6)?,
            persist_completed_at: row.get(7)?,
            completed_at: row.get(8)?,
            started_at_tick: row.get::<Option<i64>>(9)?.map(SyncTick::new),
            pull_since: row.get::<Option<i64>>(10)?.map(SyncTick::new),
            pull_until: row.get::<Option<i64>>(11)?.map(SyncTick::new),
            errors: serde_json::from_str(&errors)?,
            debug_info: serde_json::from_str(&debug_info)?,
            parameters: serde_json::from_str(&parameters)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const TIMEOUT: Duration = Duration::from_secs(600);
    const NOW: i64 = 1_700_000_000_000;

    async fn walk_to(sessions: &SyncSessions<'_>, id: &str, statuses: &[SessionStatus]) {
        for status in statuses {
            sessions.transition(id, *status).await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_and_get() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);

        let parameters = SessionParameters {
            facility_ids: vec!["f1".to_string()],
            ..SessionParameters::default()
        };
        let session = sessions.create(Some("d1"), &parameters).await.unwrap();

        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.device_id.as_deref(), Some("d1"));
        assert_eq!(session.parameters, parameters);
        assert!(session.errors.is_empty());
        assert_eq!(sessions.get("missing").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_lifecycle() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let session = sessions
            .create(None, &SessionParameters::default())
            .await
            .unwrap();

        walk_to(
            &sessions,
            &session.id,
            &[
                SessionStatus::SnapshotInProgress,
                SessionStatus::SnapshotComplete,
                SessionStatus::PersistInProgress,
            ],
        )
        .await;

        // Completing requires persistence to have finished
        assert!(matches!(
            sessions.complete(&session.id).await.unwrap_err(),
            Error::InvalidSessionTransition { .. }
        ));

        sessions.complete_persist(&session.id).await.unwrap();
        let done = sessions.complete(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Complete);
        assert!(done.snapshot_started_at.is_some());
        assert!(done.snapshot_completed_at.is_some());
        assert!(done.persist_completed_at.is_some());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_skipping_a_state_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let session = sessions
            .create(None, &SessionParameters::default())
            .await
            .unwrap();

        let err = sessions
            .transition(&session.id, SessionStatus::PersistInProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidSessionTransition {
                from: SessionStatus::Created,
                to: SessionStatus::PersistInProgress,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_started_at_tick_is_set_once() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let session = sessions
            .create(None, &SessionParameters::default())
            .await
            .unwrap();

        sessions
            .mark_as_started_at(&session.id, SyncTick::new(7))
            .await
            .unwrap();
        assert!(sessions
            .mark_as_started_at(&session.id, SyncTick::new(8))
            .await
            .is_err());
        assert_eq!(
            sessions.require(&session.id).await.unwrap().started_at_tick,
            Some(SyncTick::new(7))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_errored_session_is_visible_and_final() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let session = sessions
            .create(None, &SessionParameters::default())
            .await
            .unwrap();
        walk_to(&sessions, &session.id, &[SessionStatus::SnapshotInProgress]).await;

        let errored = sessions
            .mark_errored(&session.id, "snapshot failed")
            .await
            .unwrap();
        assert_eq!(errored.status, SessionStatus::Errored);
        assert_eq!(errored.last_error(), Some("snapshot failed"));
        assert!(errored.completed_at.is_some());

        match sessions.require_open(&session.id).await.unwrap_err() {
            Error::SessionErrored { message, .. } => assert_eq!(message, "snapshot failed"),
            other => panic!("expected SessionErrored, got {other:?}"),
        }
        assert!(matches!(
            sessions.mark_errored(&session.id, "again").await.unwrap_err(),
            Error::SessionCompleted(_)
        ));
        assert!(sessions
            .transition(&session.id, SessionStatus::SnapshotComplete)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_after_timeout_errors_session() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let session = sessions
            .create_at(None, &SessionParameters::default(), NOW)
            .await
            .unwrap();

        let refreshed = sessions.connect_at(&session.id, NOW + 1_000).await.unwrap();
        assert_eq!(refreshed.last_connection_time, NOW + 1_000);

        let late = NOW + 1_000 + duration_ms(TIMEOUT) + 1;
        match sessions.connect_at(&session.id, late).await.unwrap_err() {
            Error::SessionErrored { message, .. } => assert_eq!(message, TIMED_OUT_MESSAGE),
            other => panic!("expected SessionErrored, got {other:?}"),
        }
        assert!(sessions.require(&session.id).await.unwrap().is_errored());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_lapsed_sessions() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let old = sessions
            .create_at(None, &SessionParameters::default(), NOW)
            .await
            .unwrap();
        let fresh = sessions
            .create_at(None, &SessionParameters::default(), NOW + duration_ms(TIMEOUT))
            .await
            .unwrap();

        let closed = sessions
            .close_lapsed_sessions_at(NOW + duration_ms(TIMEOUT) + 1)
            .await
            .unwrap();
        assert_eq!(closed, 1);
        assert!(sessions.require(&old.id).await.unwrap().is_errored());
        assert!(!sessions.require(&fresh.id).await.unwrap().is_completed());
        assert_eq!(sessions.count_open().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnecting_device_closes_stale_sessions() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let stale = sessions
            .create(Some("d1"), &SessionParameters::default())
            .await
            .unwrap();
        let other = sessions
            .create(Some("d2"), &SessionParameters::default())
            .await
            .unwrap();
        let current = sessions
            .create(Some("d1"), &SessionParameters::default())
            .await
            .unwrap();

        let closed = sessions
            .close_device_sessions("d1", &current.id)
            .await
            .unwrap();
        assert_eq!(closed, 1);

        let stale = sessions.require(&stale.id).await.unwrap();
        assert_eq!(stale.last_error(), Some(DEVICE_RECONNECTED_MESSAGE));
        assert!(!sessions.require(&other.id).await.unwrap().is_completed());
        assert!(!sessions.require(&current.id).await.unwrap().is_completed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_debug_info_merges() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let session = sessions
            .create(None, &SessionParameters::default())
            .await
            .unwrap();

        let first = serde_json::json!({"a": 1, "b": 2});
        let second = serde_json::json!({"b": 3});
        sessions
            .add_debug_info(&session.id, first.as_object().unwrap())
            .await
            .unwrap();
        sessions
            .add_debug_info(&session.id, second.as_object().unwrap())
            .await
            .unwrap();

        let session = sessions.require(&session.id).await.unwrap();
        assert_eq!(
            serde_json::Value::Object(session.debug_info),
            serde_json::json!({"a": 1, "b": 3})
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_debug_info_frozen_once_completed() {
        let db = Database::open_in_memory().await.unwrap();
        let sessions = SyncSessions::new(db.connection(), TIMEOUT);
        let session = sessions
            .create(None, &SessionParameters::default())
            .await
            .unwrap();
        sessions.mark_errored(&session.id, "boom").await.unwrap();

        let late = serde_json::json!({"late": 1});
        assert!(matches!(
            sessions
                .add_debug_info(&session.id, late.as_object().unwrap())
                .await
                .unwrap_err(),
            Error::SessionErrored { .. }
        ));
        let session = sessions.require(&session.id).await.unwrap();
        assert!(session.debug_info.is_empty());
    }
}
