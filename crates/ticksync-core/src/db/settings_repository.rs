//! Settings repository implementation

use crate::error::Result;
use libsql::Connection;

/// Trait for settings storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SettingsRepository {
    /// Read a setting, preferring the facility value over the global one
    async fn get(&self, key: &str, facility_id: Option<&str>)
        -> Result<Option<serde_json::Value>>;

    /// Store a setting; `None` sets the global value
    async fn set(
        &self,
        key: &str,
        facility_id: Option<&str>,
        value: &serde_json::Value,
    ) -> Result<()>;
}

/// libSQL implementation of `SettingsRepository`
pub struct LibSqlSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for LibSqlSettingsRepository<'_> {
    async fn get(
        &self,
        key: &str,
        facility_id: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        let facility_id = facility_id.unwrap_or_default();
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM settings
                 WHERE key = ?1 AND facility_id IN (?2, '')
                 ORDER BY facility_id = '' ASC
                 LIMIT 1",
                [key, facility_id],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&value)?))
        } else {
            Ok(None)
        }
    }

    async fn set(
        &self,
        key: &str,
        facility_id: Option<&str>,
        value: &serde_json::Value,
    ) -> Result<()> {
        let value = serde_json::to_string(value)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, facility_id, value) VALUES (?, ?, ?)",
                [key, facility_id.unwrap_or_default(), value.as_str()],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_setting_is_none() {
        let db = setup().await;
        let repo = LibSqlSettingsRepository::new(db.connection());

        assert_eq!(repo.get("syncAllLabRequests", Some("f1")).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_facility_value_overrides_global() {
        let db = setup().await;
        let repo = LibSqlSettingsRepository::new(db.connection());

        repo.set("syncAllLabRequests", None, &json!(false))
            .await
            .unwrap();
        repo.set("syncAllLabRequests", Some("f1"), &json!(true))
            .await
            .unwrap();

        assert_eq!(
            repo.get("syncAllLabRequests", Some("f1")).await.unwrap(),
            Some(json!(true))
        );
        assert_eq!(
            repo.get("syncAllLabRequests", Some("f2")).await.unwrap(),
            Some(json!(false))
        );
        assert_eq!(
            repo.get("syncAllLabRequests", None).await.unwrap(),
            Some(json!(false))
        );
    }
}
