//! Runtime state tracking: shutdown detection and the auto-delete flag.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

impl Database {
    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call set_clean_shutdown(),
    /// indicating a crash or forced termination.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value = self.get_runtime_value("clean_shutdown").await?;
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that the application has started
    ///
    /// If shutdown() is not called before the next startup, was_unclean_shutdown()
    /// will return true.
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_runtime_value("clean_shutdown", "false").await
    }

    /// Mark that the application is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_runtime_value("clean_shutdown", "true").await
    }

    /// Persisted auto-delete flag, if it was ever toggled
    pub async fn get_auto_delete(&self) -> Result<Option<bool>> {
        let value = self.get_runtime_value("auto_delete").await?;
        Ok(value.map(|v| v == "true"))
    }

    /// Persist the auto-delete flag
    pub async fn set_auto_delete(&self, enabled: bool) -> Result<()> {
        self.set_runtime_value("auto_delete", if enabled { "true" } else { "false" })
            .await
    }

    async fn get_runtime_value(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM runtime_state WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read runtime state '{}': {}",
                key, e
            )))
        })?;

        Ok(value)
    }

    async fn set_runtime_value(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set runtime state '{}': {}",
                key, e
            )))
        })?;

        Ok(())
    }
}
