//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::Database;

/// One schema step: its version, a label for logs and the statements it runs
struct Migration {
    version: i64,
    label: &'static str,
    statements: &'static [&'static str],
}

/// Schema history, oldest first
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        label: "job groups and jobs",
        statements: &[
            r#"
            CREATE TABLE job_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_chat TEXT NOT NULL,
                trigger_message_id INTEGER NOT NULL,
                status_chat TEXT,
                status_message_id INTEGER,
                requested INTEGER NOT NULL,
                boundary TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX idx_job_groups_trigger ON job_groups(trigger_chat, trigger_message_id)",
            r#"
            CREATE TABLE jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL REFERENCES job_groups(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                source TEXT NOT NULL,
                destination_path TEXT NOT NULL,
                state INTEGER NOT NULL DEFAULT 0,
                bytes_total INTEGER,
                bytes_transferred INTEGER NOT NULL DEFAULT 0,
                upload_session_token TEXT,
                error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                object_id TEXT,
                object_path TEXT,
                object_size INTEGER,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )
            "#,
            "CREATE INDEX idx_jobs_group ON jobs(group_id, position)",
            "CREATE INDEX idx_jobs_state ON jobs(state)",
        ],
    },
    Migration {
        version: 2,
        label: "runtime state",
        statements: &[
            r#"
            CREATE TABLE runtime_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "INSERT INTO runtime_state (key, value, updated_at) \
             VALUES ('clean_shutdown', 'false', CAST(strftime('%s', 'now') AS INTEGER))",
        ],
    },
    Migration {
        version: 3,
        label: "group completion",
        statements: &["ALTER TABLE job_groups ADD COLUMN finished_at INTEGER"],
    },
];

fn connect_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::ConnectionFailed(format!("{context}: {e}")))
}

fn migration_failed(version: i64, context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| {
        Error::Database(DatabaseError::MigrationFailed(format!(
            "v{version}: {context}: {e}"
        )))
    }
}

impl Database {
    /// Open the relay database at `path`
    ///
    /// Creates the file and its parent directory if missing, then brings the schema up to date.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(connect_failed("invalid database path"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(connect_failed("cannot open database"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(connect_failed("cannot acquire connection"))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&mut *conn)
        .await
        .map_err(migration_failed(0, "schema_version table"))?;

        let applied: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::Database(DatabaseError::QueryFailed(e.to_string())))?;

        for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
            apply(&mut conn, migration).await?;
        }
        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Run one migration inside a transaction; a failing statement rolls the whole step back
async fn apply(conn: &mut SqliteConnection, migration: &Migration) -> Result<()> {
    let version = migration.version;
    tracing::info!(version, label = migration.label, "applying database migration");

    sqlx::query("BEGIN")
        .execute(&mut *conn)
        .await
        .map_err(migration_failed(version, "begin"))?;

    let outcome = async {
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(migration_failed(version, migration.label))?;
        }
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(migration_failed(version, "record version"))?;
        Ok::<_, Error>(())
    }
    .await;

    match outcome {
        Ok(()) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(migration_failed(version, "commit"))?;
            Ok(())
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}
