//! SQLite database layer for workflow persistence.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::OrchestratorError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, OrchestratorError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| OrchestratorError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| OrchestratorError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, OrchestratorError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            OrchestratorError::Database(format!("Failed to open in-memory db: {}", e))
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| OrchestratorError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| OrchestratorError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| OrchestratorError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| OrchestratorError::Database(format!("Task join error: {}", e)))?
    }

    /// Run a closure inside a transaction. The transaction commits only when
    /// the closure returns `Ok`; domain errors (e.g. `Conflict`) roll it back.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, OrchestratorError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| OrchestratorError::Database(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub async fn transaction_async<F, T>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, OrchestratorError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.transaction(f))
            .await
            .map_err(|e| OrchestratorError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), OrchestratorError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS proposals (
                    id              TEXT PRIMARY KEY,
                    title           TEXT NOT NULL,
                    content         TEXT NOT NULL DEFAULT '',
                    metadata        TEXT NOT NULL DEFAULT '{}',
                    submitted_by    TEXT,
                    created_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    proposal_id     TEXT NOT NULL REFERENCES proposals(id),
                    workflow_type   TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'PENDING',
                    recommendation  TEXT,
                    diagnostics     TEXT NOT NULL DEFAULT '[]',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    completed_at    INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
                CREATE INDEX IF NOT EXISTS idx_workflows_proposal ON workflows(proposal_id);

                CREATE TABLE IF NOT EXISTS workflow_tasks (
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id),
                    id              TEXT NOT NULL,
                    position        INTEGER NOT NULL,
                    kind            TEXT NOT NULL,
                    dependencies    TEXT NOT NULL DEFAULT '[]',
                    policy          TEXT NOT NULL DEFAULT '{\"mode\":\"all\"}',
                    status          TEXT NOT NULL DEFAULT 'PENDING',
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    skip_reason     TEXT,
                    started_at      INTEGER,
                    finished_at     INTEGER,
                    PRIMARY KEY (workflow_id, id)
                );

                CREATE TABLE IF NOT EXISTS agent_results (
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id),
                    task_id         TEXT NOT NULL,
                    agent           TEXT NOT NULL,
                    findings        TEXT NOT NULL DEFAULT '{}',
                    score           REAL,
                    summary         TEXT,
                    inputs          TEXT NOT NULL DEFAULT '[]',
                    created_at      INTEGER NOT NULL,
                    PRIMARY KEY (workflow_id, task_id)
                );

                CREATE TABLE IF NOT EXISTS agent_failures (
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id),
                    task_id         TEXT NOT NULL,
                    agent           TEXT NOT NULL,
                    kind            TEXT NOT NULL,
                    message         TEXT NOT NULL,
                    retryable       INTEGER NOT NULL DEFAULT 0,
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    created_at      INTEGER NOT NULL,
                    PRIMARY KEY (workflow_id, task_id)
                );

                CREATE TABLE IF NOT EXISTS human_feedback (
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id),
                    seq             INTEGER NOT NULL,
                    task_id         TEXT,
                    annotation      TEXT NOT NULL,
                    rating          INTEGER,
                    author          TEXT,
                    created_at      INTEGER NOT NULL,
                    PRIMARY KEY (workflow_id, seq)
                );
                ",
            )
        })?;
        self.run_migrations()
    }

    /// Apply incremental migrations for schema changes on existing databases.
    fn run_migrations(&self) -> Result<(), OrchestratorError> {
        self.with_conn(|conn| {
            // Databases created before completion timestamps were tracked
            let _ = conn.execute("ALTER TABLE workflows ADD COLUMN completed_at INTEGER", []);
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_workflows_created ON workflows(created_at);",
            )
        })
    }
}
