//! SQLite-backed store: one row per run holding the JSON snapshot, with the
//! version column compared inside the `UPDATE`.

use super::{RunFilter, WorkflowStore};
use crate::error::StoreError;
use crate::types::{RunId, StepId, WorkflowRun};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workflow_runs (
    id            TEXT PRIMARY KEY,
    definition_id TEXT NOT NULL,
    status        TEXT NOT NULL,
    version       INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    snapshot      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);
";

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        StoreError::Backend(value.to_string())
    }
}

/// Blocking `rusqlite` calls run on tokio's blocking pool, one at a time
/// behind the connection mutex.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "sqlite workflow store ready");
        Ok(store)
    }

    /// Private database, gone when the store is dropped
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StoreError::Backend(format!("sqlite task failed: {e}")))?
    }

    fn read_snapshot(conn: &Connection, run_id: RunId) -> Result<WorkflowRun, StoreError> {
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM workflow_runs WHERE id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let snapshot = snapshot.ok_or(StoreError::NotFound(run_id))?;
        Ok(serde_json::from_str(&snapshot)?)
    }

    fn write_snapshot(
        conn: &Connection,
        run: &WorkflowRun,
        expected_version: u64,
    ) -> Result<usize, StoreError> {
        let snapshot = serde_json::to_string(run)?;
        Ok(conn.execute(
            "UPDATE workflow_runs SET status = ?1, version = ?2, snapshot = ?3
             WHERE id = ?4 AND version = ?5",
            params![
                run.status.as_str(),
                run.version as i64,
                snapshot,
                run.id.to_string(),
                expected_version as i64
            ],
        )?)
    }

    async fn mutate<F>(&self, run_id: RunId, f: F) -> Result<WorkflowRun, StoreError>
    where
        F: FnOnce(&mut WorkflowRun) + Send + 'static,
    {
        self.blocking(move |conn| {
            let mut run = Self::read_snapshot(conn, run_id)?;
            let expected = run.version;
            f(&mut run);
            run.version += 1;
            run.updated_at = Utc::now();
            Self::write_snapshot(conn, &run, expected)?;
            Ok(run)
        })
        .await
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn insert(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        let snapshot = serde_json::to_string(&run)?;
        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO workflow_runs (id, definition_id, status, version, created_at, snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id.to_string(),
                    run.definition_id.as_str(),
                    run.status.as_str(),
                    run.version as i64,
                    run.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    snapshot
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists(run.id));
            }
            Ok(run)
        })
        .await
    }

    async fn load(&self, run_id: RunId) -> Result<WorkflowRun, StoreError> {
        self.blocking(move |conn| Self::read_snapshot(conn, run_id))
            .await
    }

    async fn save(&self, mut run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        self.blocking(move |conn| {
            let expected = run.version;
            run.version += 1;
            if Self::write_snapshot(conn, &run, expected)? == 1 {
                return Ok(run);
            }
            let found: Option<i64> = conn
                .query_row(
                    "SELECT version FROM workflow_runs WHERE id = ?1",
                    params![run.id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match found {
                Some(found) => Err(StoreError::VersionConflict {
                    run_id: run.id,
                    expected,
                    found: found as u64,
                }),
                None => Err(StoreError::NotFound(run.id)),
            }
        })
        .await
    }

    async fn append_result(
        &self,
        run_id: RunId,
        step: &StepId,
        payload: Value,
    ) -> Result<WorkflowRun, StoreError> {
        let step = step.clone();
        self.mutate(run_id, move |run| {
            run.results.insert(step, payload);
        })
        .await
    }

    async fn append_error(
        &self,
        run_id: RunId,
        step: &StepId,
        message: String,
    ) -> Result<WorkflowRun, StoreError> {
        let step = step.clone();
        self.mutate(run_id, move |run| {
            run.errors.insert(step, message);
        })
        .await
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let filter = filter.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT snapshot FROM workflow_runs
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR definition_id = ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )?;
            let limit = filter.limit.map_or(-1, |l| l as i64);
            let rows = stmt.query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.definition_id.as_ref().map(|d| d.as_str()),
                    limit
                ],
                |row| row.get::<_, String>(0),
            )?;
            let mut runs = Vec::new();
            for snapshot in rows {
                runs.push(serde_json::from_str(&snapshot?)?);
            }
            Ok(runs)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn run(definition: &str) -> WorkflowRun {
        WorkflowRun::new(definition.into(), vec![], BTreeSet::new(), json!({ "brand": "acme" }))
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");

        let inserted = {
            let store = SqliteStore::open(&path).unwrap();
            let r = store.insert(run("campaign")).await.unwrap();
            store
                .append_result(r.id, &"brief".into(), json!({ "headline": "Go" }))
                .await
                .unwrap()
        };

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load(inserted.id).await.unwrap();
        assert_eq!(loaded, inserted);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn stale_save_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let stale = store.insert(run("campaign")).await.unwrap();
        let id = stale.id;

        let mut fresh = store.load(id).await.unwrap();
        fresh.status = RunStatus::Running;
        store.save(fresh).await.unwrap();

        let err = store.save(stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert_eq!(store.load(id).await.unwrap().status, RunStatus::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_appends_all_land() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.insert(run("campaign")).await.unwrap().id;

        let writers = (0..8).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append_result(id, &StepId::from(format!("step-{i}")), json!(i))
                    .await
            })
        });
        for writer in writers.collect::<Vec<_>>() {
            writer.await.unwrap().unwrap();
        }

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.results.len(), 8);
        assert_eq!(loaded.version, 8);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let id = RunId::new();
        assert!(matches!(store.load(id).await, Err(StoreError::NotFound(found)) if found == id));
        let mut ghost = run("campaign");
        ghost.id = id;
        assert!(matches!(store.save(ghost).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_definition() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.insert(run("a")).await.unwrap();
        store.insert(run("b")).await.unwrap();

        let mut running = a.clone();
        running.status = RunStatus::Running;
        store.save(running).await.unwrap();

        let all = store.list(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_running = store
            .list(&RunFilter::default().with_status(RunStatus::Running))
            .await
            .unwrap();
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, a.id);

        let only_b = store
            .list(&RunFilter::default().with_definition("b".into()).with_limit(5))
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].definition_id.as_str(), "b");
    }
}
