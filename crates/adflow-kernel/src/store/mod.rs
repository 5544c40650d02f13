//! Workflow State Store
//!
//! Pluggable persistence for [`WorkflowRun`] snapshots. Every `save` is
//! guarded by the snapshot's `version`: a writer holding a stale copy gets
//! [`StoreError::VersionConflict`] instead of overwriting newer state.
//! [`update_run`] wraps load, mutate and save in a retry loop so callers get
//! atomic read-modify-write per run.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::{DefinitionId, RunId, RunStatus, StepId, WorkflowRun};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Selection for [`WorkflowStore::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunFilter {
    /// Only runs in this status
    pub status: Option<RunStatus>,
    /// Only runs of this definition
    pub definition_id: Option<DefinitionId>,
    /// At most this many runs
    pub limit: Option<usize>,
}

impl RunFilter {
    /// Restrict to `status`
    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to `definition_id`
    #[must_use]
    pub fn with_definition(mut self, definition_id: DefinitionId) -> Self {
        self.definition_id = Some(definition_id);
        self
    }

    /// Cap the result count
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `run` passes the status and definition filters
    #[must_use]
    pub fn matches(&self, run: &WorkflowRun) -> bool {
        self.status.map_or(true, |s| s == run.status)
            && self
                .definition_id
                .as_ref()
                .map_or(true, |d| d == &run.definition_id)
    }
}

/// Persistence for run snapshots
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Store a new run. Fails if the id is taken.
    async fn insert(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError>;

    /// Latest saved snapshot, or `NotFound`
    async fn load(&self, run_id: RunId) -> Result<WorkflowRun, StoreError>;

    /// Replace the stored snapshot if `run.version` matches the stored
    /// version. Returns the snapshot as saved, with its version bumped.
    async fn save(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError>;

    /// Set `results[step]` under the store's own lock
    async fn append_result(
        &self,
        run_id: RunId,
        step: &StepId,
        payload: Value,
    ) -> Result<WorkflowRun, StoreError>;

    /// Set `errors[step]` under the store's own lock
    async fn append_error(
        &self,
        run_id: RunId,
        step: &StepId,
        message: String,
    ) -> Result<WorkflowRun, StoreError>;

    /// Matching runs, newest first
    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError>;
}

/// Load, mutate and save `run_id`, reloading and re-applying `mutate` when a
/// concurrent writer got there first. An error from `mutate` aborts without
/// saving.
pub async fn update_run<T, E, F>(
    store: &dyn WorkflowStore,
    run_id: RunId,
    attempts: u32,
    mut mutate: F,
) -> Result<(WorkflowRun, T), E>
where
    F: FnMut(&mut WorkflowRun) -> Result<T, E> + Send,
    T: Send,
    E: From<StoreError>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let mut run = store.load(run_id).await?;
        let value = mutate(&mut run)?;
        run.updated_at = Utc::now();
        match store.save(run).await {
            Ok(saved) => return Ok((saved, value)),
            Err(StoreError::VersionConflict {
                expected, found, ..
            }) => {
                tracing::debug!(run_id = %run_id, attempt, expected, found, "version conflict, retrying update");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Contention { run_id, attempts }.into())
}

/// Open the backend named by the configuration.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn WorkflowStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path)?)),
    }
}

/// Apply a filter's ordering and limit to an unordered selection.
pub(crate) fn newest_first(mut runs: Vec<WorkflowRun>, filter: &RunFilter) -> Vec<WorkflowRun> {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    if let Some(limit) = filter.limit {
        runs.truncate(limit);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn run() -> WorkflowRun {
        WorkflowRun::new("campaign".into(), vec![], BTreeSet::new(), json!({}))
    }

    #[tokio::test]
    async fn update_run_applies_mutation_once_saved() {
        let store = MemoryStore::new();
        let inserted = store.insert(run()).await.unwrap();

        let (saved, seen) = update_run::<_, StoreError, _>(&store, inserted.id, 3, |run| {
            run.retry_count += 1;
            Ok(run.retry_count)
        })
        .await
        .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(saved.version, inserted.version + 1);
        assert_eq!(store.load(inserted.id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn failed_mutation_saves_nothing() {
        let store = MemoryStore::new();
        let inserted = store.insert(run()).await.unwrap();

        let result = update_run::<(), _, _>(&store, inserted.id, 3, |run| {
            run.retry_count = 99;
            Err(StoreError::Backend("refused".into()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(store.load(inserted.id).await.unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn update_of_missing_run_is_not_found() {
        let store = MemoryStore::new();
        let missing = RunId::new();
        let result = update_run::<(), StoreError, _>(&store, missing, 3, |_| Ok(())).await;
        assert!(matches!(result, Err(StoreError::NotFound(id)) if id == missing));
    }

    #[test]
    fn filter_matches_status_and_definition() {
        let r = run();
        assert!(RunFilter::default().matches(&r));
        assert!(RunFilter::default().with_status(RunStatus::Pending).matches(&r));
        assert!(!RunFilter::default().with_status(RunStatus::Running).matches(&r));
        assert!(!RunFilter::default()
            .with_definition("other".into())
            .matches(&r));
    }
}
