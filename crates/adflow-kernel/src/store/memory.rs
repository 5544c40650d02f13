use super::{newest_first, RunFilter, WorkflowStore};
use crate::error::StoreError;
use crate::types::{RunId, StepId, WorkflowRun};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// In-process store with one mutex per run
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<RunId, Arc<Mutex<WorkflowRun>>>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, run_id: RunId) -> Result<Arc<Mutex<WorkflowRun>>, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::NotFound(run_id))
    }

    fn mutate<F>(&self, run_id: RunId, f: F) -> Result<WorkflowRun, StoreError>
    where
        F: FnOnce(&mut WorkflowRun),
    {
        let slot = self.slot(run_id)?;
        let mut run = slot.lock();
        f(&mut run);
        run.version += 1;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id));
        }
        runs.insert(run.id, Arc::new(Mutex::new(run.clone())));
        Ok(run)
    }

    async fn load(&self, run_id: RunId) -> Result<WorkflowRun, StoreError> {
        let slot = self.slot(run_id)?;
        let run = slot.lock().clone();
        Ok(run)
    }

    async fn save(&self, mut run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        let slot = self.slot(run.id)?;
        let mut stored = slot.lock();
        if stored.version != run.version {
            return Err(StoreError::VersionConflict {
                run_id: run.id,
                expected: run.version,
                found: stored.version,
            });
        }
        run.version += 1;
        *stored = run.clone();
        Ok(run)
    }

    async fn append_result(
        &self,
        run_id: RunId,
        step: &StepId,
        payload: Value,
    ) -> Result<WorkflowRun, StoreError> {
        self.mutate(run_id, |run| {
            run.results.insert(step.clone(), payload);
        })
    }

    async fn append_error(
        &self,
        run_id: RunId,
        step: &StepId,
        message: String,
    ) -> Result<WorkflowRun, StoreError> {
        self.mutate(run_id, |run| {
            run.errors.insert(step.clone(), message);
        })
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let slots: Vec<_> = self.runs.read().values().cloned().collect();
        let selected = slots
            .iter()
            .map(|slot| slot.lock().clone())
            .filter(|run| filter.matches(run))
            .collect();
        Ok(newest_first(selected, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn run(definition: &str) -> WorkflowRun {
        WorkflowRun::new(definition.into(), vec![], BTreeSet::new(), json!({}))
    }

    #[tokio::test]
    async fn stale_save_is_rejected() {
        let store = MemoryStore::new();
        let inserted = store.insert(run("d")).await.unwrap();

        let mut first = store.load(inserted.id).await.unwrap();
        let mut second = store.load(inserted.id).await.unwrap();
        first.retry_count = 1;
        second.retry_count = 2;

        let saved = store.save(first).await.unwrap();
        assert_eq!(saved.version, 1);
        let err = store.save(second).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert_eq!(store.load(inserted.id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let store = MemoryStore::new();
        let r = store.insert(run("d")).await.unwrap();
        assert!(matches!(
            store.insert(r.clone()).await,
            Err(StoreError::AlreadyExists(id)) if id == r.id
        ));
    }

    #[tokio::test]
    async fn appends_bump_version() {
        let store = MemoryStore::new();
        let r = store.insert(run("d")).await.unwrap();
        let after = store
            .append_result(r.id, &"brief".into(), json!({ "headline": "Go" }))
            .await
            .unwrap();
        assert_eq!(after.version, 1);
        let after = store
            .append_error(r.id, &"assets".into(), "quota".into())
            .await
            .unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.result("brief"), Some(&json!({ "headline": "Go" })));
        assert_eq!(after.errors.get("assets").map(String::as_str), Some("quota"));
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let store = MemoryStore::new();
        for definition in ["a", "a", "b"] {
            store.insert(run(definition)).await.unwrap();
        }
        let a_runs = store
            .list(&RunFilter::default().with_definition("a".into()))
            .await
            .unwrap();
        assert_eq!(a_runs.len(), 2);
        assert!(a_runs[0].created_at >= a_runs[1].created_at);

        let limited = store.list(&RunFilter::default().with_limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        let running = store
            .list(&RunFilter::default().with_status(RunStatus::Running))
            .await
            .unwrap();
        assert!(running.is_empty());
    }
}
