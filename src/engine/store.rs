// src/engine/store.rs

//! Model store contract and two implementations.
//!
//! `update` is an optimistic merge: it re-reads the latest stored entity and
//! overlays only the fields carried by the [`AnalysisUpdate`]. It never
//! blind-overwrites the entity, so concurrent edits to unrelated attributes
//! survive an analysis write.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::engine::run::{AnalysisUpdate, Entity};
use crate::errors::{Result, StatdagError};
use crate::types::AnalysisStatus;

/// Persistence capability the orchestrator consumes.
pub trait ModelStore<O>: Send + Sync + 'static {
    /// Fetch the latest stored state of an entity.
    fn get_latest<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>>;

    /// Overlay `update` on the latest stored state of `model` and return the
    /// merged entity. Fails with `RunSuperseded`, storing nothing, when the
    /// update belongs to a run other than the stored one.
    fn update<'a>(
        &'a self,
        model: &'a Entity<O>,
        update: AnalysisUpdate<O>,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>>;
}

impl<O, T: ModelStore<O> + ?Sized> ModelStore<O> for Arc<T> {
    fn get_latest<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>> {
        (**self).get_latest(id)
    }

    fn update<'a>(
        &'a self,
        model: &'a Entity<O>,
        update: AnalysisUpdate<O>,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>> {
        (**self).update(model, update)
    }
}

/// Process-local store. Records every written status per entity.
pub struct InMemoryModelStore<O> {
    entities: Mutex<HashMap<String, Entity<O>>>,
    history: Mutex<HashMap<String, Vec<AnalysisStatus>>>,
}

impl<O> Default for InMemoryModelStore<O> {
    fn default() -> Self {
        Self {
            entities: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }
}

impl<O: Clone> InMemoryModelStore<O> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entities(&self) -> MutexGuard<'_, HashMap<String, Entity<O>>> {
        self.entities.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, HashMap<String, Vec<AnalysisStatus>>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, entity: Entity<O>) {
        self.entities().insert(entity.id.clone(), entity);
    }

    pub fn get(&self, id: &str) -> Option<Entity<O>> {
        self.entities().get(id).cloned()
    }

    /// Edit an attribute the way an unrelated writer would.
    pub fn set_attribute(&self, id: &str, key: &str, value: Value) -> Result<()> {
        let mut entities = self.entities();
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| StatdagError::ModelNotFound(id.to_string()))?;
        entity.attributes.insert(key.to_string(), value);
        Ok(())
    }

    /// Statuses written for `id`, oldest first.
    pub fn status_history(&self, id: &str) -> Vec<AnalysisStatus> {
        self.history().get(id).cloned().unwrap_or_default()
    }
}

impl<O> ModelStore<O> for InMemoryModelStore<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn get_latest<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>> {
        Box::pin(async move {
            self.entities()
                .get(id)
                .cloned()
                .ok_or_else(|| StatdagError::ModelNotFound(id.to_string()))
        })
    }

    fn update<'a>(
        &'a self,
        model: &'a Entity<O>,
        update: AnalysisUpdate<O>,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>> {
        Box::pin(async move {
            let status = update.status;
            let merged = {
                let mut entities = self.entities();
                let latest = entities
                    .get_mut(&model.id)
                    .ok_or_else(|| StatdagError::ModelNotFound(model.id.clone()))?;
                latest.analysis.apply(update)?;
                latest.clone()
            };
            self.history().entry(model.id.clone()).or_default().push(status);
            debug!(entity = %model.id, status = %status, "entity analysis updated");
            Ok(merged)
        })
    }
}

/// Stores each entity as `<dir>/<id>.json`.
///
/// Writes go through a temporary file and a rename so a reader never sees a
/// half-written entity.
pub struct JsonFileModelStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !id.starts_with('.');
        if !safe {
            return Err(StatdagError::ConfigError(format!(
                "entity id '{id}' is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Create an empty entity file for `id` unless one already exists.
    pub async fn ensure_entity(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(id)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let entity: Entity<Value> = Entity::new(id);
        write_json(&path, &entity).await?;
        debug!(entity = %id, path = %path.display(), "created entity file");
        Ok(())
    }

    async fn read<O: DeserializeOwned>(&self, id: &str) -> Result<Entity<O>> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StatdagError::ModelNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl<O> ModelStore<O> for JsonFileModelStore
where
    O: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get_latest<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>> {
        Box::pin(self.read(id))
    }

    fn update<'a>(
        &'a self,
        model: &'a Entity<O>,
        update: AnalysisUpdate<O>,
    ) -> Pin<Box<dyn Future<Output = Result<Entity<O>>> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut latest: Entity<O> = self.read(&model.id).await?;
            let status = update.status;
            latest.analysis.apply(update)?;
            write_json(&self.path_for(&model.id)?, &latest).await?;
            debug!(entity = %model.id, status = %status, "entity file updated");
            Ok(latest)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[tokio::test]
    async fn file_store_merges_onto_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileModelStore::new(dir.path().join("models"));
        store.ensure_entity("metric_1").await.unwrap();

        let stale: Entity<u32> = store.get_latest("metric_1").await.unwrap();

        // Another writer edits the file after our read.
        let path = dir.path().join("models/metric_1.json");
        let mut raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["owner"] = json!("growth");
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let merged = store
            .update(&stale, AnalysisUpdate::new(AnalysisStatus::Success, vec![]).result(5))
            .await
            .unwrap();
        assert_eq!(merged.attributes.get("owner"), Some(&json!("growth")));
        assert_eq!(merged.analysis.result, Some(5));

        let reread: Entity<u32> = store.get_latest("metric_1").await.unwrap();
        assert_eq!(reread, merged);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Summary {
        mean: f64,
        label: String,
    }

    #[tokio::test]
    async fn file_store_round_trips_outputs_without_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileModelStore::new(dir.path());
        store.ensure_entity("metric_1").await.unwrap();

        let fresh: Entity<Summary> = store.get_latest("metric_1").await.unwrap();
        assert_eq!(fresh.analysis.result, None);

        let summary = Summary {
            mean: 2.5,
            label: "weekly".to_string(),
        };
        store
            .update(
                &fresh,
                AnalysisUpdate::new(AnalysisStatus::Success, vec![]).result(summary.clone()),
            )
            .await
            .unwrap();

        let reread: Entity<Summary> = store.get_latest("metric_1").await.unwrap();
        assert_eq!(reread.analysis.result, Some(summary));
    }

    #[tokio::test]
    async fn missing_entities_and_bad_ids_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileModelStore::new(dir.path());

        let missing: Result<Entity<u32>> = store.get_latest("nope").await;
        assert!(matches!(missing, Err(StatdagError::ModelNotFound(_))));

        assert!(matches!(
            store.ensure_entity("../escape").await,
            Err(StatdagError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_records_status_history() {
        let store: InMemoryModelStore<u32> = InMemoryModelStore::new();
        store.insert(Entity::new("m"));
        let model = store.get_latest("m").await.unwrap();

        store
            .update(&model, AnalysisUpdate::new(AnalysisStatus::Queued, vec![]))
            .await
            .unwrap();
        store
            .update(&model, AnalysisUpdate::new(AnalysisStatus::Success, vec![]).result(1))
            .await
            .unwrap();

        assert_eq!(
            store.status_history("m"),
            vec![AnalysisStatus::Queued, AnalysisStatus::Success]
        );
        assert!(store.set_attribute("missing", "k", json!(1)).is_err());
    }
}
