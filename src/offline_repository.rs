// offline_repository.rs - Per-collection CRUD + in-memory query/aggregation
// over an arbitrary KeyValuePersister (§4.2).

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{id_of, Entity};
use crate::error::{Error, Result};
use crate::persister::KeyValuePersister;
use crate::promise_queue::PromiseQueue;
use crate::query::{evaluate, evaluate_aggregation, Aggregation, GroupResult, Query};

/// The `active_user` slot is preserved across an app-wide `clear(None)` (§4.2, §6).
pub const ACTIVE_USER_COLLECTION: &str = "active_user";

/// Per-appKey offline cache: every collection is a JSON array stored under
/// `"<appKey>.<collection>"`. Mutating operations are serialized per
/// collection via [`PromiseQueue`]; reads bypass it.
pub struct OfflineRepository {
    persister: Arc<dyn KeyValuePersister>,
    app_key: String,
    queue: PromiseQueue,
}

impl OfflineRepository {
    pub fn new(app_key: impl Into<String>, persister: Arc<dyn KeyValuePersister>) -> Self {
        Self {
            persister,
            app_key: app_key.into(),
            queue: PromiseQueue::new(),
        }
    }

    fn cache_key(&self, collection: &str) -> String {
        format!("{}.{}", self.app_key, collection)
    }

    async fn load(&self, collection: &str) -> Result<Vec<Entity>> {
        match self.persister.get(&self.cache_key(collection)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn store(&self, collection: &str, entities: &[Entity]) -> Result<()> {
        let bytes = serde_json::to_vec(entities)?;
        self.persister.set(&self.cache_key(collection), bytes).await
    }

    /// Appends `entities` to the collection unchanged and returns them.
    pub async fn create(&self, collection: &str, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        self.queue
            .enqueue(collection, || async {
                let mut current = self.load(collection).await?;
                current.extend(entities.iter().cloned());
                self.store(collection, &current).await?;
                Ok(entities)
            })
            .await
    }

    /// Returns entities matching `query`, or every entity when `query` is `None`.
    pub async fn read(&self, collection: &str, query: Option<&Query>) -> Result<Vec<Entity>> {
        let entities = self.load(collection).await?;
        Ok(match query {
            Some(q) => evaluate(entities.iter(), q),
            None => entities,
        })
    }

    /// Returns the single entity with the given `_id`, failing with `NotFound` otherwise.
    pub async fn read_by_id(&self, collection: &str, id: &str) -> Result<Entity> {
        let entities = self.load(collection).await?;
        entities
            .into_iter()
            .find(|e| id_of(e) == Some(id))
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))
    }

    /// Returns the number of entities matching `query`, or the whole count when `None`.
    pub async fn count(&self, collection: &str, query: Option<&Query>) -> Result<usize> {
        Ok(self.read(collection, query).await?.len())
    }

    /// Upserts `entities` by `_id` and returns them unchanged.
    pub async fn update(&self, collection: &str, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        self.queue
            .enqueue(collection, || async {
                let mut current = self.load(collection).await?;
                for incoming in &entities {
                    let Some(id) = id_of(incoming) else {
                        continue;
                    };
                    match current.iter_mut().find(|e| id_of(e) == Some(id)) {
                        Some(slot) => *slot = incoming.clone(),
                        None => current.push(incoming.clone()),
                    }
                }
                self.store(collection, &current).await?;
                Ok(entities)
            })
            .await
    }

    /// Deletes entities matching `query` (or all, when `None`) and returns the count removed.
    pub async fn delete(&self, collection: &str, query: Option<&Query>) -> Result<usize> {
        self.queue
            .enqueue(collection, || async {
                let current = self.load(collection).await?;
                let (removed, kept): (Vec<Entity>, Vec<Entity>) = match query {
                    Some(q) => {
                        let matched = evaluate(current.iter(), q);
                        let matched_ids: std::collections::HashSet<String> = matched
                            .iter()
                            .filter_map(|e| id_of(e).map(str::to_string))
                            .collect();
                        current
                            .into_iter()
                            .partition(|e| id_of(e).map(|id| matched_ids.contains(id)).unwrap_or(false))
                    }
                    None => (current, Vec::new()),
                };
                self.store(collection, &kept).await?;
                Ok(removed.len())
            })
            .await
    }

    /// Deletes the entity with the given `_id`; returns 1 if it existed, 0 otherwise.
    pub async fn delete_by_id(&self, collection: &str, id: &str) -> Result<usize> {
        self.queue
            .enqueue(collection, || async {
                let current = self.load(collection).await?;
                let before = current.len();
                let kept: Vec<Entity> = current.into_iter().filter(|e| id_of(e) != Some(id)).collect();
                let removed = before - kept.len();
                if removed > 0 {
                    self.store(collection, &kept).await?;
                }
                Ok(removed)
            })
            .await
    }

    /// Clears a single collection, or (when `collection` is `None`) every
    /// collection belonging to this app except `active_user` (§4.2).
    pub async fn clear(&self, collection: Option<&str>) -> Result<()> {
        match collection {
            Some(collection) => {
                self.queue
                    .enqueue(collection, || async { self.store(collection, &[]).await })
                    .await
            }
            None => {
                let prefix = format!("{}.", self.app_key);
                let keys = self.persister.keys_with_prefix(&prefix).await?;
                let preserved = self.cache_key(ACTIVE_USER_COLLECTION);
                for key in keys {
                    if key != preserved {
                        self.persister.delete(&key).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Evaluates `aggregation` in-memory over the full collection (§4.2).
    pub async fn group(&self, collection: &str, aggregation: &Aggregation) -> Result<Vec<GroupResult>> {
        let entities = self.load(collection).await?;
        Ok(evaluate_aggregation(entities.iter(), aggregation))
    }
}

/// Serializes the active user record into the reserved, clear-preserved slot.
pub async fn set_active_user(repo: &OfflineRepository, user: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(user)?;
    repo.persister
        .set(&repo.cache_key(ACTIVE_USER_COLLECTION), bytes)
        .await
}

/// Reads the active user record, if any has been set.
pub async fn get_active_user(repo: &OfflineRepository) -> Result<Option<Value>> {
    match repo.persister.get(&repo.cache_key(ACTIVE_USER_COLLECTION)).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}
