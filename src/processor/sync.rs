// processor/sync.rs - Sync mode: every operation is local-only; mutations
// are mirrored into the outbound sync queue for a later explicit push (§4.6).

use async_trait::async_trait;
use std::sync::Arc;

use super::DataProcessor;
use crate::entity::{ensure_id_and_stamp, id_of, Entity};
use crate::error::{Error, Result};
use crate::offline_repository::OfflineRepository;
use crate::query::{Aggregation, GroupResult, Query};
use crate::sync_state::SyncStateManager;

pub struct SyncProcessor {
    collection: String,
    repo: Arc<OfflineRepository>,
    sync_state: Arc<SyncStateManager>,
}

impl SyncProcessor {
    pub fn new(collection: impl Into<String>, repo: Arc<OfflineRepository>, sync_state: Arc<SyncStateManager>) -> Self {
        Self {
            collection: collection.into(),
            repo,
            sync_state,
        }
    }
}

#[async_trait]
impl DataProcessor for SyncProcessor {
    async fn create(&self, mut entity: Entity) -> Result<Entity> {
        ensure_id_and_stamp(&mut entity);
        let id = id_of(&entity).expect("ensure_id_and_stamp guarantees an _id").to_string();
        let created = self.repo.create(&self.collection, vec![entity]).await?;
        self.sync_state.add_create(&self.collection, &id).await?;
        Ok(created.into_iter().next().expect("create returns what it was given"))
    }

    async fn update(&self, entity: Entity) -> Result<Entity> {
        let id = id_of(&entity)
            .ok_or_else(|| Error::Sync("cannot update an entity without an _id".into()))?
            .to_string();
        let updated = self.repo.update(&self.collection, vec![entity]).await?;
        self.sync_state.add_update(&self.collection, &id).await?;
        Ok(updated.into_iter().next().expect("update returns what it was given"))
    }

    async fn read(&self, query: Option<&Query>) -> Result<Vec<Entity>> {
        self.repo.read(&self.collection, query).await
    }

    async fn read_by_id(&self, id: &str) -> Result<Entity> {
        self.repo.read_by_id(&self.collection, id).await
    }

    async fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.repo.count(&self.collection, query).await
    }

    async fn delete(&self, query: Option<&Query>) -> Result<usize> {
        let matched = self.repo.read(&self.collection, query).await?;
        let ids: Vec<String> = matched.iter().filter_map(|e| id_of(e).map(str::to_string)).collect();
        let removed = self.repo.delete(&self.collection, query).await?;
        for id in ids {
            self.sync_state.add_delete(&self.collection, &id).await?;
        }
        Ok(removed)
    }

    async fn delete_by_id(&self, id: &str) -> Result<usize> {
        let removed = self.repo.delete_by_id(&self.collection, id).await?;
        if removed > 0 {
            self.sync_state.add_delete(&self.collection, id).await?;
        }
        Ok(removed)
    }

    async fn group(&self, aggregation: &Aggregation) -> Result<Vec<GroupResult>> {
        self.repo.group(&self.collection, aggregation).await
    }

    async fn clear(&self, query: Option<&Query>) -> Result<()> {
        match query {
            None => {
                self.repo.clear(Some(&self.collection)).await?;
                self.sync_state.remove_all_sync_items(Some(&self.collection)).await
            }
            Some(q) => {
                let matched = self.repo.read(&self.collection, Some(q)).await?;
                let ids: Vec<String> = matched.iter().filter_map(|e| id_of(e).map(str::to_string)).collect();
                self.repo.delete(&self.collection, Some(q)).await?;
                self.sync_state.remove_sync_items_for_ids(&self.collection, &ids).await
            }
        }
    }
}
