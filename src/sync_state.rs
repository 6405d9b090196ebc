// sync_state.rs - SyncStateManager: the outbound sync queue (§4.4)
//
// One SyncItem per (collection, entityId) represents the *net* operation
// still owed to the server; queuing a new local mutation merges into any
// existing item per the table in §4.4 rather than appending a new one.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::offline_repository::OfflineRepository;
use crate::query::{Filter, Query};

/// Reserved collection the queue is stored in, invisible to ordinary CRUD callers.
pub const KINVEY_SYNC_COLLECTION: &str = "kinvey_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub collection: String,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub operation: SyncOperation,
    #[serde(rename = "queuedAt")]
    pub queued_at: chrono::DateTime<Utc>,
}

pub struct SyncStateManager {
    repo: Arc<OfflineRepository>,
}

impl SyncStateManager {
    pub fn new(repo: Arc<OfflineRepository>) -> Self {
        Self { repo }
    }

    fn find_query(collection: &str, entity_id: &str) -> Query {
        Query::new().with_filter(Filter::And(vec![
            Filter::Eq {
                field: "collection".into(),
                value: json!(collection),
            },
            Filter::Eq {
                field: "entityId".into(),
                value: json!(entity_id),
            },
        ]))
    }

    async fn existing(&self, collection: &str, entity_id: &str) -> Result<Option<SyncItem>> {
        let matches = self
            .repo
            .read(KINVEY_SYNC_COLLECTION, Some(&Self::find_query(collection, entity_id)))
            .await?;
        Ok(match matches.into_iter().next() {
            Some(entity) => Some(serde_json::from_value(entity.into())?),
            None => None,
        })
    }

    async fn put(&self, item: SyncItem) -> Result<()> {
        let entity = match serde_json::to_value(&item)? {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("SyncItem serializes to an object"),
        };
        self.repo.update(KINVEY_SYNC_COLLECTION, vec![entity]).await?;
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.repo.delete_by_id(KINVEY_SYNC_COLLECTION, id).await?;
        Ok(())
    }

    fn require_entity_id(entity_id: &str) -> Result<()> {
        if entity_id.is_empty() {
            return Err(Error::Sync("cannot queue a sync item for an entity without an _id".into()));
        }
        Ok(())
    }

    fn require_not_tombstoned(existing: &Option<SyncItem>) -> Result<()> {
        if matches!(existing, Some(item) if item.operation == SyncOperation::Delete) {
            return Err(Error::Sync("cannot mutate a pending delete".into()));
        }
        Ok(())
    }

    /// Queues a Create, merging per §4.4: a later Update collapses back into
    /// Create (never pushed yet); a later Delete cancels the item outright.
    pub async fn add_create(&self, collection: &str, entity_id: &str) -> Result<()> {
        Self::require_entity_id(entity_id)?;
        let existing = self.existing(collection, entity_id).await?;
        Self::require_not_tombstoned(&existing)?;
        let id = existing.as_ref().map(|e| e.id.clone()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.put(SyncItem {
            id,
            collection: collection.to_string(),
            entity_id: entity_id.to_string(),
            operation: SyncOperation::Create,
            queued_at: Utc::now(),
        })
        .await
    }

    /// Queues an Update. A pending Create stays a Create (the entity still
    /// hasn't been pushed at all); a pending Delete is a tombstone and fails
    /// the mutation outright; otherwise becomes Update.
    pub async fn add_update(&self, collection: &str, entity_id: &str) -> Result<()> {
        Self::require_entity_id(entity_id)?;
        let existing = self.existing(collection, entity_id).await?;
        Self::require_not_tombstoned(&existing)?;
        let (id, operation) = match existing {
            Some(item) if item.operation == SyncOperation::Create => (item.id, SyncOperation::Create),
            Some(item) => (item.id, SyncOperation::Update),
            None => (uuid::Uuid::new_v4().to_string(), SyncOperation::Update),
        };
        self.put(SyncItem {
            id,
            collection: collection.to_string(),
            entity_id: entity_id.to_string(),
            operation,
            queued_at: Utc::now(),
        })
        .await
    }

    /// Queues a Delete. A pending Create that never reached the server is
    /// simply cancelled (§4.4); a pending Delete is a tombstone and fails the
    /// mutation outright; any other pending operation becomes Delete.
    pub async fn add_delete(&self, collection: &str, entity_id: &str) -> Result<()> {
        Self::require_entity_id(entity_id)?;
        let existing = self.existing(collection, entity_id).await?;
        if let Some(item) = &existing {
            if item.operation == SyncOperation::Create {
                return self.cancel(&item.id).await;
            }
        }
        Self::require_not_tombstoned(&existing)?;
        let id = existing.map(|e| e.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.put(SyncItem {
            id,
            collection: collection.to_string(),
            entity_id: entity_id.to_string(),
            operation: SyncOperation::Delete,
            queued_at: Utc::now(),
        })
        .await
    }

    /// All pending sync items for `collection`, oldest first.
    pub async fn get_sync_items(&self, collection: &str) -> Result<Vec<SyncItem>> {
        let query = Query::new()
            .with_filter(Filter::Eq {
                field: "collection".into(),
                value: json!(collection),
            })
            .with_sort("queuedAt", crate::query::SortDirection::Ascending);
        let entities = self.repo.read(KINVEY_SYNC_COLLECTION, Some(&query)).await?;
        entities
            .into_iter()
            .map(|e| Ok(serde_json::from_value(e.into())?))
            .collect()
    }

    /// Pending sync items for `collection`, restricted to entities matching
    /// `query` (push/pull only act on the subset of local state the caller
    /// asked about, §4.7, §4.8). Delete items are always included: the
    /// entity they refer to was already removed from the local cache when
    /// the intent was recorded, so it can never match a data query.
    pub async fn get_sync_items_matching(&self, collection: &str, query: Option<&Query>) -> Result<Vec<SyncItem>> {
        let items = self.get_sync_items(collection).await?;
        let query = match query {
            Some(q) => q,
            None => return Ok(items),
        };

        let matching = self.repo.read(collection, Some(query)).await?;
        let matching_ids: std::collections::HashSet<&str> = matching.iter().filter_map(crate::entity::id_of).collect();
        Ok(items
            .into_iter()
            .filter(|item| item.operation == SyncOperation::Delete || matching_ids.contains(item.entity_id.as_str()))
            .collect())
    }

    /// Count of pending sync items, for one collection or (when `None`) the whole app.
    pub async fn get_sync_item_count(&self, collection: Option<&str>) -> Result<usize> {
        match collection {
            Some(collection) => {
                let query = Query::new().with_filter(Filter::Eq {
                    field: "collection".into(),
                    value: json!(collection),
                });
                self.repo.count(KINVEY_SYNC_COLLECTION, Some(&query)).await
            }
            None => self.repo.count(KINVEY_SYNC_COLLECTION, None).await,
        }
    }

    /// Removes the sync item for a single entity (after it is confirmed pushed).
    pub async fn remove_sync_item_for_entity_id(&self, collection: &str, entity_id: &str) -> Result<()> {
        if let Some(item) = self.existing(collection, entity_id).await? {
            self.cancel(&item.id).await?;
        }
        Ok(())
    }

    /// Removes sync items for a batch of entity ids in `collection`.
    pub async fn remove_sync_items_for_ids(&self, collection: &str, entity_ids: &[String]) -> Result<()> {
        for entity_id in entity_ids {
            self.remove_sync_item_for_entity_id(collection, entity_id).await?;
        }
        Ok(())
    }

    /// Clears pending sync items for one collection, or (when `None`) every collection.
    pub async fn remove_all_sync_items(&self, collection: Option<&str>) -> Result<()> {
        match collection {
            Some(collection) => {
                let query = Query::new().with_filter(Filter::Eq {
                    field: "collection".into(),
                    value: json!(collection),
                });
                self.repo.delete(KINVEY_SYNC_COLLECTION, Some(&query)).await?;
            }
            None => {
                self.repo.clear(Some(KINVEY_SYNC_COLLECTION)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::InMemoryPersister;

    fn manager() -> SyncStateManager {
        let repo = Arc::new(OfflineRepository::new("app1", Arc::new(InMemoryPersister::new())));
        SyncStateManager::new(repo)
    }

    #[tokio::test]
    async fn create_then_delete_cancels_the_item() {
        let mgr = manager();
        mgr.add_create("books", "local1").await.unwrap();
        assert_eq!(mgr.get_sync_item_count(Some("books")).await.unwrap(), 1);

        mgr.add_delete("books", "local1").await.unwrap();
        assert_eq!(mgr.get_sync_item_count(Some("books")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_then_update_stays_create() {
        let mgr = manager();
        mgr.add_create("books", "local1").await.unwrap();
        mgr.add_update("books", "local1").await.unwrap();

        let items = mgr.get_sync_items("books").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, SyncOperation::Create);
    }

    #[tokio::test]
    async fn update_then_delete_becomes_delete() {
        let mgr = manager();
        mgr.add_update("books", "srv1").await.unwrap();
        mgr.add_delete("books", "srv1").await.unwrap();

        let items = mgr.get_sync_items("books").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, SyncOperation::Delete);
    }

    #[tokio::test]
    async fn repeated_updates_collapse_to_one_item() {
        let mgr = manager();
        mgr.add_update("books", "srv1").await.unwrap();
        mgr.add_update("books", "srv1").await.unwrap();
        mgr.add_update("books", "srv1").await.unwrap();

        assert_eq!(mgr.get_sync_item_count(Some("books")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mutating_a_pending_delete_is_a_sync_error() {
        let mgr = manager();
        mgr.add_update("books", "srv1").await.unwrap();
        mgr.add_delete("books", "srv1").await.unwrap();

        assert!(matches!(mgr.add_create("books", "srv1").await, Err(Error::Sync(_))));
        assert!(matches!(mgr.add_update("books", "srv1").await, Err(Error::Sync(_))));
        assert!(matches!(mgr.add_delete("books", "srv1").await, Err(Error::Sync(_))));

        let items = mgr.get_sync_items("books").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, SyncOperation::Delete);
    }

    #[tokio::test]
    async fn missing_entity_id_is_a_sync_error() {
        let mgr = manager();
        let err = mgr.add_create("books", "").await.unwrap_err();
        assert!(matches!(err, Error::Sync(_)));
    }

    #[tokio::test]
    async fn remove_all_sync_items_scoped_to_one_collection() {
        let mgr = manager();
        mgr.add_create("books", "1").await.unwrap();
        mgr.add_create("authors", "2").await.unwrap();

        mgr.remove_all_sync_items(Some("books")).await.unwrap();

        assert_eq!(mgr.get_sync_item_count(Some("books")).await.unwrap(), 0);
        assert_eq!(mgr.get_sync_item_count(Some("authors")).await.unwrap(), 1);
    }
}
