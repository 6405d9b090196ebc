// datastore.rs - DataStore: the public per-collection API (§4.9)

use std::sync::Arc;

use crate::client::ClientConfig;
use crate::entity::{id_of, Entity};
use crate::error::Result;
use crate::persister::KeyValuePersister;
use crate::processor::{CacheProcessor, DataProcessor, NetworkProcessor, SyncProcessor};
use crate::query::{Aggregation, GroupResult, Query};
use crate::registry::{self, AppContext};
use crate::sync_manager::{PullOptions, PullSummary, PushSummary};

/// Which processor backs a `DataStore`'s operations (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Network,
    Sync,
    Cache,
}

/// A handle to one (appKey, collection, tag) triple. Cheap to construct
/// repeatedly: the expensive state (local cache, sync queue, HTTP client)
/// lives in the shared [`AppContext`], not in the `DataStore` itself.
pub struct DataStore {
    mode: Mode,
    collection: String,
    processor: Box<dyn DataProcessor>,
    context: Arc<AppContext>,
}

impl DataStore {
    /// Opens a `DataStore` over `collection` in `mode`. `tag` partitions the
    /// local cache into an independent namespace (e.g. per logged-in user)
    /// without affecting which server collection is addressed (§3).
    pub fn collection(
        mode: Mode,
        collection: impl Into<String>,
        tag: Option<&str>,
        config: ClientConfig,
        persister: Arc<dyn KeyValuePersister>,
    ) -> Result<Self> {
        let context = registry::context_for(config, persister)?;
        let collection = collection.into();
        let qualified = match tag {
            Some(tag) => format!("{collection}.{tag}"),
            None => collection.clone(),
        };

        let processor: Box<dyn DataProcessor> = match mode {
            Mode::Network => Box::new(NetworkProcessor::new(collection.clone(), context.network.clone())),
            Mode::Sync => Box::new(SyncProcessor::new(
                qualified.clone(),
                context.repo.clone(),
                context.sync_state.clone(),
            )),
            Mode::Cache => Box::new(CacheProcessor::new(
                qualified.clone(),
                context.network.clone(),
                context.repo.clone(),
                context.sync_state.clone(),
                context.query_cache.clone(),
            )),
        };

        // Network mode addresses the server collection directly; Sync/Cache
        // address the tag-qualified local partition for every local op, but
        // push/pull must still operate on the same local partition name.
        let local_collection = match mode {
            Mode::Network => collection,
            Mode::Sync | Mode::Cache => qualified,
        };

        Ok(Self {
            mode,
            collection: local_collection,
            processor,
            context,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub async fn create(&self, entity: Entity) -> Result<Entity> {
        self.processor.create(entity).await
    }

    pub async fn update(&self, entity: Entity) -> Result<Entity> {
        self.processor.update(entity).await
    }

    /// Dispatches to `create` or `update` based on `_id` presence (§4.9).
    pub async fn save(&self, entity: Entity) -> Result<Entity> {
        match id_of(&entity) {
            Some(_) => self.update(entity).await,
            None => self.create(entity).await,
        }
    }

    pub async fn find(&self, query: Option<&Query>) -> Result<Vec<Entity>> {
        self.processor.read(query).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Entity> {
        self.processor.read_by_id(id).await
    }

    pub async fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.processor.count(query).await
    }

    pub async fn remove(&self, query: Option<&Query>) -> Result<usize> {
        self.processor.delete(query).await
    }

    pub async fn remove_by_id(&self, id: &str) -> Result<usize> {
        self.processor.delete_by_id(id).await
    }

    pub async fn group(&self, aggregation: &Aggregation) -> Result<Vec<GroupResult>> {
        self.processor.group(aggregation).await
    }

    /// Clears entities matching `query`, or the whole collection when `None`
    /// (§4.9). In Cache mode this also drops any `CachedQuery` entries for
    /// the affected scope, forcing the next delta-set pull back to a full pull.
    pub async fn clear(&self, query: Option<&Query>) -> Result<()> {
        self.processor.clear(query).await
    }

    /// Number of sync items still pending for this collection, optionally
    /// restricted to entities matching `query` (§4.4, §4.9).
    pub async fn pending_sync_count(&self, query: Option<&Query>) -> Result<usize> {
        Ok(self
            .context
            .sync_state
            .get_sync_items_matching(&self.collection, query)
            .await?
            .len())
    }

    /// The pending sync items themselves, optionally restricted to entities
    /// matching `query` (§4.9 introspection surface).
    pub async fn pending_sync_entities(&self, query: Option<&Query>) -> Result<Vec<crate::sync_state::SyncItem>> {
        self.context.sync_state.get_sync_items_matching(&self.collection, query).await
    }

    /// Drops pending sync items without pushing them, optionally restricted
    /// to entities matching `query` (§4.9). The underlying cached entities
    /// are left untouched; only the outbound intent is discarded.
    pub async fn clear_sync(&self, query: Option<&Query>) -> Result<()> {
        let items = self.pending_sync_entities(query).await?;
        let ids: Vec<String> = items.into_iter().map(|item| item.entity_id).collect();
        self.context
            .sync_state
            .remove_sync_items_for_ids(&self.collection, &ids)
            .await
    }

    /// Pushes pending sync items for this collection, optionally restricted
    /// to entities matching `query` (§4.7). Meaningful in Sync and Cache
    /// mode; in Network mode there is never anything queued.
    pub async fn push(&self, query: Option<&Query>) -> Result<PushSummary> {
        self.context.sync_manager.push(&self.collection, query).await
    }

    /// Pulls from the server into the local cache (§4.8).
    pub async fn pull(&self, query: Option<&Query>, options: PullOptions) -> Result<PullSummary> {
        let query = query.cloned().unwrap_or_default();
        self.context.sync_manager.pull(&self.collection, &query, &options).await
    }

    /// Pushes then pulls.
    pub async fn sync(&self, query: Option<&Query>, options: PullOptions) -> Result<(PushSummary, PullSummary)> {
        let push_summary = self.push(query).await?;
        let pull_summary = self.pull(query, options).await?;
        Ok((push_summary, pull_summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::InMemoryPersister;
    use crate::registry::clear;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn persister() -> Arc<dyn KeyValuePersister> {
        Arc::new(InMemoryPersister::new())
    }

    #[tokio::test]
    async fn sync_mode_create_is_local_and_queues_a_sync_item() {
        clear("ds-sync-app");
        let config = ClientConfig::new("ds-sync-app", "secret");
        let store = DataStore::collection(Mode::Sync, "books", None, config, persister()).unwrap();

        let mut entity = Entity::new();
        entity.insert("title".into(), json!("A"));
        let created = store.create(entity).await.unwrap();
        assert!(created.get("_id").is_some());
        assert_eq!(store.pending_sync_count(None).await.unwrap(), 1);

        let pending = store.pending_sync_entities(None).await.unwrap();
        assert_eq!(pending.len(), 1);

        store.clear_sync(None).await.unwrap();
        assert_eq!(store.pending_sync_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cache_mode_find_returns_cached_immediately_and_reconciles_in_background() {
        clear("ds-cache-app");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appdata/ds-cache-app/books"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"_id": "1", "title": "server"}])))
            .mount(&server)
            .await;

        let config = ClientConfig::new("ds-cache-app", "secret").with_base_url(server.uri());
        let store = DataStore::collection(Mode::Cache, "books", None, config, persister()).unwrap();

        let found = store.find(None).await.unwrap();
        assert!(found.is_empty());

        for _ in 0..20 {
            if store.count(None).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn save_dispatches_to_create_or_update_based_on_id_presence() {
        clear("ds-save-app");
        let config = ClientConfig::new("ds-save-app", "secret");
        let store = DataStore::collection(Mode::Sync, "books", None, config, persister()).unwrap();

        let mut entity = Entity::new();
        entity.insert("title".into(), json!("A"));
        let created = store.save(entity).await.unwrap();
        let id = created.get("_id").unwrap().as_str().unwrap().to_string();
        assert_eq!(store.count(None).await.unwrap(), 1);

        let mut update = Entity::new();
        update.insert("_id".into(), json!(id));
        update.insert("title".into(), json!("A2"));
        store.save(update).await.unwrap();

        assert_eq!(store.count(None).await.unwrap(), 1);
        let found = store.find_by_id(&id).await.unwrap();
        assert_eq!(found.get("title").unwrap(), "A2");
    }

    #[tokio::test]
    async fn tag_partitions_the_local_cache() {
        clear("ds-tag-app");
        let config = ClientConfig::new("ds-tag-app", "secret");
        let store_a = DataStore::collection(Mode::Sync, "books", Some("userA"), config.clone(), persister()).unwrap();
        let store_b = DataStore::collection(Mode::Sync, "books", Some("userB"), config, persister()).unwrap();

        let mut entity = Entity::new();
        entity.insert("title".into(), json!("A"));
        store_a.create(entity).await.unwrap();

        assert_eq!(store_a.count(None).await.unwrap(), 1);
        assert_eq!(store_b.count(None).await.unwrap(), 0);
    }
}
