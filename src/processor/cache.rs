// processor/cache.rs - Cache mode: reads return the cached result immediately
// and reconcile from the network in the background; writes go local-first
// and are opportunistically pushed (§4.6).
//
// Both directions reuse `CacheRead`'s spawn+oneshot plumbing to run the
// network phase off the caller's path, but neither surfaces it synchronously:
// a transient network error during the read-reconcile phase is logged and
// suppressed (§4.6, §7), and a failed opportunistic push simply leaves the
// sync intent in place for the next explicit `push`.

use async_trait::async_trait;
use std::sync::Arc;

use super::DataProcessor;
use crate::cache_read::CacheRead;
use crate::entity::{ensure_id_and_stamp, id_of, strip_local_markers, Entity};
use crate::error::{Error, Result};
use crate::network::NetworkRepository;
use crate::offline_repository::OfflineRepository;
use crate::query::{Aggregation, GroupResult, Query};
use crate::query_cache::QueryCache;
use crate::sync_state::SyncStateManager;

pub struct CacheProcessor {
    collection: String,
    network: Arc<NetworkRepository>,
    repo: Arc<OfflineRepository>,
    sync_state: Arc<SyncStateManager>,
    query_cache: Arc<QueryCache>,
}

impl CacheProcessor {
    pub fn new(
        collection: impl Into<String>,
        network: Arc<NetworkRepository>,
        repo: Arc<OfflineRepository>,
        sync_state: Arc<SyncStateManager>,
        query_cache: Arc<QueryCache>,
    ) -> Self {
        Self {
            collection: collection.into(),
            network,
            repo,
            sync_state,
            query_cache,
        }
    }

    /// Spawns `synced` in the background via `CacheRead`, then spawns a
    /// second task that only awaits it to log a failure. Never blocks the
    /// caller and never propagates the network-phase error.
    fn spawn_reconcile<Fut>(&self, synced: Fut)
    where
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let collection = self.collection.clone();
        let read = CacheRead::new((), synced);
        tokio::spawn(async move {
            if let Err(err) = read.await_synced().await {
                tracing::warn!(collection = %collection, error = %err, "cache background reconcile failed");
            }
        });
    }

    /// Spawns the opportunistic push for one freshly-recorded sync item.
    /// Success reconciles the offline entity and clears the intent; failure
    /// is logged and the intent is left pending for the next explicit push.
    fn spawn_opportunistic_push(&self, entity_id: String, operation: crate::sync_state::SyncOperation) {
        let network = self.network.clone();
        let repo = self.repo.clone();
        let sync_state = self.sync_state.clone();
        let collection = self.collection.clone();
        tokio::spawn(async move {
            let result = match operation {
                crate::sync_state::SyncOperation::Create => push_create(&network, &repo, &collection, &entity_id).await,
                crate::sync_state::SyncOperation::Update => push_update(&network, &repo, &collection, &entity_id).await,
                crate::sync_state::SyncOperation::Delete => push_delete(&network, &collection, &entity_id).await,
            };
            match result {
                Ok(()) => {
                    let _ = sync_state.remove_sync_item_for_entity_id(&collection, &entity_id).await;
                }
                Err(err) => {
                    tracing::debug!(collection = %collection, entity_id = %entity_id, error = %err, "opportunistic push pending retry");
                }
            }
        });
    }
}

async fn push_create(network: &NetworkRepository, repo: &OfflineRepository, collection: &str, local_id: &str) -> Result<()> {
    let mut entity = repo.read_by_id(collection, local_id).await?;
    strip_local_markers(&mut entity);
    let created = network.create(collection, entity).await?;
    repo.delete_by_id(collection, local_id).await?;
    repo.create(collection, vec![created]).await?;
    Ok(())
}

async fn push_update(network: &NetworkRepository, repo: &OfflineRepository, collection: &str, entity_id: &str) -> Result<()> {
    let entity = repo.read_by_id(collection, entity_id).await?;
    let updated = network.update(collection, entity).await?;
    repo.update(collection, vec![updated]).await?;
    Ok(())
}

async fn push_delete(network: &NetworkRepository, collection: &str, entity_id: &str) -> Result<()> {
    match network.delete_by_id(collection, entity_id).await {
        Ok(_) => Ok(()),
        Err(Error::NotFound(_)) => Ok(()), // already gone server-side
        Err(err) => Err(err),
    }
}

#[async_trait]
impl DataProcessor for CacheProcessor {
    async fn create(&self, mut entity: Entity) -> Result<Entity> {
        ensure_id_and_stamp(&mut entity);
        let id = id_of(&entity).expect("ensure_id_and_stamp guarantees an _id").to_string();
        let created = self.repo.create(&self.collection, vec![entity]).await?;
        let local = created.into_iter().next().expect("create returns what it was given");
        self.sync_state.add_create(&self.collection, &id).await?;
        self.spawn_opportunistic_push(id, crate::sync_state::SyncOperation::Create);
        Ok(local)
    }

    async fn update(&self, entity: Entity) -> Result<Entity> {
        let id = id_of(&entity)
            .ok_or_else(|| Error::Sync("cannot update an entity without an _id".into()))?
            .to_string();
        let updated = self.repo.update(&self.collection, vec![entity]).await?;
        let local = updated.into_iter().next().expect("update returns what it was given");
        self.sync_state.add_update(&self.collection, &id).await?;
        self.spawn_opportunistic_push(id, crate::sync_state::SyncOperation::Update);
        Ok(local)
    }

    async fn read(&self, query: Option<&Query>) -> Result<Vec<Entity>> {
        let cached = self.repo.read(&self.collection, query).await?;

        let network = self.network.clone();
        let repo = self.repo.clone();
        let collection = self.collection.clone();
        let owned_query = query.cloned();
        self.spawn_reconcile(async move {
            let page = network.read(&collection, owned_query.as_ref()).await?;
            if !page.entities.is_empty() {
                repo.update(&collection, page.entities).await?;
            }
            Ok(())
        });

        Ok(cached)
    }

    async fn read_by_id(&self, id: &str) -> Result<Entity> {
        match self.repo.read_by_id(&self.collection, id).await {
            Ok(cached) => {
                let network = self.network.clone();
                let repo = self.repo.clone();
                let collection = self.collection.clone();
                let id = id.to_string();
                self.spawn_reconcile(async move {
                    let entity = network.read_by_id(&collection, &id).await?;
                    repo.update(&collection, vec![entity]).await?;
                    Ok(())
                });
                Ok(cached)
            }
            // Nothing cached to return yet; the first read for this id has
            // to go to the network synchronously.
            Err(Error::NotFound(_)) => {
                let entity = self.network.read_by_id(&self.collection, id).await?;
                self.repo.update(&self.collection, vec![entity.clone()]).await?;
                Ok(entity)
            }
            Err(err) => Err(err),
        }
    }

    async fn count(&self, query: Option<&Query>) -> Result<usize> {
        let cached = self.repo.count(&self.collection, query).await?;

        let network = self.network.clone();
        let repo = self.repo.clone();
        let collection = self.collection.clone();
        let owned_query = query.cloned();
        self.spawn_reconcile(async move {
            let page = network.read(&collection, owned_query.as_ref()).await?;
            if !page.entities.is_empty() {
                repo.update(&collection, page.entities).await?;
            }
            Ok(())
        });

        Ok(cached)
    }

    async fn delete(&self, query: Option<&Query>) -> Result<usize> {
        let matched = self.repo.read(&self.collection, query).await?;
        let mut removed = 0;
        for entity in matched {
            let Some(id) = id_of(&entity).map(str::to_string) else {
                continue;
            };
            removed += self.delete_by_id(&id).await?;
        }
        Ok(removed)
    }

    async fn delete_by_id(&self, id: &str) -> Result<usize> {
        let removed = self.repo.delete_by_id(&self.collection, id).await?;
        if removed > 0 {
            self.sync_state.add_delete(&self.collection, id).await?;
            self.spawn_opportunistic_push(id.to_string(), crate::sync_state::SyncOperation::Delete);
        }
        Ok(removed)
    }

    async fn group(&self, aggregation: &Aggregation) -> Result<Vec<GroupResult>> {
        let cached = self.repo.group(&self.collection, aggregation).await?;

        let network = self.network.clone();
        let repo = self.repo.clone();
        let collection = self.collection.clone();
        self.spawn_reconcile(async move {
            let page = network.read(&collection, None).await?;
            if !page.entities.is_empty() {
                repo.update(&collection, page.entities).await?;
            }
            Ok(())
        });

        Ok(cached)
    }

    async fn clear(&self, query: Option<&Query>) -> Result<()> {
        match query {
            None => {
                self.repo.clear(Some(&self.collection)).await?;
                self.sync_state.remove_all_sync_items(Some(&self.collection)).await?;
                self.query_cache.invalidate_collection(&self.collection).await
            }
            Some(q) => {
                let matched = self.repo.read(&self.collection, Some(q)).await?;
                let ids: Vec<String> = matched.iter().filter_map(|e| id_of(e).map(str::to_string)).collect();
                self.repo.delete(&self.collection, Some(q)).await?;
                self.sync_state.remove_sync_items_for_ids(&self.collection, &ids).await?;
                self.query_cache.invalidate(&self.collection, q).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthProvider;
    use crate::client::ClientConfig;
    use crate::persister::InMemoryPersister;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn processor(base_url: String) -> CacheProcessor {
        let config = Arc::new(ClientConfig::new("app1", "secret1").with_base_url(base_url));
        let auth = Arc::new(AuthProvider::new("app1", "secret1", None));
        let network = Arc::new(NetworkRepository::new(config, auth).unwrap());
        let repo = Arc::new(OfflineRepository::new("app1", Arc::new(InMemoryPersister::new())));
        let sync_state = Arc::new(SyncStateManager::new(repo.clone()));
        let query_cache = Arc::new(QueryCache::new(repo.clone()));
        CacheProcessor::new("books", network, repo, sync_state, query_cache)
    }

    #[tokio::test]
    async fn create_is_local_first_and_pushes_in_the_background() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/appdata/app1/books"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "srv1", "title": "A"})))
            .mount(&server)
            .await;

        let processor = processor(server.uri());
        let mut entity = Entity::new();
        entity.insert("title".into(), json!("A"));
        let created = processor.create(entity).await.unwrap();
        let local_id = id_of(&created).unwrap().to_string();

        // Local-first: the entity is already readable under its local id
        // before the background push has had a chance to run.
        assert!(processor.repo.read_by_id("books", &local_id).await.is_ok());

        for _ in 0..20 {
            if processor.repo.read_by_id("books", "srv1").await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(processor.repo.read_by_id("books", "srv1").await.is_ok());
        assert_eq!(processor.sync_state.get_sync_item_count(Some("books")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_returns_cached_value_immediately_and_reconciles_in_background() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/appdata/app1/books"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"_id": "1", "title": "server"}])))
            .mount(&server)
            .await;

        let processor = processor(server.uri());
        let found = processor.read(None).await.unwrap();
        assert!(found.is_empty());

        for _ in 0..20 {
            if processor.repo.count("books", None).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(processor.repo.count("books", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_with_query_invalidates_only_the_matching_cached_query() {
        let processor = processor("http://localhost:0".to_string());
        let mut a = Entity::new();
        a.insert("_id".into(), json!("1"));
        a.insert("kind".into(), json!("a"));
        let mut b = Entity::new();
        b.insert("_id".into(), json!("2"));
        b.insert("kind".into(), json!("b"));
        processor.repo.create("books", vec![a, b]).await.unwrap();

        let query = Query::new().with_filter(crate::query::Filter::Eq {
            field: "kind".into(),
            value: json!("a"),
        });
        processor.query_cache.record("books", &query, "2026-01-01T00:00:00.000Z").await.unwrap();

        processor.clear(Some(&query)).await.unwrap();

        assert!(processor.repo.read_by_id("books", "1").await.is_err());
        assert!(processor.repo.read_by_id("books", "2").await.is_ok());
        assert_eq!(processor.query_cache.last_request_start("books", &query).await.unwrap(), None);
    }
}
