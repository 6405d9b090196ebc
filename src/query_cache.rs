// query_cache.rs - CachedQuery: per (collection, canonical-query) high-water
// mark used to drive delta-set pulls (§4.3, §4.8).
//
// Stored as ordinary entities in the reserved `_QueryCache` collection of the
// owning `OfflineRepository`, keyed by `<collection>:<canonical query>`.

use std::sync::Arc;

use serde_json::json;

use crate::entity::Entity;
use crate::error::Result;
use crate::offline_repository::OfflineRepository;
use crate::query::{Filter, Query};

/// Reserved collection name the cache is stored under (never exposed to callers).
pub const QUERY_CACHE_COLLECTION: &str = "_QueryCache";

pub struct QueryCache {
    repo: Arc<OfflineRepository>,
}

fn cache_id(collection: &str, canonical_query: &str) -> String {
    format!("{collection}:{canonical_query}")
}

impl QueryCache {
    pub fn new(repo: Arc<OfflineRepository>) -> Self {
        Self { repo }
    }

    /// The last `X-Kinvey-Request-Start` seen for this (collection, query), if any (§4.8).
    pub async fn last_request_start(&self, collection: &str, query: &Query) -> Result<Option<String>> {
        let id = cache_id(collection, &query.canonical());
        match self.repo.read_by_id(QUERY_CACHE_COLLECTION, &id).await {
            Ok(entity) => Ok(entity
                .get("lastRequestStart")
                .and_then(|v| v.as_str())
                .map(str::to_string)),
            Err(crate::error::Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Records `request_start` as the new high-water mark for this query.
    pub async fn record(&self, collection: &str, query: &Query, request_start: &str) -> Result<()> {
        let id = cache_id(collection, &query.canonical());
        let mut entry = Entity::new();
        entry.insert("_id".into(), json!(id));
        entry.insert("collection".into(), json!(collection));
        entry.insert("query".into(), json!(query.canonical()));
        entry.insert("lastRequestStart".into(), json!(request_start));
        self.repo.update(QUERY_CACHE_COLLECTION, vec![entry]).await?;
        Ok(())
    }

    /// Drops the cache entry for one (collection, query) pair, forcing the
    /// next pull for it back to a full pull.
    pub async fn invalidate(&self, collection: &str, query: &Query) -> Result<()> {
        let id = cache_id(collection, &query.canonical());
        self.repo.delete_by_id(QUERY_CACHE_COLLECTION, &id).await?;
        Ok(())
    }

    /// Drops every cache entry for `collection` (used when the local cache for
    /// that collection is cleared, since its high-water marks no longer apply).
    pub async fn invalidate_collection(&self, collection: &str) -> Result<()> {
        let filter = Filter::Eq {
            field: "collection".into(),
            value: json!(collection),
        };
        let query = Query::new().with_filter(filter);
        self.repo.delete(QUERY_CACHE_COLLECTION, Some(&query)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::InMemoryPersister;

    fn cache() -> QueryCache {
        let repo = Arc::new(OfflineRepository::new("app1", Arc::new(InMemoryPersister::new())));
        QueryCache::new(repo)
    }

    #[tokio::test]
    async fn records_and_reads_high_water_mark() {
        let cache = cache();
        let q = Query::new();
        assert_eq!(cache.last_request_start("books", &q).await.unwrap(), None);

        cache.record("books", &q, "2026-01-01T00:00:00.000Z").await.unwrap();
        assert_eq!(
            cache.last_request_start("books", &q).await.unwrap(),
            Some("2026-01-01T00:00:00.000Z".to_string())
        );
    }

    #[tokio::test]
    async fn distinct_queries_get_distinct_marks() {
        let cache = cache();
        let q1 = Query::new().with_limit(10);
        let q2 = Query::new().with_limit(20);
        cache.record("books", &q1, "A").await.unwrap();
        cache.record("books", &q2, "B").await.unwrap();
        assert_eq!(cache.last_request_start("books", &q1).await.unwrap(), Some("A".into()));
        assert_eq!(cache.last_request_start("books", &q2).await.unwrap(), Some("B".into()));
    }

    #[tokio::test]
    async fn invalidate_collection_clears_all_its_entries() {
        let cache = cache();
        let q1 = Query::new().with_limit(10);
        let q2 = Query::new().with_limit(20);
        cache.record("books", &q1, "A").await.unwrap();
        cache.record("authors", &q2, "B").await.unwrap();

        cache.invalidate_collection("books").await.unwrap();

        assert_eq!(cache.last_request_start("books", &q1).await.unwrap(), None);
        assert_eq!(cache.last_request_start("authors", &q2).await.unwrap(), Some("B".into()));
    }
}
