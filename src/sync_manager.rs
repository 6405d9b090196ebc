// sync_manager.rs - Push and pull pipelines (§4.7, §4.8)
//
// Push drains the outbound sync queue for one collection with bounded
// per-item concurrency, never aborting the batch on a single item's failure
// (grounded on the teacher's `trailbase/sync.rs` `SyncResult::{Success,Failed}`
// reporting style). Pull supports a plain read, a delta-set incremental pull,
// and a count-then-page auto-paginated pull, all behind one entry point.

use std::sync::Arc;

use dashmap::DashSet;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::entity::{id_of, strip_local_markers, Entity};
use crate::error::{Error, Result};
use crate::network::NetworkRepository;
use crate::offline_repository::OfflineRepository;
use crate::query::Query;
use crate::query_cache::QueryCache;
use crate::sync_state::{SyncOperation, SyncStateManager};

/// Outcome of pushing one queued item (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PushResult {
    Success {
        entity_id: String,
        operation: SyncOperation,
        entity: Option<Entity>,
    },
    Failed {
        entity_id: String,
        operation: SyncOperation,
        error: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct PushSummary {
    pub results: Vec<PushResult>,
}

impl PushSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| matches!(r, PushResult::Success { .. })).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| matches!(r, PushResult::Failed { .. })).count()
    }
}

/// Options governing one pull call (§4.8).
#[derive(Debug, Clone)]
pub struct PullOptions {
    pub use_delta_set: bool,
    pub auto_pagination: bool,
    /// When true, a pull is refused while sync items are pending for the
    /// collection, rather than silently racing the outbound push (§9 (b)).
    pub fail_on_pending_sync: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            use_delta_set: false,
            auto_pagination: false,
            fail_on_pending_sync: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullSummary {
    pub count: usize,
}

pub struct SyncManager {
    repo: Arc<OfflineRepository>,
    network: Arc<NetworkRepository>,
    sync_state: Arc<SyncStateManager>,
    query_cache: Arc<QueryCache>,
    config: Arc<ClientConfig>,
    push_in_progress: DashSet<String>,
}

/// Releases `collection`'s push-in-progress marker when the push completes or
/// is dropped (e.g. the caller's future is cancelled), so a panicking or
/// cancelled push never wedges the collection out of future pushes.
struct PushGuard<'a> {
    set: &'a DashSet<String>,
    collection: String,
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.collection);
    }
}

impl SyncManager {
    pub fn new(
        repo: Arc<OfflineRepository>,
        network: Arc<NetworkRepository>,
        sync_state: Arc<SyncStateManager>,
        query_cache: Arc<QueryCache>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            repo,
            network,
            sync_state,
            query_cache,
            config,
            push_in_progress: DashSet::new(),
        }
    }

    /// Drains every pending sync item for `collection` matching `query`
    /// (`None` drains all of them). Per-collection pushes are mutually
    /// exclusive: a second concurrent call for the same collection rejects
    /// immediately with `Sync` rather than queueing behind the first (§4.7,
    /// §4.9 state machine, testable property 7). Items within one push run
    /// with bounded concurrency (§5).
    pub async fn push(&self, collection: &str, query: Option<&Query>) -> Result<PushSummary> {
        if !self.push_in_progress.insert(collection.to_string()) {
            return Err(Error::Sync(format!("push already in progress for '{collection}'")));
        }
        let _guard = PushGuard {
            set: &self.push_in_progress,
            collection: collection.to_string(),
        };

        let items = self.sync_state.get_sync_items_matching(collection, query).await?;
        let concurrency = self.config.max_concurrent_push_requests.max(1);

        let results: Vec<PushResult> = stream::iter(items)
            .map(|item| async move { self.push_one(collection, item).await })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let summary = PushSummary { results };
        tracing::info!(
            collection,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "push complete"
        );
        Ok(summary)
    }

    async fn push_one(&self, collection: &str, item: crate::sync_state::SyncItem) -> PushResult {
        let operation = item.operation;
        let outcome = match operation {
            SyncOperation::Create => self.push_create(collection, &item.entity_id).await,
            SyncOperation::Update => self.push_update(collection, &item.entity_id).await,
            SyncOperation::Delete => self.push_delete(collection, &item.entity_id).await,
        };

        match outcome {
            Ok(entity) => {
                let _ = self.sync_state.remove_sync_item_for_entity_id(collection, &item.entity_id).await;
                PushResult::Success {
                    entity_id: item.entity_id,
                    operation,
                    entity,
                }
            }
            Err(err) => {
                tracing::warn!(collection, entity_id = %item.entity_id, error = %err, "push item failed");
                PushResult::Failed {
                    entity_id: item.entity_id,
                    operation,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn push_create(&self, collection: &str, local_id: &str) -> Result<Option<Entity>> {
        let mut entity = self.repo.read_by_id(collection, local_id).await?;
        strip_local_markers(&mut entity);
        let created = self.network.create(collection, entity).await?;
        let _ = id_of(&created).ok_or_else(|| Error::Kinvey("server response to create is missing _id".into()))?;

        self.repo.delete_by_id(collection, local_id).await?;
        self.repo.create(collection, vec![created.clone()]).await?;
        Ok(Some(created))
    }

    async fn push_update(&self, collection: &str, entity_id: &str) -> Result<Option<Entity>> {
        let entity = self.repo.read_by_id(collection, entity_id).await?;
        let updated = self.network.update(collection, entity).await?;
        self.repo.update(collection, vec![updated.clone()]).await?;
        Ok(Some(updated))
    }

    async fn push_delete(&self, collection: &str, entity_id: &str) -> Result<Option<Entity>> {
        match self.network.delete_by_id(collection, entity_id).await {
            Ok(_) => Ok(None),
            Err(Error::NotFound(_)) => Ok(None), // already gone server-side; push still succeeds
            Err(err) => Err(err),
        }
    }

    /// Pulls `collection` per `query`/`options` and merges results into the
    /// local cache (§4.8).
    pub async fn pull(&self, collection: &str, query: &Query, options: &PullOptions) -> Result<PullSummary> {
        let pending = self.sync_state.get_sync_items_matching(collection, Some(query)).await?;
        if !pending.is_empty() {
            if options.fail_on_pending_sync {
                return Err(Error::Sync(format!(
                    "{} sync item(s) pending for '{collection}'; push before pulling",
                    pending.len()
                )));
            }
            // Lenient default (§4.8, §9 (b)): push the matching pending
            // items before the read so the server never races them.
            self.push(collection, Some(query)).await?;
        }

        if options.use_delta_set && !query.is_bounded() {
            if let Some(since) = self.query_cache.last_request_start(collection, query).await? {
                return self.pull_delta_set(collection, query, &since).await;
            }
            // No CachedQuery entry yet: treat as a forced full pull rather
            // than issuing delta-set with an empty `since` (§9 (a)).
        }

        if query.is_bounded() {
            return self.pull_bounded(collection, query).await;
        }

        if options.auto_pagination {
            self.pull_auto_paginated(collection, query).await
        } else {
            self.pull_regular(collection, query).await
        }
    }

    async fn pull_delta_set(&self, collection: &str, query: &Query, since: &str) -> Result<PullSummary> {
        let page = match self.network.delta_set(collection, Some(query), since).await {
            Ok(page) => page,
            Err(Error::InvalidCachedQuery(reason)) => {
                tracing::debug!(collection, reason, "server rejected since-token, falling back to a full pull");
                self.query_cache.invalidate(collection, query).await?;
                return self.pull_regular(collection, query).await;
            }
            Err(err) => return Err(err),
        };
        tracing::debug!(
            collection,
            since,
            changed = page.changed.len(),
            deleted = page.deleted_ids.len(),
            "delta-set pull"
        );
        if !page.changed.is_empty() {
            self.repo.update(collection, page.changed.clone()).await?;
        }
        for id in &page.deleted_ids {
            self.repo.delete_by_id(collection, id).await?;
        }
        self.query_cache.record(collection, query, &page.request_start).await?;
        Ok(PullSummary {
            count: page.changed.len(),
        })
    }

    /// A bounded (skip/limit) pull never deletes entities outside its window
    /// and never updates the delta-set high-water mark (§4.8, §9 (c)).
    async fn pull_bounded(&self, collection: &str, query: &Query) -> Result<PullSummary> {
        let page = self.network.read(collection, Some(query)).await?;
        let count = page.entities.len();
        if count > 0 {
            self.repo.update(collection, page.entities).await?;
        }
        Ok(PullSummary { count })
    }

    async fn pull_regular(&self, collection: &str, query: &Query) -> Result<PullSummary> {
        let page = self.network.read(collection, Some(query)).await?;
        self.replace_collection(collection, &page.entities).await?;
        self.query_cache.record(collection, query, &page.request_start).await?;
        Ok(PullSummary {
            count: page.entities.len(),
        })
    }

    /// Count-then-page pull with bounded concurrency across pages (§4.8, §5).
    async fn pull_auto_paginated(&self, collection: &str, query: &Query) -> Result<PullSummary> {
        let total = self.network.count(collection, Some(query)).await? as usize;
        let page_size = self.config.default_page_size.max(1);

        if total <= page_size {
            return self.pull_regular(collection, query).await;
        }

        let page_queries: Vec<Query> = (0..total)
            .step_by(page_size)
            .map(|skip| {
                let mut page_query = query.clone();
                page_query.skip = Some(skip);
                page_query.limit = Some(page_size);
                page_query
            })
            .collect();

        let concurrency = self.config.max_concurrent_pull_requests.max(1);
        let pages: Vec<Result<crate::network::Page>> = stream::iter(page_queries)
            .map(|page_query| async move { self.network.read(collection, Some(&page_query)).await })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut entities = Vec::with_capacity(total);
        let mut request_start = String::new();
        for page in pages {
            let page = page?;
            if request_start.is_empty() {
                request_start = page.request_start;
            }
            entities.extend(page.entities);
        }

        self.replace_collection(collection, &entities).await?;
        self.query_cache.record(collection, query, &request_start).await?;
        Ok(PullSummary { count: entities.len() })
    }

    /// Replaces the full local contents of `collection` with `pulled`, except
    /// for entities that still have a pending outbound sync item (unpushed
    /// local work must survive a pull even if the server no longer lists it).
    async fn replace_collection(&self, collection: &str, pulled: &[Entity]) -> Result<()> {
        let pending_ids: std::collections::HashSet<String> = self
            .sync_state
            .get_sync_items(collection)
            .await?
            .into_iter()
            .map(|item| item.entity_id)
            .collect();

        let current = self.repo.read(collection, None).await?;
        let pulled_ids: std::collections::HashSet<&str> = pulled.iter().filter_map(id_of).collect();

        for entity in &current {
            let Some(id) = id_of(entity) else { continue };
            if !pulled_ids.contains(id) && !pending_ids.contains(id) {
                self.repo.delete_by_id(collection, id).await?;
            }
        }

        if !pulled.is_empty() {
            self.repo.update(collection, pulled.to_vec()).await?;
        }
        Ok(())
    }
}
