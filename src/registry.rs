// registry.rs - Process-wide per-appKey singletons (§9 Design Notes)
//
// Every `DataStore` for the same appKey shares one `OfflineRepository`, one
// `SyncStateManager`, one `QueryCache`, one `AuthProvider`, and one
// `SyncManager`, so that a sync item queued through one `DataStore` instance
// is visible to a push or pull issued through another. Grounded on the
// teacher's singleton-by-key pattern in `state.rs` (there, a single
// `AppState` behind Tauri's managed state; here, a `DashMap` keyed by appKey
// since there is no host framework providing that slot for us).

use std::sync::Arc;

use once_cell::sync::Lazy;

use dashmap::DashMap;

use crate::auth::AuthProvider;
use crate::client::ClientConfig;
use crate::network::NetworkRepository;
use crate::offline_repository::OfflineRepository;
use crate::persister::KeyValuePersister;
use crate::query_cache::QueryCache;
use crate::sync_manager::SyncManager;
use crate::sync_state::SyncStateManager;

/// Everything one appKey's `DataStore`s share.
pub struct AppContext {
    pub config: Arc<ClientConfig>,
    pub auth: Arc<AuthProvider>,
    pub repo: Arc<OfflineRepository>,
    pub network: Arc<NetworkRepository>,
    pub sync_state: Arc<SyncStateManager>,
    pub query_cache: Arc<QueryCache>,
    pub sync_manager: Arc<SyncManager>,
}

static REGISTRY: Lazy<DashMap<String, Arc<AppContext>>> = Lazy::new(DashMap::new);

/// Returns the shared context for `config.app_key`, constructing it (with
/// `persister` as the backing store) the first time this appKey is seen.
/// Subsequent calls for the same appKey ignore `persister` and return the
/// context built on first registration.
pub fn context_for(config: ClientConfig, persister: Arc<dyn KeyValuePersister>) -> crate::error::Result<Arc<AppContext>> {
    if let Some(existing) = REGISTRY.get(&config.app_key) {
        return Ok(existing.clone());
    }

    let config = Arc::new(config);
    let auth = Arc::new(AuthProvider::new(
        config.app_key.clone(),
        config.app_secret.clone(),
        config.master_secret.clone(),
    ));
    let repo = Arc::new(OfflineRepository::new(config.app_key.clone(), persister));
    let network = Arc::new(NetworkRepository::new(config.clone(), auth.clone())?);
    let sync_state = Arc::new(SyncStateManager::new(repo.clone()));
    let query_cache = Arc::new(QueryCache::new(repo.clone()));
    let sync_manager = Arc::new(SyncManager::new(
        repo.clone(),
        network.clone(),
        sync_state.clone(),
        query_cache.clone(),
        config.clone(),
    ));

    let context = Arc::new(AppContext {
        config,
        auth,
        repo,
        network,
        sync_state,
        query_cache,
        sync_manager,
    });

    Ok(REGISTRY
        .entry(context.config.app_key.clone())
        .or_insert(context)
        .clone())
}

/// Test/host-teardown hook: drops the shared context for `app_key`, if any.
pub fn clear(app_key: &str) {
    REGISTRY.remove(app_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::InMemoryPersister;

    #[test]
    fn same_app_key_returns_the_same_context() {
        clear("shared-app");
        let persister: Arc<dyn KeyValuePersister> = Arc::new(InMemoryPersister::new());
        let a = context_for(ClientConfig::new("shared-app", "secret"), persister.clone()).unwrap();
        let b = context_for(ClientConfig::new("shared-app", "secret"), persister).unwrap();
        assert!(Arc::ptr_eq(&a.repo, &b.repo));
    }
}
