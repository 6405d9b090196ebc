// lib.rs - Offline-capable data store core: Network/Sync/Cache stores over
// an outbound sync queue and a delta-set/auto-pagination pull protocol.

mod auth;
mod cache_read;
mod client;
mod datastore;
mod entity;
mod error;
mod network;
mod offline_repository;
mod persister;
mod processor;
mod promise_queue;
mod query;
mod query_cache;
mod registry;
mod sync_manager;
mod sync_state;

pub use auth::{AuthProvider, AuthType, SessionCredentials};
pub use cache_read::CacheRead;
pub use client::{ClientConfig, Clock, SystemClock};
pub use datastore::{DataStore, Mode};
pub use entity::{ensure_id_and_stamp, generate_local_id, id_of, is_local, strip_local_markers, Entity};
pub use error::{Error, Result};
pub use network::{DeltaSetPage, NetworkRepository, Page};
pub use offline_repository::OfflineRepository;
pub use persister::{InMemoryPersister, KeyValuePersister};
pub use query::{Aggregation, Filter, GroupResult, Query, ReduceOp, SortDirection};
pub use query_cache::QueryCache;
pub use sync_manager::{PullOptions, PullSummary, PushResult, PushSummary, SyncManager};
pub use sync_state::{SyncItem, SyncOperation, SyncStateManager};
