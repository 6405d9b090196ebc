// processor/mod.rs - DataProcessor: per-mode operation dispatch (§4.6)
//
// `DataStore` holds one `Box<dyn DataProcessor>` chosen at construction time
// and forwards every public operation to it unchanged; the mode-specific
// behavior (network-only, cache-only + queued sync, or cache-first with a
// background refresh) lives entirely in the three implementations below.

mod cache;
mod network;
mod sync;

pub use cache::CacheProcessor;
pub use network::NetworkProcessor;
pub use sync::SyncProcessor;

use async_trait::async_trait;

use crate::entity::Entity;
use crate::error::Result;
use crate::query::{Aggregation, GroupResult, Query};

#[async_trait]
pub trait DataProcessor: Send + Sync {
    async fn create(&self, entity: Entity) -> Result<Entity>;
    async fn update(&self, entity: Entity) -> Result<Entity>;
    async fn read(&self, query: Option<&Query>) -> Result<Vec<Entity>>;
    async fn read_by_id(&self, id: &str) -> Result<Entity>;
    async fn count(&self, query: Option<&Query>) -> Result<usize>;
    async fn delete(&self, query: Option<&Query>) -> Result<usize>;
    async fn delete_by_id(&self, id: &str) -> Result<usize>;
    async fn group(&self, aggregation: &Aggregation) -> Result<Vec<GroupResult>>;
    /// Clears entities matching `query`, or the whole collection when `None` (§4.9).
    async fn clear(&self, query: Option<&Query>) -> Result<()>;
}
