// processor/network.rs - Network mode: every operation hits the network
// directly; the local cache is never read or written (§4.6).

use async_trait::async_trait;
use std::sync::Arc;

use super::DataProcessor;
use crate::entity::Entity;
use crate::error::Result;
use crate::network::NetworkRepository;
use crate::query::{Aggregation, GroupResult, Query};

pub struct NetworkProcessor {
    collection: String,
    network: Arc<NetworkRepository>,
}

impl NetworkProcessor {
    pub fn new(collection: impl Into<String>, network: Arc<NetworkRepository>) -> Self {
        Self {
            collection: collection.into(),
            network,
        }
    }
}

#[async_trait]
impl DataProcessor for NetworkProcessor {
    async fn create(&self, entity: Entity) -> Result<Entity> {
        self.network.create(&self.collection, entity).await
    }

    async fn update(&self, entity: Entity) -> Result<Entity> {
        self.network.update(&self.collection, entity).await
    }

    async fn read(&self, query: Option<&Query>) -> Result<Vec<Entity>> {
        Ok(self.network.read(&self.collection, query).await?.entities)
    }

    async fn read_by_id(&self, id: &str) -> Result<Entity> {
        self.network.read_by_id(&self.collection, id).await
    }

    async fn count(&self, query: Option<&Query>) -> Result<usize> {
        Ok(self.network.count(&self.collection, query).await? as usize)
    }

    async fn delete(&self, query: Option<&Query>) -> Result<usize> {
        let entities = self.network.read(&self.collection, query).await?.entities;
        let mut removed = 0;
        for entity in entities {
            if let Some(id) = crate::entity::id_of(&entity) {
                removed += self.network.delete_by_id(&self.collection, id).await? as usize;
            }
        }
        Ok(removed)
    }

    async fn delete_by_id(&self, id: &str) -> Result<usize> {
        Ok(self.network.delete_by_id(&self.collection, id).await? as usize)
    }

    async fn group(&self, aggregation: &Aggregation) -> Result<Vec<GroupResult>> {
        self.network.group(&self.collection, aggregation).await
    }

    async fn clear(&self, _query: Option<&Query>) -> Result<()> {
        // Network mode never touches local state; there's nothing to clear
        // server-side that isn't already an explicit per-entity delete.
        Ok(())
    }
}
