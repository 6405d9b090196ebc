// persister.rs - KeyValuePersister: the one interface the offline cache
// needs from its host platform.
//
// Concrete backends (SQLite, WebSQL, an in-memory store on mobile) are
// platform collaborators and live outside this crate; only the trait and a
// reference in-memory implementation (used by the crate's own tests) live here.

use async_trait::async_trait;

use crate::error::Result;

/// Byte/JSON-level read/write of opaque blobs keyed by string.
///
/// Implementations own durability; the core only requires last-write-visible
/// reads and atomic per-key replace/delete.
#[async_trait]
pub trait KeyValuePersister: Send + Sync {
    /// Reads the raw bytes stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replaces the bytes stored under `key`.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deletes the entry stored under `key`. No-op if absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists every key with the given prefix (used by `clear(None)` to find
    /// all of an app's collections).
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Reference in-memory `KeyValuePersister`, used by this crate's own test
/// suite and as a template for a minimal platform backend.
#[derive(Default)]
pub struct InMemoryPersister {
    data: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValuePersister for InMemoryPersister {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_and_lists_prefixes() {
        let p = InMemoryPersister::new();
        p.set("app.books", b"[]".to_vec()).await.unwrap();
        p.set("app.authors", b"[]".to_vec()).await.unwrap();
        p.set("other.books", b"[]".to_vec()).await.unwrap();

        assert_eq!(p.get("app.books").await.unwrap(), Some(b"[]".to_vec()));
        assert_eq!(p.get("missing").await.unwrap(), None);

        let mut keys = p.keys_with_prefix("app.").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["app.authors".to_string(), "app.books".to_string()]);

        p.delete("app.books").await.unwrap();
        assert_eq!(p.get("app.books").await.unwrap(), None);
    }
}
