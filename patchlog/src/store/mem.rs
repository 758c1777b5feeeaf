//! In-memory storage collaborators.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::RwLock;
use patchlog_base::Hash;

use super::{BlobStore, Head, HeadIndex, PatchStore, StorageError};
use crate::patch::{AccountId, ObjectId};

/// A [`PatchStore`] that keeps everything in memory.
pub type MemStore = PatchStore<MemBlobStore, MemHeadIndex>;

impl MemStore {
    /// Creates an empty in-memory store.
    pub fn memory() -> Self {
        Self::new(MemBlobStore::default(), MemHeadIndex::default())
    }
}

/// Blobs kept in a hash map. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemBlobStore {
    blobs: Arc<RwLock<HashMap<Hash, Bytes>>>,
}

impl MemBlobStore {
    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Removes a blob, returning whether it was present.
    pub fn remove(&self, hash: &Hash) -> bool {
        self.blobs.write().remove(hash).is_some()
    }
}

impl BlobStore for MemBlobStore {
    async fn get(&self, hash: Hash) -> Result<Option<Bytes>, StorageError> {
        Ok(self.blobs.read().get(&hash).cloned())
    }

    async fn put(&self, data: Bytes) -> Result<Hash, StorageError> {
        let hash = Hash::new(&data);
        self.blobs.write().entry(hash).or_insert(data);
        Ok(hash)
    }

    async fn has(&self, hash: Hash) -> Result<bool, StorageError> {
        Ok(self.blobs.read().contains_key(&hash))
    }
}

/// Heads kept in a map per object. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemHeadIndex {
    heads: Arc<RwLock<HashMap<ObjectId, BTreeMap<AccountId, Head>>>>,
}

impl HeadIndex for MemHeadIndex {
    async fn get(&self, object: ObjectId, author: AccountId) -> Result<Option<Head>, StorageError> {
        let heads = self.heads.read();
        Ok(heads
            .get(&object)
            .and_then(|authors| authors.get(&author))
            .copied())
    }

    async fn list(&self, object: ObjectId) -> Result<Vec<(AccountId, Head)>, StorageError> {
        let heads = self.heads.read();
        let Some(authors) = heads.get(&object) else {
            return Ok(Vec::new());
        };
        Ok(authors.iter().map(|(a, h)| (*a, *h)).collect())
    }

    async fn compare_and_set(
        &self,
        object: ObjectId,
        author: AccountId,
        expected: Option<Head>,
        new: Head,
    ) -> Result<bool, StorageError> {
        let mut heads = self.heads.write();
        let authors = heads.entry(object).or_default();
        if authors.get(&author).copied() != expected {
            return Ok(false);
        }
        authors.insert(author, new);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchId;

    fn head(seq: u64) -> Head {
        Head {
            id: PatchId::of(seq.to_be_bytes()),
            seq,
            lamport_time: seq,
        }
    }

    #[tokio::test]
    async fn blobs() -> n0_snafu::Result {
        let store = MemBlobStore::default();
        let data = Bytes::from_static(b"hello");
        let hash = store.put(data.clone()).await?;
        assert_eq!(hash, Hash::new(b"hello"));
        assert_eq!(store.put(data.clone()).await?, hash);
        assert_eq!(store.len(), 1);
        assert!(store.has(hash).await?);
        assert_eq!(store.get(hash).await?, Some(data));
        assert!(store.remove(&hash));
        assert_eq!(store.get(hash).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_set() -> n0_snafu::Result {
        let index = MemHeadIndex::default();
        let object = ObjectId::derive(b"object");
        let a = AccountId::from_bytes([1; 32]);
        let b = AccountId::from_bytes([2; 32]);

        assert!(index.compare_and_set(object, a, None, head(1)).await?);
        // a second creation loses
        assert!(!index.compare_and_set(object, a, None, head(1)).await?);
        assert!(!index.compare_and_set(object, a, Some(head(2)), head(3)).await?);
        assert!(index.compare_and_set(object, a, Some(head(1)), head(2)).await?);
        assert!(index.compare_and_set(object, b, None, head(1)).await?);

        assert_eq!(index.get(object, a).await?, Some(head(2)));
        assert_eq!(
            index.list(object).await?,
            vec![(a, head(2)), (b, head(1))]
        );
        assert!(index.list(ObjectId::derive(b"other")).await?.is_empty());
        Ok(())
    }
}
