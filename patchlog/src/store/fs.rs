//! Storage collaborators backed by a redb database.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use patchlog_base::Hash;
use redb::{Database, ReadableTable, TableDefinition, backends::InMemoryBackend};
use snafu::ResultExt;
use tracing::info;

use super::{BlobStore, Head, HeadIndex, IoSnafu, JoinSnafu, PatchStore, StorageError};
use crate::patch::{AccountId, ObjectId, PatchId};

/// Table: Blobs
/// Key:   `[u8; 32]` # Hash of the blob
/// Value: `&[u8]`    # Encoded signed patch
const BLOBS_TABLE: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("blobs-1");

/// Table: Heads
/// Key:   `([u8; 32], [u8; 32])`    # (ObjectId, AccountId)
/// Value: `([u8; 32], u64, u64)`    # (PatchId, seq, lamport_time)
const HEADS_TABLE: TableDefinition<HeadsKey, HeadsValue> = TableDefinition::new("heads-1");
type HeadsKey<'a> = (&'a [u8; 32], &'a [u8; 32]);
type HeadsValue<'a> = (&'a [u8; 32], u64, u64);

/// A [`PatchStore`] keeping blobs and heads in one redb database.
pub type FsPatchStore = PatchStore<FsStore, FsStore>;

impl FsPatchStore {
    /// Creates a patch store on top of `store`, used both as blob store and head index.
    pub fn from_db(store: FsStore, watch_capacity: usize) -> Self {
        Self::with_watch_capacity(store.clone(), store, watch_capacity)
    }
}

/// Blob store and head index in a single redb database.
///
/// Every head update runs in its own write transaction, which makes compare-and-set atomic.
/// Clones share the database.
#[derive(Debug, Clone)]
pub struct FsStore {
    db: Arc<Database>,
}

impl FsStore {
    /// Opens or creates the database at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("loading patch database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu)?;
        }
        let db = Database::builder().create(path)?;
        Self::open(db)
    }

    /// Creates a database that lives in memory only.
    pub fn in_memory() -> Result<Self, StorageError> {
        info!("using in-memory patch database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    /// Wraps an open database, creating the tables if needed.
    pub fn open(db: Database) -> Result<Self, StorageError> {
        let write_tx = db.begin_write()?;
        {
            let _blobs = write_tx.open_table(BLOBS_TABLE)?;
            let _heads = write_tx.open_table(HEADS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context(JoinSnafu)?
    }
}

fn head_from_row((id, seq, lamport_time): HeadsValue<'_>) -> Head {
    Head {
        id: PatchId::from_bytes(*id),
        seq,
        lamport_time,
    }
}

impl BlobStore for FsStore {
    async fn get(&self, hash: Hash) -> Result<Option<Bytes>, StorageError> {
        self.blocking(move |db| {
            let tx = db.begin_read()?;
            let table = tx.open_table(BLOBS_TABLE)?;
            let blob = table
                .get(hash.as_bytes())?
                .map(|row| Bytes::copy_from_slice(row.value()));
            Ok(blob)
        })
        .await
    }

    async fn put(&self, data: Bytes) -> Result<Hash, StorageError> {
        let hash = Hash::new(&data);
        self.blocking(move |db| {
            let tx = db.begin_write()?;
            {
                let mut table = tx.open_table(BLOBS_TABLE)?;
                let exists = table.get(hash.as_bytes())?.is_some();
                if !exists {
                    table.insert(hash.as_bytes(), data.as_ref())?;
                }
            }
            tx.commit()?;
            Ok(hash)
        })
        .await
    }

    async fn has(&self, hash: Hash) -> Result<bool, StorageError> {
        self.blocking(move |db| {
            let tx = db.begin_read()?;
            let table = tx.open_table(BLOBS_TABLE)?;
            Ok(table.get(hash.as_bytes())?.is_some())
        })
        .await
    }
}

impl HeadIndex for FsStore {
    async fn get(&self, object: ObjectId, author: AccountId) -> Result<Option<Head>, StorageError> {
        self.blocking(move |db| {
            let tx = db.begin_read()?;
            let table = tx.open_table(HEADS_TABLE)?;
            let head = table
                .get((object.as_bytes(), author.as_bytes()))?
                .map(|row| head_from_row(row.value()));
            Ok(head)
        })
        .await
    }

    async fn list(&self, object: ObjectId) -> Result<Vec<(AccountId, Head)>, StorageError> {
        self.blocking(move |db| {
            let tx = db.begin_read()?;
            let table = tx.open_table(HEADS_TABLE)?;
            let start = (object.as_bytes(), &[0u8; 32]);
            let end = (object.as_bytes(), &[0xffu8; 32]);
            let mut heads = Vec::new();
            for row in table.range(start..=end)? {
                let (key, value) = row?;
                let (_, author) = key.value();
                heads.push((AccountId::from_bytes(*author), head_from_row(value.value())));
            }
            Ok(heads)
        })
        .await
    }

    async fn compare_and_set(
        &self,
        object: ObjectId,
        author: AccountId,
        expected: Option<Head>,
        new: Head,
    ) -> Result<bool, StorageError> {
        self.blocking(move |db| {
            let key = (object.as_bytes(), author.as_bytes());
            let tx = db.begin_write()?;
            let swapped = {
                let mut table = tx.open_table(HEADS_TABLE)?;
                let current = table.get(key)?.map(|row| head_from_row(row.value()));
                if current == expected {
                    table.insert(key, (new.id.as_bytes(), new.seq, new.lamport_time))?;
                    true
                } else {
                    false
                }
            };
            if swapped {
                tx.commit()?;
            } else {
                tx.abort()?;
            }
            Ok(swapped)
        })
        .await
    }
}
