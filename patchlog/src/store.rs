//! Persistence of patch logs.
//!
//! A [`PatchStore`] coordinates two collaborators: a [`BlobStore`] holding encoded patches by
//! content hash, and a [`HeadIndex`] pointing at the latest patch of every (object, author)
//! log. Patches are always appended at the head, and the head only moves through an atomic
//! compare-and-set, so every author log stays a dense chain from seq 1 to its head.

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use futures_util::future::try_join_all;
use nested_enum_utils::common_fields;
use patchlog_base::Hash;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    changeset::ObjectState,
    patch::{AccountId, DecodeError, ObjectId, PatchId, SignedPatch},
};

pub mod fs;
pub mod mem;

/// Default capacity of channels created by [`PatchStore::subscribe`].
pub const DEFAULT_WATCH_CAPACITY: usize = 64;

/// Errors from a storage collaborator.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum StorageError {
    #[snafu(transparent)]
    Database { source: redb::DatabaseError },
    #[snafu(transparent)]
    Transaction { source: redb::TransactionError },
    #[snafu(transparent)]
    Table { source: redb::TableError },
    #[snafu(transparent)]
    Storage { source: redb::StorageError },
    #[snafu(transparent)]
    Commit { source: redb::CommitError },
    #[snafu(display("failed to prepare the database directory"))]
    Io { source: std::io::Error },
    #[snafu(display("storage task failed"))]
    Join { source: tokio::task::JoinError },
    /// Any other backend failure.
    #[snafu(display("storage backend failed: {reason}"))]
    Backend { reason: String },
}

/// Errors when appending a patch to its author's log.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AddPatchError {
    /// The patch is not the next one of its author's log.
    ///
    /// This covers duplicates, gaps and losing a race against a concurrent append.
    #[snafu(display("patch of {author} has seq {seq}, expected {expected}"))]
    SequenceConflict {
        author: AccountId,
        seq: u64,
        expected: u64,
    },
    /// The patch does not name the current head of its author's log as first dependency.
    #[snafu(display("patch of {author} does not follow head {head}, found {found:?}"))]
    DependencyMismatch {
        author: AccountId,
        head: PatchId,
        found: Option<PatchId>,
    },
    /// The patch does not advance past the lamport time of its author's head.
    #[snafu(display(
        "patch of {author} has lamport time {lamport_time}, head is at {head_lamport_time}"
    ))]
    LamportRegression {
        author: AccountId,
        lamport_time: u64,
        head_lamport_time: u64,
    },
    #[snafu(transparent)]
    Storage { source: StorageError },
}

/// Errors when loading the state of an object.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum LoadStateError {
    /// A patch referenced by the logs is not stored locally and must be fetched first.
    #[snafu(display("missing patch {id}"))]
    MissingDependency { id: PatchId },
    /// A stored patch failed to decode or verify.
    #[snafu(display("failed to decode stored patch {id}"))]
    Decode { id: PatchId, source: DecodeError },
    /// The stored logs are inconsistent.
    #[snafu(display("invariant violated: {reason}"))]
    InvariantViolation { reason: String },
    #[snafu(transparent)]
    Storage { source: StorageError },
    /// The load was cancelled.
    #[snafu(display("load cancelled"))]
    Cancelled {},
}

/// Pointer to the latest patch of an author's log for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    /// Id of the latest patch.
    pub id: PatchId,
    /// Seq of the latest patch, the length of the log.
    pub seq: u64,
    /// Lamport time of the latest patch.
    pub lamport_time: u64,
}

impl Head {
    /// The head pointing at `patch`.
    pub fn of(patch: &SignedPatch) -> Self {
        Self {
            id: patch.id(),
            seq: patch.seq,
            lamport_time: patch.lamport_time,
        }
    }
}

/// Content addressed storage of encoded patches.
pub trait BlobStore: Send + Sync + 'static {
    /// Returns the blob with the given hash.
    fn get(&self, hash: Hash) -> impl Future<Output = Result<Option<Bytes>, StorageError>> + Send;

    /// Stores a blob, returning its BLAKE3 hash. Storing a blob twice is not an error.
    fn put(&self, data: Bytes) -> impl Future<Output = Result<Hash, StorageError>> + Send;

    /// Whether a blob with the given hash is stored.
    fn has(&self, hash: Hash) -> impl Future<Output = Result<bool, StorageError>> + Send;
}

/// Index of the head of every (object, author) log.
pub trait HeadIndex: Send + Sync + 'static {
    /// Returns the head of `author`'s log for `object`.
    fn get(
        &self,
        object: ObjectId,
        author: AccountId,
    ) -> impl Future<Output = Result<Option<Head>, StorageError>> + Send;

    /// Returns the heads of all logs of `object`.
    fn list(
        &self,
        object: ObjectId,
    ) -> impl Future<Output = Result<Vec<(AccountId, Head)>, StorageError>> + Send;

    /// Atomically replaces the head of `author`'s log with `new` if it currently equals
    /// `expected`, `None` meaning the log does not exist yet.
    ///
    /// Returns whether the head was replaced.
    fn compare_and_set(
        &self,
        object: ObjectId,
        author: AccountId,
        expected: Option<Head>,
        new: Head,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;
}

/// Stores patch logs and hands out merged object states.
///
/// Cloning is cheap, clones share the collaborators and watchers.
#[derive(Debug)]
pub struct PatchStore<B, H> {
    inner: Arc<Inner<B, H>>,
}

impl<B, H> Clone for PatchStore<B, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<B, H> {
    blobs: B,
    heads: H,
    /// Serializes head updates with their broadcast, so watchers see commit order.
    commit: tokio::sync::Mutex<()>,
    /// Never held across an await.
    watchers: parking_lot::Mutex<Vec<Watcher>>,
    watch_capacity: usize,
}

#[derive(Debug, Clone)]
struct Watcher {
    sender: mpsc::Sender<SignedPatch>,
    /// Fires on [`PatchStore::unwatch`], aborting a pending send.
    removed: CancellationToken,
}

impl<B: BlobStore, H: HeadIndex> PatchStore<B, H> {
    /// Creates a store on top of the given collaborators.
    pub fn new(blobs: B, heads: H) -> Self {
        Self::with_watch_capacity(blobs, heads, DEFAULT_WATCH_CAPACITY)
    }

    /// Creates a store whose [`Self::subscribe`] channels hold `watch_capacity` patches.
    pub fn with_watch_capacity(blobs: B, heads: H, watch_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                blobs,
                heads,
                commit: tokio::sync::Mutex::new(()),
                watchers: parking_lot::Mutex::new(Vec::new()),
                watch_capacity: watch_capacity.max(1),
            }),
        }
    }

    /// The blob store collaborator.
    pub fn blobs(&self) -> &B {
        &self.inner.blobs
    }

    /// The head index collaborator.
    pub fn head_index(&self) -> &H {
        &self.inner.heads
    }

    /// Appends a patch to its author's log.
    ///
    /// The patch must carry the next seq of the log and, unless it starts the log, name the
    /// current head as first dependency, with a larger lamport time than the head. Once the
    /// head moved, the patch is offered to every watcher before this returns, so a watcher
    /// that does not drain its channel stalls later appends until it is removed with
    /// [`Self::unwatch`] or its receiver is dropped.
    #[instrument(skip_all, fields(
        id = %patch.id().fmt_short(),
        author = %patch.author.fmt_short(),
        seq = patch.seq,
    ))]
    pub async fn add_patch(&self, patch: SignedPatch) -> Result<(), AddPatchError> {
        let object = patch.object_id;
        let author = patch.author;

        let current = self.inner.heads.get(object, author).await?;
        let expected = current.map(|head| head.seq).unwrap_or_default() + 1;
        ensure!(
            patch.seq == expected,
            SequenceConflictSnafu {
                author,
                seq: patch.seq,
                expected,
            }
        );
        if let Some(head) = current {
            let found = patch.deps.first().copied();
            ensure!(
                found == Some(head.id),
                DependencyMismatchSnafu {
                    author,
                    head: head.id,
                    found,
                }
            );
            ensure!(
                patch.lamport_time > head.lamport_time,
                LamportRegressionSnafu {
                    author,
                    lamport_time: patch.lamport_time,
                    head_lamport_time: head.lamport_time,
                }
            );
        }

        let hash = self.inner.blobs.put(patch.as_bytes().clone()).await?;
        debug_assert_eq!(hash, patch.id().hash());

        let _commit = self.inner.commit.lock().await;
        let swapped = self
            .inner
            .heads
            .compare_and_set(object, author, current, Head::of(&patch))
            .await?;
        if !swapped {
            warn!("head moved concurrently");
            return SequenceConflictSnafu {
                author,
                seq: patch.seq,
                expected,
            }
            .fail();
        }
        debug!("patch added");

        let watchers = self.inner.watchers.lock().clone();
        for watcher in &watchers {
            tokio::select! {
                biased;
                _ = watcher.removed.cancelled() => trace!("watcher removed"),
                res = watcher.sender.send(patch.clone()) => {
                    if res.is_err() {
                        trace!("watcher closed");
                    }
                }
            }
        }
        self.inner
            .watchers
            .lock()
            .retain(|watcher| !watcher.sender.is_closed());
        Ok(())
    }

    /// Appends several patches in order, stopping at the first failure.
    ///
    /// Patches before the failing one stay added.
    pub async fn add_patches(
        &self,
        patches: impl IntoIterator<Item = SignedPatch>,
    ) -> Result<(), AddPatchError> {
        for patch in patches {
            self.add_patch(patch).await?;
        }
        Ok(())
    }

    /// Loads all logs of `object` and prepares them for merging.
    pub async fn load_state(&self, object: ObjectId) -> Result<ObjectState, LoadStateError> {
        self.load_state_with_cancel(object, CancellationToken::new())
            .await
    }

    /// Like [`Self::load_state`], aborting with [`LoadStateError::Cancelled`] once `cancel`
    /// fires.
    #[instrument(skip_all, fields(object = %object.fmt_short()))]
    pub async fn load_state_with_cancel(
        &self,
        object: ObjectId,
        cancel: CancellationToken,
    ) -> Result<ObjectState, LoadStateError> {
        ensure!(!cancel.is_cancelled(), CancelledSnafu);
        let heads = self.inner.heads.list(object).await?;
        if heads.is_empty() {
            debug!("no logs");
            return Ok(ObjectState::new(object, vec![]));
        }

        let walks = heads
            .into_iter()
            .map(|(author, head)| self.walk_log(object, author, head));
        let logs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CancelledSnafu.fail(),
            logs = try_join_all(walks) => logs?,
        };
        debug!(authors = logs.len(), "logs loaded");
        Ok(ObjectState::new(object, logs))
    }

    /// Collects the log ending at `head` by following the first dependency of every patch.
    async fn walk_log(
        &self,
        object: ObjectId,
        author: AccountId,
        head: Head,
    ) -> Result<Vec<SignedPatch>, LoadStateError> {
        let mut log = Vec::new();
        let mut next = Some(head.id);
        for seq in (1..=head.seq).rev() {
            let Some(id) = next else {
                return InvariantViolationSnafu {
                    reason: format!(
                        "log of {} ends at seq {seq}, head is at {}",
                        author.fmt_short(),
                        head.seq
                    ),
                }
                .fail();
            };
            let Some(patch) = self.get_patch(id).await? else {
                return MissingDependencySnafu { id }.fail();
            };
            ensure!(
                patch.id() == id
                    && patch.author == author
                    && patch.object_id == object
                    && patch.seq == seq,
                InvariantViolationSnafu {
                    reason: format!(
                        "stored patch {} is not seq {seq} of {} in {}",
                        id.fmt_short(),
                        author.fmt_short(),
                        object.fmt_short()
                    )
                }
            );
            next = patch.deps.first().copied();
            log.push(patch);
        }
        log.reverse();
        trace!(author = %author.fmt_short(), len = log.len(), "walked log");
        Ok(log)
    }

    /// Returns a stored patch by id.
    pub async fn get_patch(&self, id: PatchId) -> Result<Option<SignedPatch>, LoadStateError> {
        let Some(data) = self.inner.blobs.get(id.hash()).await? else {
            return Ok(None);
        };
        let patch = SignedPatch::decode(data).context(DecodeSnafu { id })?;
        Ok(Some(patch))
    }

    /// Whether a patch is stored.
    pub async fn has_patch(&self, id: PatchId) -> Result<bool, StorageError> {
        self.inner.blobs.has(id.hash()).await
    }

    /// The heads of all logs of `object`.
    pub async fn heads(&self, object: ObjectId) -> Result<Vec<(AccountId, Head)>, StorageError> {
        self.inner.heads.list(object).await
    }

    /// Registers a channel that is offered every added patch, in the order they were added.
    ///
    /// The channel is dropped from the watchers once its receiver is closed.
    pub fn watch(&self, sender: mpsc::Sender<SignedPatch>) {
        self.inner.watchers.lock().push(Watcher {
            sender,
            removed: CancellationToken::new(),
        });
    }

    /// Unregisters a channel added with [`Self::watch`].
    ///
    /// An append currently blocked on this channel stops waiting and completes.
    pub fn unwatch(&self, sender: &mpsc::Sender<SignedPatch>) {
        self.inner.watchers.lock().retain(|watcher| {
            let same = watcher.sender.same_channel(sender);
            if same {
                watcher.removed.cancel();
            }
            !same
        });
    }

    /// Creates a watcher channel with the configured capacity.
    pub fn subscribe(&self) -> mpsc::Receiver<SignedPatch> {
        let (sender, receiver) = mpsc::channel(self.inner.watch_capacity);
        self.watch(sender);
        receiver
    }
}
