//! Signed, content-addressed patch logs merged into a deterministic causal order.
//!
//! Every mutable object is represented as the history of its edits. Each device appends
//! [`SignedPatch`]es to its author's log for an object, the [`PatchStore`] persists them with
//! single writer per author guarantees, and [`ObjectState`] merges all author logs of an object
//! back into one total order that every replica agrees on.
//!
//! ```no_run
//! # async fn run() -> n0_snafu::Result<()> {
//! use patchlog::{AccountId, ObjectId, ObjectState, SecretKey, config::Config};
//!
//! let store = Config::default().open_store()?;
//! let key = SecretKey::generate(&mut rand::rngs::OsRng);
//! let author = AccountId::from_public_key(&key.public());
//! let object = ObjectId::derive(b"my document");
//!
//! let mut state = ObjectState::new(object, vec![]);
//! let patch = state.new_patch(author, &key, "text/append", b"hello".to_vec())?;
//! store.add_patch(patch).await?;
//!
//! let mut state = store.load_state(object).await?;
//! for patch in state.merge()? {
//!     println!("{} {}", patch.seq, patch.kind);
//! }
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(patchlog_docsrs, feature(doc_auto_cfg))]

pub mod changeset;
pub mod config;
pub mod envelope;
pub mod heap;
pub mod patch;
pub mod registry;
pub mod store;

pub use patchlog_base::{Hash, PeerId, PublicKey, SecretKey, Signature};

pub use self::{
    changeset::ObjectState,
    envelope::SignedEnvelope,
    heap::PatchHeap,
    patch::{AccountId, ObjectId, Patch, PatchId, SignedPatch},
    registry::{KindRegistry, PatchBody, TypedBody},
    store::{BlobStore, Head, HeadIndex, PatchStore},
};
