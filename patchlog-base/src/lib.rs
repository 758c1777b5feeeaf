//! Base types and utilities for patchlog
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(patchlog_docsrs, feature(doc_auto_cfg))]

mod hash;
mod key;

pub use self::{
    hash::Hash,
    key::{KeyParsingError, PeerId, PublicKey, SecretKey, Signature, SignatureError},
};
