//! Patches, the unit of change for every object, and their signed form.

use std::{
    cmp::Ordering,
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use nested_enum_utils::common_fields;
use patchlog_base::{Hash, PeerId, PublicKey, SecretKey, Signature};
use snafu::{Backtrace, ResultExt, Snafu, ensure};

use crate::envelope::{EnvelopeError, SignedEnvelope};

macro_rules! content_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, std::hash::Hash, derive_more::From,
            derive_more::Display,
        )]
        pub struct $name(Hash);

        impl $name {
            /// Create the identifier from its raw bytes.
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(Hash::from_bytes(bytes))
            }

            /// Raw bytes of the identifier.
            pub fn as_bytes(&self) -> &[u8; 32] {
                self.0.as_bytes()
            }

            /// The underlying content hash.
            pub fn hash(&self) -> Hash {
                self.0
            }

            /// Short form of the identifier, for logging.
            pub fn fmt_short(&self) -> impl fmt::Display + 'static {
                self.0.fmt_short()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.fmt_short())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl<C> minicbor::Encode<C> for $name {
            fn encode<W: minicbor::encode::Write>(
                &self,
                e: &mut minicbor::Encoder<W>,
                _ctx: &mut C,
            ) -> Result<(), minicbor::encode::Error<W::Error>> {
                e.bytes(self.as_bytes())?;
                Ok(())
            }
        }

        impl<'b, C> minicbor::Decode<'b, C> for $name {
            fn decode(
                d: &mut minicbor::Decoder<'b>,
                _ctx: &mut C,
            ) -> Result<Self, minicbor::decode::Error> {
                let bytes: [u8; 32] = d.bytes()?.try_into().map_err(|_| {
                    minicbor::decode::Error::message(concat!(
                        stringify!($name),
                        " must be exactly 32 bytes"
                    ))
                })?;
                Ok(Self::from_bytes(bytes))
            }
        }
    };
}

content_id! {
    /// Identifier of a [`SignedPatch`]: the hash of its encoded envelope.
    PatchId
}

content_id! {
    /// Identifier of an object whose history is made of patches.
    ObjectId
}

content_id! {
    /// Identifier of the account on whose behalf patches are authored.
    AccountId
}

impl PatchId {
    /// Computes the id of an encoded envelope.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self(Hash::new(data))
    }
}

impl ObjectId {
    /// Derives an object id from arbitrary content, e.g. the encoded genesis of the object.
    pub fn derive(content: impl AsRef<[u8]>) -> Self {
        Self(Hash::new(content))
    }
}

impl AccountId {
    /// Derives the account id belonging to an account root key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(Hash::new(key.as_bytes()))
    }
}

/// A single immutable edit to an object.
///
/// Field numbers are part of the wire format, they must never change.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
#[cbor(map)]
pub struct Patch {
    /// Account on whose behalf the edit is made.
    #[n(0)]
    pub author: AccountId,
    /// Object being edited.
    #[n(1)]
    pub object_id: ObjectId,
    /// Patches this one immediately depends on.
    ///
    /// If the author has earlier patches for the object, the first entry is the author's
    /// previous patch.
    #[n(2)]
    pub deps: Vec<PatchId>,
    /// Per author, per object counter starting at 1.
    #[n(3)]
    pub seq: u64,
    /// Logical clock, larger than the clock of every dependency.
    #[n(4)]
    pub lamport_time: u64,
    /// Number of patches observed by the author when this one was created, including it.
    #[n(5)]
    pub log_time: u64,
    /// Names the schema of [`Self::body`].
    #[n(6)]
    pub kind: String,
    /// Opaque body, interpreted by whoever registered [`Self::kind`].
    #[n(7)]
    #[cbor(with = "minicbor::bytes")]
    pub body: Vec<u8>,
    /// Optional human readable annotation.
    #[n(8)]
    pub message: Option<String>,
    /// Wall clock seconds since the unix epoch. Advisory only.
    #[n(9)]
    pub create_time: u64,
}

impl Patch {
    /// The causal total order over patches.
    ///
    /// Sorts by lamport time, then by author. Two patches of one author never share a lamport
    /// time in a valid log, the trailing `seq` comparison only keeps the order total for
    /// corrupt input.
    pub fn causal_cmp(&self, other: &Patch) -> Ordering {
        self.lamport_time
            .cmp(&other.lamport_time)
            .then_with(|| self.author.as_bytes().cmp(other.author.as_bytes()))
            .then_with(|| self.seq.cmp(&other.seq))
    }

    /// Whether `self` sorts strictly before `other` in the causal order.
    pub fn less(&self, other: &Patch) -> bool {
        self.causal_cmp(other) == Ordering::Less
    }

    /// The author's previous patch, if this is not the author's first one.
    pub fn prev(&self) -> Option<&PatchId> {
        match self.seq {
            0 | 1 => None,
            _ => self.deps.first(),
        }
    }
}

/// Seconds since the unix epoch, zero if the clock is set before it.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Error when signing a [`Patch`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum SignError {
    #[snafu(transparent)]
    Envelope { source: EnvelopeError },
}

/// Error when decoding a [`SignedPatch`] from its envelope.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DecodeError {
    /// The envelope is malformed or its signature is invalid.
    #[snafu(transparent)]
    Envelope { source: EnvelopeError },
    /// The payload is not a valid patch.
    #[snafu(display("failed to decode patch payload"))]
    Decoding { source: minicbor::decode::Error },
    /// The payload holds more than the patch.
    #[snafu(display("{len} trailing bytes after the patch"))]
    TrailingBytes { len: usize },
}

impl DecodeError {
    /// Whether the failure was a signature mismatch, as opposed to a structural problem.
    pub fn is_signature_invalid(&self) -> bool {
        matches!(
            self,
            DecodeError::Envelope {
                source: EnvelopeError::SignatureInvalid { .. },
                ..
            }
        )
    }
}

/// A [`Patch`] wrapped in a signed envelope and addressed by the hash of that envelope.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct SignedPatch(Arc<Inner>);

impl fmt::Debug for SignedPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedPatch({})", self.0.id.fmt_short())
    }
}

#[derive(Debug)]
struct Inner {
    id: PatchId,
    peer_id: PeerId,
    patch: Patch,
    envelope: SignedEnvelope,
}

impl SignedPatch {
    /// Signs `patch` with the device key.
    pub fn sign(patch: Patch, secret_key: &SecretKey) -> Result<Self, SignError> {
        let envelope = SignedEnvelope::sign(&patch, secret_key)?;
        Ok(Self::from_parts(patch, envelope))
    }

    /// Verifies an encoded envelope and decodes the patch inside.
    pub fn decode(data: impl Into<Bytes>) -> Result<Self, DecodeError> {
        let envelope = SignedEnvelope::verify(data)?;
        let payload = envelope.payload();
        let mut d = minicbor::Decoder::new(&payload);
        let patch: Patch = d.decode().context(DecodingSnafu)?;
        ensure!(
            d.position() == payload.len(),
            TrailingBytesSnafu {
                len: payload.len() - d.position()
            }
        );
        Ok(Self::from_parts(patch, envelope))
    }

    fn from_parts(patch: Patch, envelope: SignedEnvelope) -> Self {
        let id = PatchId::of(envelope.as_bytes());
        let peer_id = envelope.public_key().peer_id();
        Self(Arc::new(Inner {
            id,
            peer_id,
            patch,
            envelope,
        }))
    }

    /// Content derived identifier of this patch.
    pub fn id(&self) -> PatchId {
        self.0.id
    }

    /// Identifier of the device that signed this patch.
    pub fn peer_id(&self) -> PeerId {
        self.0.peer_id
    }

    /// The signed patch.
    pub fn patch(&self) -> &Patch {
        &self.0.patch
    }

    /// Public key of the signing device.
    pub fn public_key(&self) -> &PublicKey {
        self.0.envelope.public_key()
    }

    /// Signature over the encoded patch.
    pub fn signature(&self) -> &Signature {
        self.0.envelope.signature()
    }

    /// The encoded envelope, the bytes [`Self::id`] is computed from.
    pub fn as_bytes(&self) -> &Bytes {
        self.0.envelope.as_bytes()
    }
}

impl std::ops::Deref for SignedPatch {
    type Target = Patch;

    fn deref(&self) -> &Self::Target {
        &self.0.patch
    }
}

impl PartialEq for SignedPatch {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for SignedPatch {}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn key(seed: u64) -> SecretKey {
        SecretKey::generate(&mut rand_chacha::ChaCha8Rng::seed_from_u64(seed))
    }

    fn patch(author: AccountId, seq: u64, lamport_time: u64) -> Patch {
        Patch {
            author,
            object_id: ObjectId::derive(b"object"),
            deps: vec![],
            seq,
            lamport_time,
            log_time: lamport_time,
            kind: "test/note".to_string(),
            body: b"body".to_vec(),
            message: None,
            create_time: 1_700_000_000,
        }
    }

    #[test]
    fn sign_decode() {
        let key = key(0);
        let author = AccountId::from_public_key(&key.public());
        let mut p = patch(author, 2, 5);
        p.deps = vec![PatchId::of(b"prev"), PatchId::of(b"other")];
        p.message = Some("second".to_string());

        let signed = SignedPatch::sign(p.clone(), &key).unwrap();
        assert_eq!(signed.id(), PatchId::of(signed.as_bytes()));
        assert_eq!(signed.peer_id(), key.public().peer_id());
        assert_eq!(signed.public_key(), &key.public());
        assert_eq!(signed.patch(), &p);

        let decoded = SignedPatch::decode(signed.as_bytes().clone()).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(decoded.patch(), &p);
        assert_eq!(decoded.prev(), Some(&PatchId::of(b"prev")));
    }

    #[test]
    fn ids_are_deterministic() {
        let key = key(1);
        let author = AccountId::from_public_key(&key.public());
        let a = SignedPatch::sign(patch(author, 1, 1), &key).unwrap();
        let b = SignedPatch::sign(patch(author, 1, 1), &key).unwrap();
        assert_eq!(a.id(), b.id());

        let c = SignedPatch::sign(patch(author, 1, 2), &key).unwrap();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn decode_rejects_tampering() {
        let key = key(2);
        let author = AccountId::from_public_key(&key.public());
        let signed = SignedPatch::sign(patch(author, 1, 1), &key).unwrap();
        let mut bytes = signed.as_bytes().to_vec();
        let pos = bytes
            .windows(4)
            .position(|w| w == b"body")
            .expect("body in envelope");
        bytes[pos] = b'B';
        let err = SignedPatch::decode(bytes).unwrap_err();
        assert!(err.is_signature_invalid(), "{err:?}");
    }

    #[test]
    fn decode_rejects_non_patch_payload() {
        #[derive(minicbor::Encode)]
        #[cbor(map)]
        struct NotAPatch {
            #[n(0)]
            hello: String,
        }
        let env = SignedEnvelope::sign(
            &NotAPatch {
                hello: "world".into(),
            },
            &key(3),
        )
        .unwrap();
        let err = SignedPatch::decode(env.into_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Decoding { .. }), "{err:?}");
    }

    #[test]
    fn decode_rejects_data_after_the_patch() {
        let key = key(4);
        let author = AccountId::from_public_key(&key.public());
        let mut payload = minicbor::to_vec(patch(author, 1, 1)).unwrap();
        payload.extend(minicbor::to_vec(7u8).unwrap());
        let signature = key.sign(&payload);

        // a well signed envelope around the extended payload
        let mut e = minicbor::Encoder::new(Vec::new());
        e.map(4)
            .unwrap()
            .str("payloadSize")
            .unwrap()
            .u64(payload.len() as u64)
            .unwrap()
            .str("payload")
            .unwrap();
        e.writer_mut().extend_from_slice(&payload);
        e.str("signature")
            .unwrap()
            .bytes(&signature.to_bytes())
            .unwrap()
            .str("publicKey")
            .unwrap()
            .bytes(key.public().as_bytes())
            .unwrap();

        let err = SignedPatch::decode(e.into_writer()).unwrap_err();
        assert!(matches!(err, DecodeError::TrailingBytes { len: 1, .. }), "{err:?}");
    }

    #[test]
    fn causal_order() {
        let a = AccountId::from_bytes([1; 32]);
        let b = AccountId::from_bytes([2; 32]);

        assert!(patch(a, 1, 1).less(&patch(a, 2, 2)));
        assert!(patch(b, 1, 1).less(&patch(a, 2, 2)));
        // ties on lamport time are broken by author bytes
        assert!(patch(a, 3, 3).less(&patch(b, 1, 3)));
        assert!(!patch(b, 1, 3).less(&patch(a, 3, 3)));
        assert!(!patch(a, 1, 1).less(&patch(a, 1, 1)));
    }

    #[test]
    fn prev_only_for_later_patches() {
        let a = AccountId::from_bytes([1; 32]);
        let mut first = patch(a, 1, 4);
        first.deps = vec![PatchId::of(b"someone else")];
        assert_eq!(first.prev(), None);
    }
}
