//! Signed CBOR envelopes.
//!
//! A signed envelope is a single well formed CBOR map with exactly four entries, always
//! written in this order:
//!
//! ```text
//! {"payloadSize": <uint>, "payload": <map>, "signature": <bytes>, "publicKey": <bytes>}
//! ```
//!
//! The payload is embedded verbatim (it is not wrapped in a byte string), so the envelope
//! stays a browsable CBOR value. `payloadSize` lets a reader slice the payload bytes out
//! and get to the signature without parsing the payload, so verification is a single
//! linear pass over the input. Decoding the payload into a typed value is a separate step
//! that only happens after the signature checked out.

use std::{convert::Infallible, ops::Range};

use bytes::Bytes;
use minicbor::{Decoder, Encoder, data::Type};
use nested_enum_utils::common_fields;
use patchlog_base::{PublicKey, SecretKey, Signature, SignatureError};
use snafu::{Backtrace, ResultExt, Snafu, ensure};

const FIELD_PAYLOAD_SIZE: &str = "payloadSize";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_SIGNATURE: &str = "signature";
const FIELD_PUBLIC_KEY: &str = "publicKey";

const NUM_FIELDS: u64 = 4;

/// Errors when producing or reading a [`SignedEnvelope`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum EnvelopeError {
    /// The payload could not be encoded into a CBOR map.
    #[snafu(display("failed to encode payload: {reason}"))]
    Encoding { reason: String },
    /// The input does not follow the envelope layout.
    #[snafu(display("malformed envelope: {reason}"))]
    Malformed { reason: String },
    /// The signature does not match the payload and public key.
    #[snafu(display("envelope signature is invalid"))]
    SignatureInvalid { source: SignatureError },
}

/// A payload together with its signature and the public key of the signer.
///
/// Holds the full encoded envelope. Construct it with [`SignedEnvelope::sign`] or
/// [`SignedEnvelope::verify`]; there is no way to obtain an envelope whose signature was
/// not produced or checked locally.
#[derive(Clone, PartialEq, Eq, derive_more::Debug)]
pub struct SignedEnvelope {
    #[debug("{} bytes", data.len())]
    data: Bytes,
    #[debug(skip)]
    payload: Range<usize>,
    signature: Signature,
    public_key: PublicKey,
}

impl SignedEnvelope {
    /// Encodes `payload` as CBOR and signs the encoded bytes with `secret_key`.
    pub fn sign<T>(payload: &T, secret_key: &SecretKey) -> Result<Self, EnvelopeError>
    where
        T: minicbor::Encode<()>,
    {
        let data = minicbor::to_vec(payload).map_err(|err| {
            EncodingSnafu {
                reason: err.to_string(),
            }
            .build()
        })?;
        Self::sign_encoded(&data, secret_key)
    }

    /// Signs an already CBOR encoded payload.
    ///
    /// The bytes must hold exactly one CBOR map, they are embedded into the envelope as is.
    pub fn sign_encoded(payload: &[u8], secret_key: &SecretKey) -> Result<Self, EnvelopeError> {
        ensure!(
            !payload.is_empty(),
            EncodingSnafu {
                reason: "payload is empty"
            }
        );
        check_single_map(payload)?;

        let signature = secret_key.sign(payload);
        let public_key = secret_key.public();

        let (data, payload) = encode_envelope(payload, &signature, &public_key).map_err(|err| {
            EncodingSnafu {
                reason: err.to_string(),
            }
            .build()
        })?;

        Ok(Self {
            data: data.into(),
            payload,
            signature,
            public_key,
        })
    }

    /// Parses an encoded envelope and verifies its signature.
    ///
    /// The payload is located by its declared size and is not decoded.
    pub fn verify(data: impl Into<Bytes>) -> Result<Self, EnvelopeError> {
        let data: Bytes = data.into();
        let mut d = Decoder::new(&data);

        let len = d.map().map_err(malformed)?;
        ensure!(
            len == Some(NUM_FIELDS),
            MalformedSnafu {
                reason: format!("expected a map of {NUM_FIELDS} entries, found {len:?}")
            }
        );

        expect_key(&mut d, FIELD_PAYLOAD_SIZE)?;
        let size = d.u64().map_err(malformed)?;
        let size = usize::try_from(size).map_err(|_| {
            MalformedSnafu {
                reason: "payload size overflows",
            }
            .build()
        })?;

        expect_key(&mut d, FIELD_PAYLOAD)?;
        let start = d.position();
        let end = start.checked_add(size).filter(|end| *end <= data.len());
        let Some(end) = end else {
            return MalformedSnafu {
                reason: format!("payload of {size} bytes exceeds the envelope"),
            }
            .fail();
        };
        d.set_position(end);

        expect_key(&mut d, FIELD_SIGNATURE)?;
        let signature = d.bytes().map_err(malformed)?;
        let signature = Signature::try_from(signature).map_err(|_| {
            MalformedSnafu {
                reason: format!("signature must be {} bytes", Signature::LENGTH),
            }
            .build()
        })?;

        expect_key(&mut d, FIELD_PUBLIC_KEY)?;
        let public_key = d.bytes().map_err(malformed)?;
        let public_key = PublicKey::try_from(public_key).map_err(|err| {
            MalformedSnafu {
                reason: format!("invalid public key: {err}"),
            }
            .build()
        })?;

        ensure!(
            d.position() == data.len(),
            MalformedSnafu {
                reason: format!("{} trailing bytes", data.len() - d.position())
            }
        );

        public_key
            .verify(&data[start..end], &signature)
            .context(SignatureInvalidSnafu)?;

        Ok(Self {
            data,
            payload: start..end,
            signature,
            public_key,
        })
    }

    /// The full encoded envelope.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Consumes the envelope, returning the encoded bytes.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// The signed payload bytes, a slice of the envelope.
    pub fn payload(&self) -> Bytes {
        self.data.slice(self.payload.clone())
    }

    /// The signature over [`Self::payload`].
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The public key of the signer.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

fn encode_envelope(
    payload: &[u8],
    signature: &Signature,
    public_key: &PublicKey,
) -> Result<(Vec<u8>, Range<usize>), minicbor::encode::Error<Infallible>> {
    let mut enc = Encoder::new(Vec::with_capacity(payload.len() + 160));
    enc.map(NUM_FIELDS)?
        .str(FIELD_PAYLOAD_SIZE)?
        .u64(payload.len() as u64)?
        .str(FIELD_PAYLOAD)?;

    // embedded verbatim, the payload is already CBOR
    let start = enc.writer().len();
    enc.writer_mut().extend_from_slice(payload);
    let end = enc.writer().len();

    enc.str(FIELD_SIGNATURE)?
        .bytes(&signature.to_bytes())?
        .str(FIELD_PUBLIC_KEY)?
        .bytes(public_key.as_bytes())?;
    Ok((enc.into_writer(), start..end))
}

fn check_single_map(payload: &[u8]) -> Result<(), EnvelopeError> {
    let mut d = Decoder::new(payload);
    let ty = d.datatype().map_err(|err| {
        EncodingSnafu {
            reason: err.to_string(),
        }
        .build()
    })?;
    ensure!(
        matches!(ty, Type::Map | Type::MapIndef),
        EncodingSnafu {
            reason: format!("payload must be a CBOR map, found {ty:?}")
        }
    );
    d.skip().map_err(|err| {
        EncodingSnafu {
            reason: err.to_string(),
        }
        .build()
    })?;
    ensure!(
        d.position() == payload.len(),
        EncodingSnafu {
            reason: "payload holds more than one CBOR value"
        }
    );
    Ok(())
}

fn expect_key(d: &mut Decoder<'_>, key: &str) -> Result<(), EnvelopeError> {
    let found = d.str().map_err(malformed)?;
    ensure!(
        found == key,
        MalformedSnafu {
            reason: format!("expected field {key:?}, found {found:?}")
        }
    );
    Ok(())
}

fn malformed(err: minicbor::decode::Error) -> EnvelopeError {
    MalformedSnafu {
        reason: err.to_string(),
    }
    .build()
}
