//! Typed patch bodies.
//!
//! The engine treats [`Patch::body`](crate::Patch::body) as opaque bytes tagged by
//! [`Patch::kind`](crate::Patch::kind). Higher layers describe their bodies with
//! [`PatchBody`] and register them in a [`KindRegistry`] to get typed values back out of
//! stored patches.

use std::{any::Any, collections::HashMap, fmt};

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};

use crate::patch::SignedPatch;

/// A typed patch body with a stable kind name.
pub trait PatchBody:
    minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> + Send + Sync + 'static
{
    /// The kind string stored in [`Patch::kind`](crate::Patch::kind).
    const KIND: &'static str;
}

/// Errors when decoding a typed body.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum RegistryError {
    /// No body type is registered for the kind.
    #[snafu(display("unknown patch kind {kind:?}"))]
    UnknownPatchKind { kind: String },
    /// The body bytes do not decode into the registered type.
    #[snafu(display("failed to decode body of kind {kind:?}"))]
    BodyDecoding {
        kind: String,
        source: minicbor::decode::Error,
    },
    /// The patch carries a different kind than the requested type.
    #[snafu(display("expected patch kind {expected:?}, found {found:?}"))]
    KindMismatch {
        expected: &'static str,
        found: String,
    },
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, minicbor::decode::Error>;

/// Maps kind strings to body decoders.
///
/// This is a plain value, create one per application and register every body type it
/// understands.
#[derive(Default)]
pub struct KindRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("KindRegistry").field("kinds", &kinds).finish()
    }
}

fn decode_boxed<T: PatchBody>(
    body: &[u8],
) -> Result<Box<dyn Any + Send + Sync>, minicbor::decode::Error> {
    let value: T = minicbor::decode(body)?;
    Ok(Box::new(value))
}

impl KindRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under [`PatchBody::KIND`], replacing an earlier registration.
    pub fn register<T: PatchBody>(&mut self) -> &mut Self {
        self.decoders.insert(T::KIND, decode_boxed::<T>);
        self
    }

    /// Whether a body type is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Decodes the body of `patch` with the type registered for its kind.
    pub fn decode(&self, patch: &SignedPatch) -> Result<TypedBody, RegistryError> {
        let kind = patch.kind.as_str();
        let Some(decode) = self.decoders.get(kind) else {
            return UnknownPatchKindSnafu { kind }.fail();
        };
        let value = decode(&patch.body).context(BodyDecodingSnafu { kind })?;
        Ok(TypedBody {
            kind: kind.to_string(),
            value,
        })
    }

    /// Decodes the body of `patch` as `T`, which must be registered.
    pub fn decode_as<T: PatchBody>(&self, patch: &SignedPatch) -> Result<T, RegistryError> {
        ensure!(
            patch.kind == T::KIND,
            KindMismatchSnafu {
                expected: T::KIND,
                found: patch.kind.as_str(),
            }
        );
        ensure!(self.contains(T::KIND), UnknownPatchKindSnafu { kind: T::KIND });
        minicbor::decode(&patch.body).context(BodyDecodingSnafu { kind: T::KIND })
    }
}

/// A decoded patch body of a registered type.
#[derive(derive_more::Debug)]
pub struct TypedBody {
    kind: String,
    #[debug(skip)]
    value: Box<dyn Any + Send + Sync>,
}

impl TypedBody {
    /// The kind the body was decoded as.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Borrows the body as `T`, `None` if it is of another type.
    pub fn downcast_ref<T: PatchBody>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Converts into `T`, handing the body back if it is of another type.
    pub fn downcast<T: PatchBody>(self) -> Result<T, Self> {
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self {
                kind: self.kind,
                value,
            }),
        }
    }
}
