//! The merged state of a single object.
//!
//! An [`ObjectState`] is built from the patch logs of every author of an object. Iterating it
//! yields all patches in the causal total order, checking on the way that every author's log
//! is dense and belongs to the object. Once fully iterated, the state can mint new patches
//! that depend on everything it has seen.

use std::collections::{BTreeMap, HashMap};

use nested_enum_utils::common_fields;
use patchlog_base::SecretKey;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tracing::trace;

use crate::{
    heap::PatchHeap,
    patch::{AccountId, ObjectId, Patch, PatchId, SignError, SignedPatch, unix_now},
    registry::PatchBody,
};

/// Errors when iterating an [`ObjectState`] or minting patches from it.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ChangesetError {
    /// The patches or the call sequence violate an invariant of the state.
    #[snafu(display("invariant violated: {reason}"))]
    InvariantViolation { reason: String },
    /// Signing the new patch failed.
    #[snafu(display("failed to sign patch"))]
    Sign { source: SignError },
    /// A typed body could not be encoded.
    #[snafu(display("failed to encode patch body: {reason}"))]
    Encoding { reason: String },
}

/// The state of one object, merged from the patch logs of all its authors.
///
/// A state goes through three phases: it starts with all patches unvisited, is partially
/// iterated while [`ObjectState::item`] is called, and is fully iterated once
/// [`ObjectState::has_next`] returns `false`. Only a fully iterated state can mint patches.
///
/// The frontier used as dependencies of new patches starts out as the last patch of every
/// log and is replaced by the minted patch after each [`ObjectState::new_patch`]. This
/// assumes one logical writer per instance: two instances built from the same logs that
/// both mint produce concurrent patches, which is fine, but a single instance never learns
/// about patches minted elsewhere until it is rebuilt.
#[derive(Debug)]
pub struct ObjectState {
    object_id: ObjectId,
    by_author: BTreeMap<AccountId, Vec<SignedPatch>>,
    heap: PatchHeap,
    seqs: HashMap<AccountId, u64>,
    deps: Vec<SignedPatch>,
    lamport_time: u64,
    log_time: u64,
    size: usize,
    pos: usize,
}

impl ObjectState {
    /// Creates the state of `object_id` from seq ordered author logs.
    ///
    /// Empty logs are skipped. Nothing is validated here, that happens while iterating.
    pub fn new(object_id: ObjectId, logs: Vec<Vec<SignedPatch>>) -> Self {
        let logs: Vec<_> = logs.into_iter().filter(|log| !log.is_empty()).collect();
        let mut by_author: BTreeMap<AccountId, Vec<SignedPatch>> = BTreeMap::new();
        let mut deps = Vec::with_capacity(logs.len());
        let mut size = 0;
        for log in &logs {
            size += log.len();
            if let Some(last) = log.last() {
                deps.push(last.clone());
                by_author
                    .entry(last.author)
                    .or_default()
                    .extend(log.iter().cloned());
            }
        }
        Self {
            object_id,
            by_author,
            heap: PatchHeap::new(logs),
            seqs: HashMap::new(),
            deps,
            lamport_time: 0,
            log_time: 0,
            size,
            pos: 0,
        }
    }

    /// The object this state belongs to.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Whether there are unvisited patches left.
    pub fn has_next(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Visits the next patch in causal order.
    ///
    /// Fails if there is no patch left, if the patch belongs to another object or if it is
    /// not the next patch of its author's log.
    pub fn item(&mut self) -> Result<SignedPatch, ChangesetError> {
        let Some(patch) = self.heap.pop() else {
            return InvariantViolationSnafu {
                reason: "no patches left to visit",
            }
            .fail();
        };
        ensure!(
            patch.object_id == self.object_id,
            InvariantViolationSnafu {
                reason: format!(
                    "patch {} belongs to object {}, expected {}",
                    patch.id().fmt_short(),
                    patch.object_id.fmt_short(),
                    self.object_id.fmt_short()
                )
            }
        );
        let expected = self.seq(&patch.author) + 1;
        ensure!(
            patch.seq == expected,
            InvariantViolationSnafu {
                reason: format!(
                    "patch {} of author {} has seq {}, expected {expected}",
                    patch.id().fmt_short(),
                    patch.author.fmt_short(),
                    patch.seq
                )
            }
        );

        self.seqs.insert(patch.author, patch.seq);
        self.lamport_time = self.lamport_time.max(patch.lamport_time);
        self.log_time += 1;
        self.pos += 1;
        trace!(
            id = %patch.id().fmt_short(),
            author = %patch.author.fmt_short(),
            seq = patch.seq,
            pos = self.pos,
            "visit patch"
        );
        Ok(patch)
    }

    /// Visits all remaining patches, returning them in causal order.
    pub fn merge(&mut self) -> Result<Vec<SignedPatch>, ChangesetError> {
        let mut out = Vec::with_capacity(self.size - self.pos);
        while self.has_next() {
            out.push(self.item()?);
        }
        Ok(out)
    }

    /// Creates and signs the next patch of `author`.
    ///
    /// The state must be fully iterated. The patch depends on the current frontier, with the
    /// author's own previous patch first.
    pub fn new_patch(
        &mut self,
        author: AccountId,
        secret_key: &SecretKey,
        kind: impl Into<String>,
        body: Vec<u8>,
    ) -> Result<SignedPatch, ChangesetError> {
        self.mint(author, secret_key, kind.into(), body, None)
    }

    /// Like [`Self::new_patch`], with a human readable message attached.
    pub fn new_patch_with_message(
        &mut self,
        author: AccountId,
        secret_key: &SecretKey,
        kind: impl Into<String>,
        body: Vec<u8>,
        message: impl Into<String>,
    ) -> Result<SignedPatch, ChangesetError> {
        self.mint(author, secret_key, kind.into(), body, Some(message.into()))
    }

    /// Creates a patch from a typed body, using [`PatchBody::KIND`] as kind.
    pub fn new_typed_patch<T: PatchBody>(
        &mut self,
        author: AccountId,
        secret_key: &SecretKey,
        body: &T,
    ) -> Result<SignedPatch, ChangesetError> {
        let body = minicbor::to_vec(body).map_err(|err| {
            EncodingSnafu {
                reason: err.to_string(),
            }
            .build()
        })?;
        self.mint(author, secret_key, T::KIND.to_string(), body, None)
    }

    fn mint(
        &mut self,
        author: AccountId,
        secret_key: &SecretKey,
        kind: String,
        body: Vec<u8>,
        message: Option<String>,
    ) -> Result<SignedPatch, ChangesetError> {
        ensure!(
            self.pos == self.size,
            InvariantViolationSnafu {
                reason: format!(
                    "cannot create patches before visiting all patches ({} of {})",
                    self.pos, self.size
                )
            }
        );
        let Some(lamport_time) = self.lamport_time.checked_add(1) else {
            return InvariantViolationSnafu {
                reason: "lamport time is exhausted",
            }
            .fail();
        };

        let patch = Patch {
            author,
            object_id: self.object_id,
            deps: self.next_deps(&author),
            seq: self.seq(&author) + 1,
            lamport_time,
            log_time: self.log_time + 1,
            kind,
            body,
            message,
            create_time: unix_now(),
        };
        let signed = SignedPatch::sign(patch, secret_key).context(SignSnafu)?;

        self.seqs.insert(author, signed.seq);
        self.lamport_time = signed.lamport_time;
        self.log_time = signed.log_time;
        self.size += 1;
        self.pos += 1;
        self.by_author
            .entry(author)
            .or_default()
            .push(signed.clone());
        self.deps = vec![signed.clone()];
        trace!(
            id = %signed.id().fmt_short(),
            author = %author.fmt_short(),
            seq = signed.seq,
            deps = signed.deps.len(),
            "new patch"
        );
        Ok(signed)
    }

    fn next_deps(&self, author: &AccountId) -> Vec<PatchId> {
        let prev = self
            .by_author
            .get(author)
            .and_then(|log| log.last())
            .map(|p| p.id());
        let mut rest: Vec<_> = self
            .deps
            .iter()
            .map(|p| p.id())
            .filter(|id| Some(*id) != prev)
            .collect();
        rest.sort();
        rest.dedup();
        prev.into_iter().chain(rest).collect()
    }

    /// Whether the state holds no patches at all.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Total number of patches, visited or not.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Number of patches visited so far, including minted ones.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Ids the next minted patch will depend on.
    pub fn frontier(&self) -> Vec<PatchId> {
        self.deps.iter().map(|p| p.id()).collect()
    }

    /// Latest seq of `author` seen so far, zero if none.
    pub fn seq(&self, author: &AccountId) -> u64 {
        self.seqs.get(author).copied().unwrap_or_default()
    }

    /// All authors with patches in this state, in byte order.
    pub fn authors(&self) -> impl Iterator<Item = &AccountId> + '_ {
        self.by_author.keys()
    }

    /// The log of `author`, in seq order.
    pub fn patches_by(&self, author: &AccountId) -> &[SignedPatch] {
        self.by_author.get(author).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Largest lamport time seen so far.
    pub fn lamport_time(&self) -> u64 {
        self.lamport_time
    }

    /// Number of patches observed so far.
    pub fn log_time(&self) -> u64 {
        self.log_time
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;

    use super::*;

    struct Device {
        key: SecretKey,
        author: AccountId,
    }

    fn device(seed: u64) -> Device {
        let key = SecretKey::generate(&mut rand_chacha::ChaCha8Rng::seed_from_u64(seed));
        let author = AccountId::from_public_key(&key.public());
        Device { key, author }
    }

    fn object() -> ObjectId {
        ObjectId::derive(b"changeset test object")
    }

    fn mint_log(dev: &Device, n: usize) -> Vec<SignedPatch> {
        let mut state = ObjectState::new(object(), vec![]);
        (0..n)
            .map(|i| {
                state
                    .new_patch(dev.author, &dev.key, "test/op", vec![i as u8])
                    .unwrap()
            })
            .collect()
    }

    fn assert_seq_density(merged: &[SignedPatch]) {
        let mut seqs: HashMap<AccountId, u64> = HashMap::new();
        for p in merged {
            let seq = seqs.entry(p.author).or_default();
            *seq += 1;
            assert_eq!(p.seq, *seq, "gap in log of {}", p.author.fmt_short());
        }
    }

    fn assert_causal(merged: &[SignedPatch]) {
        let positions: HashMap<PatchId, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id(), i))
            .collect();
        for (i, p) in merged.iter().enumerate() {
            for dep in &p.deps {
                let pos = positions.get(dep).expect("dependency is part of the merge");
                assert!(*pos < i, "dependency sorted after dependent");
                assert!(
                    merged[*pos].lamport_time < p.lamport_time,
                    "dependency does not have a smaller lamport time"
                );
            }
        }
        for w in merged.windows(2) {
            assert!(w[0].less(&w[1]));
        }
    }

    #[test]
    fn two_authors_merge() {
        let a = device(1);
        let b = device(2);
        let a_log = mint_log(&a, 3);
        let b_log = mint_log(&b, 4);

        let mut state = ObjectState::new(object(), vec![a_log.clone(), b_log.clone()]);
        assert_eq!(state.len(), 7);
        assert_eq!(state.frontier(), vec![a_log[2].id(), b_log[3].id()]);

        let merged = state.merge().unwrap();
        assert_eq!(merged.len(), 7);
        assert!(!state.has_next());
        assert_seq_density(&merged);
        assert_causal(&merged);
        let keys: Vec<_> = merged.iter().map(|p| (p.lamport_time, p.author)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let next = state.new_patch(a.author, &a.key, "test/op", vec![]).unwrap();
        assert_eq!(next.seq, 4);
        assert_eq!(next.lamport_time, 5);
        assert_eq!(next.log_time, 8);
        assert_eq!(next.deps, vec![a_log[2].id(), b_log[3].id()]);
        assert_eq!(state.frontier(), vec![next.id()]);
        assert_eq!(state.patches_by(&a.author).len(), 4);
        assert_eq!(state.seq(&b.author), 4);
    }

    #[test]
    fn own_previous_patch_comes_first() {
        let a = device(3);
        let b = device(4);
        let a_log = mint_log(&a, 1);
        let b_log = mint_log(&b, 1);

        // whichever order the logs come in, the minting author's tip leads
        for logs in [
            vec![a_log.clone(), b_log.clone()],
            vec![b_log.clone(), a_log.clone()],
        ] {
            let mut state = ObjectState::new(object(), logs);
            state.merge().unwrap();
            let p = state.new_patch(b.author, &b.key, "test/op", vec![]).unwrap();
            assert_eq!(p.deps, vec![b_log[0].id(), a_log[0].id()]);
            assert_eq!(p.prev(), Some(&b_log[0].id()));
        }
    }

    #[test]
    fn minting_for_another_author_keeps_their_chain() {
        let a = device(5);
        let b = device(6);
        let mut state = ObjectState::new(object(), vec![]);
        let a1 = state.new_patch(a.author, &a.key, "test/op", vec![]).unwrap();
        let b1 = state.new_patch(b.author, &b.key, "test/op", vec![]).unwrap();
        assert_eq!(b1.deps, vec![a1.id()]);
        let a2 = state.new_patch(a.author, &a.key, "test/op", vec![]).unwrap();
        assert_eq!(a2.seq, 2);
        assert_eq!(a2.deps, vec![a1.id(), b1.id()]);
    }

    #[test]
    fn first_patch_of_empty_state() {
        let a = device(7);
        let mut state = ObjectState::new(object(), vec![vec![], vec![]]);
        assert!(state.is_empty());
        assert!(!state.has_next());
        assert!(state.merge().unwrap().is_empty());

        let p = state
            .new_patch_with_message(a.author, &a.key, "test/op", vec![1], "hello")
            .unwrap();
        assert_eq!(p.seq, 1);
        assert_eq!(p.lamport_time, 1);
        assert_eq!(p.log_time, 1);
        assert!(p.deps.is_empty());
        assert_eq!(p.message.as_deref(), Some("hello"));
        assert_eq!(p.object_id, object());
        assert_eq!(state.len(), 1);
        assert_eq!(state.authors().collect::<Vec<_>>(), vec![&a.author]);
    }

    #[test]
    fn mint_requires_full_iteration() {
        let a = device(8);
        let log = mint_log(&a, 2);
        let mut state = ObjectState::new(object(), vec![log]);
        state.item().unwrap();
        let err = state
            .new_patch(a.author, &a.key, "test/op", vec![])
            .unwrap_err();
        assert!(matches!(err, ChangesetError::InvariantViolation { .. }), "{err:?}");

        state.item().unwrap();
        let err = state.item().unwrap_err();
        assert!(matches!(err, ChangesetError::InvariantViolation { .. }), "{err:?}");
        assert!(state.new_patch(a.author, &a.key, "test/op", vec![]).is_ok());
    }

    #[test]
    fn gaps_are_rejected() {
        let a = device(9);
        let mut log = mint_log(&a, 3);
        log.remove(1);
        let mut state = ObjectState::new(object(), vec![log]);
        state.item().unwrap();
        let err = state.item().unwrap_err();
        assert!(matches!(err, ChangesetError::InvariantViolation { .. }), "{err:?}");
    }

    #[test]
    fn foreign_object_is_rejected() {
        let a = device(10);
        let log = mint_log(&a, 1);
        let mut state = ObjectState::new(ObjectId::derive(b"another object"), vec![log]);
        let err = state.item().unwrap_err();
        assert!(matches!(err, ChangesetError::InvariantViolation { .. }), "{err:?}");
    }

    #[test]
    fn typed_patch() {
        #[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode)]
        #[cbor(map)]
        struct Title {
            #[n(0)]
            title: String,
        }
        impl PatchBody for Title {
            const KIND: &'static str = "test/title";
        }

        let a = device(11);
        let mut state = ObjectState::new(object(), vec![]);
        let p = state
            .new_typed_patch(
                a.author,
                &a.key,
                &Title {
                    title: "hi".into(),
                },
            )
            .unwrap();
        assert_eq!(p.kind, Title::KIND);
        let mut registry = crate::KindRegistry::new();
        registry.register::<Title>();
        assert_eq!(
            registry.decode_as::<Title>(&p).unwrap(),
            Title {
                title: "hi".into()
            }
        );
    }

    #[test]
    fn exhausted_lamport_time_is_rejected() {
        let a = device(12);
        let b = device(13);
        let last = SignedPatch::sign(
            Patch {
                author: a.author,
                object_id: object(),
                deps: vec![],
                seq: 1,
                lamport_time: u64::MAX,
                log_time: 1,
                kind: "test/op".to_string(),
                body: vec![],
                message: None,
                create_time: 0,
            },
            &a.key,
        )
        .unwrap();

        let mut state = ObjectState::new(object(), vec![vec![last]]);
        state.merge().unwrap();
        assert_eq!(state.lamport_time(), u64::MAX);
        let err = state
            .new_patch(b.author, &b.key, "test/op", vec![])
            .unwrap_err();
        assert!(matches!(err, ChangesetError::InvariantViolation { .. }), "{err:?}");
        // nothing was minted
        assert_eq!(state.len(), 1);
        assert_eq!(state.seq(&b.author), 0);
    }

    /// Replays a schedule of (device, sync) steps. A syncing device rebuilds its state from all
    /// logs before minting, otherwise it keeps minting on top of its own view.
    fn simulate(schedule: &[(usize, bool)]) -> Vec<Vec<SignedPatch>> {
        let devices: Vec<_> = (0..3).map(|i| device(100 + i)).collect();
        let mut logs: Vec<Vec<SignedPatch>> = vec![vec![]; devices.len()];
        let mut states: Vec<_> = devices
            .iter()
            .map(|_| ObjectState::new(object(), vec![]))
            .collect();
        for (i, &(dev, sync)) in schedule.iter().enumerate() {
            if sync {
                let mut state = ObjectState::new(object(), logs.clone());
                state.merge().unwrap();
                states[dev] = state;
            }
            let d = &devices[dev];
            let p = states[dev]
                .new_patch(d.author, &d.key, "test/op", vec![i as u8])
                .unwrap();
            logs[dev].push(p);
        }
        logs
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn merge_is_deterministic(
            schedule in prop::collection::vec((0..3usize, any::<bool>()), 1..24),
            order in Just(vec![0usize, 1, 2]).prop_shuffle(),
        ) {
            let logs = simulate(&schedule);
            let reference = ObjectState::new(object(), logs.clone()).merge().unwrap();
            let shuffled: Vec<_> = order.iter().map(|i| logs[*i].clone()).collect();
            let merged = ObjectState::new(object(), shuffled).merge().unwrap();

            let ids: Vec<_> = merged.iter().map(|p| p.id()).collect();
            let reference_ids: Vec<_> = reference.iter().map(|p| p.id()).collect();
            prop_assert_eq!(ids, reference_ids);
            prop_assert_eq!(merged.len(), schedule.len());
            assert_seq_density(&merged);
            assert_causal(&merged);
        }
    }
}
