//! K-way merge of per author patch logs.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use crate::patch::SignedPatch;

/// Merges seq ordered patch logs into a single sequence in causal order.
///
/// Keeps one cursor per log in a binary min-heap, so [`PatchHeap::pop`] is `O(log k)` for
/// `k` logs.
#[derive(Debug)]
pub struct PatchHeap {
    logs: Vec<Vec<SignedPatch>>,
    cursors: BinaryHeap<Reverse<Cursor>>,
}

#[derive(Debug)]
struct Cursor {
    head: SignedPatch,
    log: usize,
    pos: usize,
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cursor {}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.head
            .causal_cmp(&other.head)
            .then_with(|| self.log.cmp(&other.log))
    }
}

impl PatchHeap {
    /// Creates a heap over the given logs. Empty logs are ignored.
    pub fn new(logs: Vec<Vec<SignedPatch>>) -> Self {
        let cursors = logs
            .iter()
            .enumerate()
            .filter_map(|(log, patches)| {
                patches.first().map(|head| {
                    Reverse(Cursor {
                        head: head.clone(),
                        log,
                        pos: 0,
                    })
                })
            })
            .collect();
        Self { logs, cursors }
    }

    /// Number of logs that still have patches left.
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    /// Whether all logs are exhausted.
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Removes and returns the smallest remaining patch.
    pub fn pop(&mut self) -> Option<SignedPatch> {
        let Reverse(cursor) = self.cursors.pop()?;
        let next = cursor.pos + 1;
        if let Some(head) = self.logs[cursor.log].get(next) {
            self.cursors.push(Reverse(Cursor {
                head: head.clone(),
                log: cursor.log,
                pos: next,
            }));
        }
        Some(cursor.head)
    }
}

impl Iterator for PatchHeap {
    type Item = SignedPatch;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop()
    }
}
