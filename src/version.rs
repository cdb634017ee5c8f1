// Per-location version history.

use std::sync::Arc;

use crate::stamp::{Stamp, STAMP_ZERO};

/// One immutable entry in a version chain: `{stamp, value, older}`.
///
/// Chains are sorted strictly descending by stamp from `head` to the oldest
/// reachable entry.
pub(crate) struct VersionEntry<T> {
    pub stamp: Stamp,
    pub value: Arc<T>,
    pub older: Option<Arc<VersionEntry<T>>>,
}

impl<T> VersionEntry<T> {
    fn root(value: T) -> Arc<Self> {
        Arc::new(Self {
            stamp: STAMP_ZERO,
            value: Arc::new(value),
            older: None,
        })
    }
}

/// The version history of a single transactional location.
///
/// Holds only the `head` pointer; older entries are reachable only through
/// the chain itself, so once `trim_copies` cuts a link the dropped tail is
/// reclaimed by `Arc`'s refcount the moment the last reader releases it.
pub(crate) struct VersionChain<T> {
    head: Arc<VersionEntry<T>>,
}

impl<T> VersionChain<T> {
    pub(crate) fn new(initial: T) -> Self {
        Self {
            head: VersionEntry::root(initial),
        }
    }

    pub(crate) fn head_stamp(&self) -> Stamp {
        self.head.stamp
    }

    pub(crate) fn head_value(&self) -> Arc<T> {
        self.head.value.clone()
    }

    /// Prepends a new head with the given stamp, chaining the previous head
    /// as `older`. Callers must already hold whatever lock protects this
    /// chain and must have validated `stamp > self.head_stamp()`.
    pub(crate) fn publish(&mut self, stamp: Stamp, value: T) {
        debug_assert!(stamp > self.head.stamp, "write stamps must strictly increase per cell");
        let older = self.head.clone();
        self.head = Arc::new(VersionEntry {
            stamp,
            value: Arc::new(value),
            older: Some(older),
        });
    }

    /// Walks from `head` toward the tail and returns the newest entry whose
    /// stamp is `<= read_stamp`.
    pub(crate) fn visible_at(&self, read_stamp: Stamp) -> Option<Arc<T>> {
        let mut cur = self.head.clone();
        loop {
            if cur.stamp <= read_stamp {
                return Some(cur.value.clone());
            }
            match &cur.older {
                Some(next) => {
                    let next = next.clone();
                    cur = next;
                }
                None => return None,
            }
        }
    }

    /// `trim_copies(bound)`: find the newest entry with stamp `<= bound` and
    /// cut its `older` link, collapsing everything below the oldest live
    /// reader into at most one reachable entry.
    pub(crate) fn trim_copies(&mut self, bound: Stamp) {
        // Walk a private clone of the chain; `head` itself never needs to
        // move, only the tail below the cut point is released.
        let mut cur = self.head.clone();
        loop {
            if cur.stamp <= bound {
                if cur.older.is_some() {
                    // Safe: no reader may hold a stamp below `bound` by the
                    // time trim() calls this (see Runtime::trim).
                    let cut = Arc::new(VersionEntry {
                        stamp: cur.stamp,
                        value: cur.value.clone(),
                        older: None,
                    });
                    self.replace_suffix(cut);
                }
                return;
            }
            match cur.older.clone() {
                Some(next) => cur = next,
                None => return,
            }
        }
    }

    /// Rebuilds the chain from `head` down to (and rewiring) the entry equal
    /// to `replacement.stamp`, substituting `replacement` (whose `older` is
    /// already `None`) in its place.
    fn replace_suffix(&mut self, replacement: Arc<VersionEntry<T>>) {
        if self.head.stamp == replacement.stamp {
            self.head = replacement;
            return;
        }
        self.head = Self::rebuild(&self.head, &replacement);
    }

    fn rebuild(node: &Arc<VersionEntry<T>>, replacement: &Arc<VersionEntry<T>>) -> Arc<VersionEntry<T>> {
        if node.stamp == replacement.stamp {
            return replacement.clone();
        }
        match &node.older {
            Some(older) => Arc::new(VersionEntry {
                stamp: node.stamp,
                value: node.value.clone(),
                older: Some(Self::rebuild(older, replacement)),
            }),
            None => node.clone(),
        }
    }

    /// True if `head` has no `older` link, i.e. the chain holds exactly one
    /// entry. Used by the dictionary's GC sweep to decide whether a
    /// tombstoned key can be dropped outright.
    pub(crate) fn only_entry(&self) -> bool {
        self.head.older.is_none()
    }

    /// Number of entries currently reachable from `head`. Exposed for tests
    /// asserting the GC bound.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = Some(self.head.clone());
        while let Some(entry) = cur {
            n += 1;
            cur = entry.older.clone();
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_descending_and_visible_at_bounds_reads() {
        let mut chain = VersionChain::new(5);
        chain.publish(10, 20);
        chain.publish(20, 30);

        assert_eq!(*chain.visible_at(0).unwrap(), 5);
        assert_eq!(*chain.visible_at(9).unwrap(), 5);
        assert_eq!(*chain.visible_at(10).unwrap(), 20);
        assert_eq!(*chain.visible_at(15).unwrap(), 20);
        assert_eq!(*chain.visible_at(20).unwrap(), 30);
        assert_eq!(*chain.visible_at(100).unwrap(), 30);
    }

    #[test]
    fn trim_collapses_to_bound() {
        let mut chain = VersionChain::new(1);
        chain.publish(5, 2);
        chain.publish(10, 3);
        chain.publish(15, 4);
        assert_eq!(chain.len(), 4);

        chain.trim_copies(10);
        // entries at stamp 0 and 5 collapse away; 10 and 15 remain reachable
        assert_eq!(chain.len(), 2);
        assert_eq!(*chain.visible_at(100).unwrap(), 4);
        assert_eq!(*chain.visible_at(10).unwrap(), 3);
    }
}
