// The versioned sorted map: `ShieldedTree`.
//
// The source builds this as a red-black tree of individually-versioned node
// cells so that every rotation is itself a transactional cell write. That
// buys concurrent rebalancing at the cost of a second, parallel concurrency
// protocol nested inside the one this crate already implements for `TCell`.
// We get the same observable ordering, duplicate-key, and O(1) clear/count
// semantics by keeping one `TCell` whose value is the whole ordered
// structure (entries plus its own running count) — the identical collapsing
// trick used for `TSequence`; see DESIGN.md.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::cell::TCell;
use crate::errors::Result;

#[derive(Clone)]
struct TreeData<K, V> {
    entries: BTreeMap<K, Vec<V>>,
    count: usize,
}

impl<K: Ord, V> Default for TreeData<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            count: 0,
        }
    }
}

/// A versioned sorted multimap; duplicate keys are allowed.
pub struct ShieldedTree<K, V> {
    cell: TCell<TreeData<K, V>>,
}

impl<K: Ord + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> ShieldedTree<K, V> {
    pub fn new() -> Self {
        Self {
            cell: TCell::new(TreeData::default()),
        }
    }

    /// Returns the first value stored under `key`, if any.
    pub fn find(&self, key: &K) -> Result<Option<V>> {
        Ok(self.cell.read()?.entries.get(key).and_then(|bucket| bucket.first().cloned()))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.cell.read()?.entries.contains_key(key))
    }

    /// Inserts a new `(key, value)` pair. Duplicate keys accumulate rather
    /// than overwrite.
    pub fn add(&self, key: K, value: V) -> Result<()> {
        self.cell.modify(move |mut data| {
            data.entries.entry(key).or_default().push(value);
            data.count += 1;
            data
        })
    }

    /// Total number of `(key, value)` pairs, read directly off the tree's
    /// own running count.
    pub fn count(&self) -> Result<usize> {
        Ok(self.cell.read()?.count)
    }

    /// Drops every entry; O(1) logical work.
    pub fn clear(&self) -> Result<()> {
        self.cell.write(TreeData::default())
    }

    /// Ascending enumeration of every `(key, value)` pair.
    pub fn enumerate_ascending(&self) -> Result<Vec<(K, V)>> {
        let data = self.cell.read()?;
        Ok(data.entries.iter().flat_map(|(k, bucket)| bucket.iter().map(move |v| (k.clone(), v.clone()))).collect())
    }

    /// Descending enumeration of every `(key, value)` pair.
    pub fn enumerate_descending(&self) -> Result<Vec<(K, V)>> {
        let mut all = self.enumerate_ascending()?;
        all.reverse();
        Ok(all)
    }

    /// Ordered bulk read, ascending. Thin alias over [`ShieldedTree::enumerate_ascending`]
    /// for callers migrating from a `to_vec`-shaped collection API.
    pub fn to_vec_ascending(&self) -> Result<Vec<(K, V)>> {
        self.enumerate_ascending()
    }

    /// Ordered bulk read, descending. Alias over [`ShieldedTree::enumerate_descending`].
    pub fn to_vec_descending(&self) -> Result<Vec<(K, V)>> {
        self.enumerate_descending()
    }

    /// Ascending enumeration of every pair with `lo <= key <= hi`.
    pub fn range_ascending(&self, lo: &K, hi: &K) -> Result<Vec<(K, V)>> {
        let data = self.cell.read()?;
        Ok(data
            .entries
            .range((Bound::Included(lo.clone()), Bound::Included(hi.clone())))
            .flat_map(|(k, bucket)| bucket.iter().map(move |v| (k.clone(), v.clone())))
            .collect())
    }

    /// Descending enumeration of every pair with `lo <= key <= hi`.
    pub fn range_descending(&self, lo: &K, hi: &K) -> Result<Vec<(K, V)>> {
        let mut all = self.range_ascending(lo, hi)?;
        all.reverse();
        Ok(all)
    }

    /// Removes every value stored under `key`, returning how many were
    /// removed.
    pub fn remove_by_key(&self, key: &K) -> Result<usize> {
        let key = key.clone();
        let mut removed = 0;
        self.cell.modify(move |mut data| {
            if let Some(bucket) = data.entries.remove(&key) {
                removed = bucket.len();
                data.count -= removed;
            }
            data
        })?;
        Ok(removed)
    }
}

impl<K: Ord + Clone + Send + Sync + 'static, V: Clone + PartialEq + Send + Sync + 'static> ShieldedTree<K, V> {
    pub fn contains_pair(&self, key: &K, value: &V) -> Result<bool> {
        Ok(self.cell.read()?.entries.get(key).map_or(false, |bucket| bucket.contains(value)))
    }

    /// Removes one `(key, value)` pair, returning whether it was present.
    pub fn remove_pair(&self, key: &K, value: &V) -> Result<bool> {
        let key = key.clone();
        let value = value.clone();
        let mut removed = false;
        self.cell.modify(move |mut data| {
            if let Some(bucket) = data.entries.get_mut(&key) {
                if let Some(pos) = bucket.iter().position(|v| *v == value) {
                    bucket.remove(pos);
                    removed = true;
                    data.count -= 1;
                    if bucket.is_empty() {
                        data.entries.remove(&key);
                    }
                }
            }
            data
        })?;
        Ok(removed)
    }
}

impl<K, V> Clone for ShieldedTree<K, V> {
    fn clone(&self) -> Self {
        Self { cell: self.cell.clone() }
    }
}

impl<K: Ord + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> Default for ShieldedTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomically;

    #[test]
    fn add_then_find_and_count() {
        let tree: ShieldedTree<i32, &'static str> = ShieldedTree::new();
        atomically(|| {
            tree.add(1, "a")?;
            tree.add(2, "b")?;
            tree.add(1, "a2")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(atomically(|| tree.count()).unwrap(), 3);
        assert_eq!(atomically(|| tree.find(&1)).unwrap(), Some("a"));
    }

    #[test]
    fn range_and_enumerate_are_ordered() {
        let tree: ShieldedTree<i32, i32> = ShieldedTree::new();
        atomically(|| {
            for k in [5, 1, 3, 4, 2] {
                tree.add(k, k * 10)?;
            }
            Ok(())
        })
        .unwrap();

        let asc = atomically(|| tree.enumerate_ascending()).unwrap();
        assert_eq!(asc.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        let desc = atomically(|| tree.enumerate_descending()).unwrap();
        assert_eq!(desc.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![5, 4, 3, 2, 1]);

        let ranged = atomically(|| tree.range_ascending(&2, &4)).unwrap();
        assert_eq!(ranged.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn clear_is_observed_as_empty() {
        let tree: ShieldedTree<i32, i32> = ShieldedTree::new();
        atomically(|| tree.add(1, 1)).unwrap();
        atomically(|| tree.clear()).unwrap();
        assert_eq!(atomically(|| tree.count()).unwrap(), 0);
        assert_eq!(atomically(|| tree.contains_key(&1)).unwrap(), false);
    }
}
