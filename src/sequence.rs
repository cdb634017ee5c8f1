// The versioned ordered sequence.
//
// The source sketches a hand-rolled linked list of head/tail/count cells
// plus per-node `{value, next}` cells, so that `append` can commute against
// just the tail pointer without touching the rest of the list. We get the
// identical externally observable behavior — commutative append, with
// degeneration into an ordinary write the moment the transaction reads or
// writes the sequence directly — by reusing `TCell`'s own commute machinery
// over a single cell holding the whole list (see DESIGN.md).

use std::collections::VecDeque;

use crate::cell::TCell;
use crate::errors::Result;

/// A transactional ordered sequence.
pub struct TSequence<T> {
    cell: TCell<VecDeque<T>>,
}

impl<T: Clone + Send + Sync + 'static> TSequence<T> {
    pub fn new() -> Self {
        Self {
            cell: TCell::new(VecDeque::new()),
        }
    }

    /// Enqueues `value` as a commute against the current list. Multiple appends in one transaction preserve program
    /// order; reading or writing the sequence directly first degenerates
    /// this into an immediate push.
    pub fn append(&self, value: T) -> Result<()> {
        self.cell.commute(move |mut list| {
            list.push_back(value);
            list
        })
    }

    pub fn prepend(&self, value: T) -> Result<()> {
        self.cell.modify(move |mut list| {
            list.push_front(value);
            list
        })
    }

    /// Returns the first element without removing it, or `None` if empty.
    pub fn peek_head(&self) -> Result<Option<T>> {
        Ok(self.cell.read()?.front().cloned())
    }

    /// Removes and returns the first element,
    /// non-commutative: always reads the list directly.
    pub fn take_head(&self) -> Result<Option<T>> {
        let mut removed = None;
        self.cell.modify(|mut list| {
            removed = list.pop_front();
            list
        })?;
        Ok(removed)
    }

    pub fn get(&self, index: usize) -> Result<Option<T>> {
        Ok(self.cell.read()?.get(index).cloned())
    }

    pub fn insert_at(&self, index: usize, value: T) -> Result<()> {
        self.cell.modify(move |mut list| {
            let index = index.min(list.len());
            list.insert(index, value);
            list
        })
    }

    pub fn remove_at(&self, index: usize) -> Result<Option<T>> {
        let mut removed = None;
        self.cell.modify(|mut list| {
            if index < list.len() {
                removed = list.remove(index);
            }
            list
        })?;
        Ok(removed)
    }

    /// Removes every element for which `predicate` returns `true`, returning
    /// the count removed.
    pub fn remove_all_matching(&self, predicate: impl Fn(&T) -> bool) -> Result<usize> {
        let mut removed = 0;
        self.cell.modify(move |list| {
            let mut kept = VecDeque::with_capacity(list.len());
            for item in list {
                if predicate(&item) {
                    removed += 1;
                } else {
                    kept.push_back(item);
                }
            }
            kept
        })?;
        Ok(removed)
    }

    /// Number of elements currently visible to the active transaction.
    pub fn count(&self) -> Result<usize> {
        Ok(self.cell.read()?.len())
    }

    /// Snapshot of every element, in order. Enumeration must run inside a
    /// transaction; this reads the sequence like any other op.
    pub fn copy_to(&self) -> Result<Vec<T>> {
        Ok(self.cell.read()?.into_iter().collect())
    }

    /// Empties the sequence in one write.
    pub fn clear(&self) -> Result<()> {
        self.cell.write(VecDeque::new())
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> TSequence<T> {
    /// Removes the first element equal to `value`, returning whether one was
    /// found.
    pub fn remove_value(&self, value: &T) -> Result<bool> {
        let mut removed = false;
        let target = value.clone();
        self.cell.modify(move |mut list| {
            if let Some(pos) = list.iter().position(|v| *v == target) {
                list.remove(pos);
                removed = true;
            }
            list
        })?;
        Ok(removed)
    }
}

impl<T> Clone for TSequence<T> {
    fn clone(&self) -> Self {
        Self { cell: self.cell.clone() }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for TSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}
