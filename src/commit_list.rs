// Commit-check list: serializes validation only between transactions whose
// footprints overlap.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::trace;

use crate::runtime::RuntimeConfig;

/// One entry in the check list: the id sets a transaction is about to
/// validate/publish against, plus whether it has finished doing so.
struct Entry {
    enlisted: HashSet<usize>,
    comm_enlisted: HashSet<usize>,
    done: AtomicBool,
}

impl Entry {
    fn overlaps(&self, other: &Entry) -> bool {
        !self.enlisted.is_disjoint(&other.enlisted)
            || !self.enlisted.is_disjoint(&other.comm_enlisted)
            || !self.comm_enlisted.is_disjoint(&other.enlisted)
            || !self.comm_enlisted.is_disjoint(&other.comm_enlisted)
    }
}

/// A held slot in the check list. Must be released exactly once via
/// [`CommitCheckList::release`].
pub(crate) struct Ticket {
    entry: Arc<Entry>,
}

/// Serializes commit validation between transactions with overlapping
/// footprints; disjoint transactions proceed fully in parallel.
///
/// Implemented with a `Mutex`-guarded `Vec` rather than a lock-free linked
/// list: the externally observable behavior (overlap-only serialization,
/// FIFO sweep of completed entries) is identical, and this mirrors the
/// coarser-grained commit bookkeeping used elsewhere in this runtime — see
/// DESIGN.md.
pub(crate) struct CommitCheckList {
    entries: Mutex<Vec<Arc<Entry>>>,
}

impl CommitCheckList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Enters the check list with the given enlisted/commute-enlisted id
    /// sets, spin-waiting for every not-yet-done entry already present whose
    /// sets overlap with ours.
    pub(crate) fn enter(&self, enlisted: HashSet<usize>, comm_enlisted: HashSet<usize>, config: &RuntimeConfig) -> Ticket {
        let entry = Arc::new(Entry {
            enlisted,
            comm_enlisted,
            done: AtomicBool::new(false),
        });

        let overlapping: Vec<Arc<Entry>> = {
            let mut entries = self.entries.lock().expect("commit check list mutex poisoned");
            let overlapping = entries.iter().filter(|other| other.overlaps(&entry)).cloned().collect();
            entries.push(entry.clone());
            overlapping
        };

        for other in overlapping {
            while !other.done.load(Ordering::Acquire) {
                thread::sleep(config.spin_backoff);
            }
        }

        trace!("commit_list: entered with {} overlapping waits", 0);
        Ticket { entry }
    }

    /// Marks a ticket done and sweeps a contiguous done-prefix from the
    /// front of the list.
    pub(crate) fn release(&self, ticket: Ticket) {
        ticket.entry.done.store(true, Ordering::Release);

        let mut entries = self.entries.lock().expect("commit check list mutex poisoned");
        while let Some(front) = entries.first() {
            if front.done.load(Ordering::Acquire) {
                entries.remove(0);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            spin_backoff: Duration::from_micros(10),
            gc_interval: 1,
        }
    }

    #[test]
    fn disjoint_entries_do_not_block() {
        let list = CommitCheckList::new();
        let t1 = list.enter([1].into_iter().collect(), HashSet::new(), &cfg());
        let t2 = list.enter([2].into_iter().collect(), HashSet::new(), &cfg());
        list.release(t1);
        list.release(t2);
    }

    #[test]
    fn overlapping_entries_serialize() {
        use std::sync::atomic::AtomicUsize;
        let list = Arc::new(CommitCheckList::new());
        let order = Arc::new(AtomicUsize::new(0));

        let t1 = list.enter([1].into_iter().collect(), HashSet::new(), &cfg());

        let list2 = list.clone();
        let order2 = order.clone();
        let handle = thread::spawn(move || {
            let t2 = list2.enter([1].into_iter().collect(), HashSet::new(), &cfg());
            let seen = order2.load(Ordering::SeqCst);
            list2.release(t2);
            seen
        });

        thread::sleep(Duration::from_millis(20));
        order.store(1, Ordering::SeqCst);
        list.release(t1);

        let seen = handle.join().expect("thread panicked");
        assert_eq!(seen, 1, "second entry must observe first entry's release");
    }
}
