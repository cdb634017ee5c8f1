// Process-wide transactional runtime: stamp issuance, reader-stamp tracking
// and epoch-based GC, plus knobs an application can tune.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use log::trace;

use crate::commit_list::CommitCheckList;
use crate::stamp::{Stamp, StampSource, STAMP_ZERO};

/// Anything holding per-cell version history that must shed entries once the
/// oldest live read stamp advances past them.
pub(crate) trait Trimmable: Send + Sync {
    fn trim_copies(&self, bound: Stamp);
}

/// Tunable knobs for the runtime. None of these change transactional
/// semantics; they only affect how aggressively the runtime spins versus
/// sleeps, and how eagerly it reclaims old versions.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// How long a spin-wait sleeps between polls of a write-stamp lock or a
    /// commit-check-list conflict before checking again.
    pub spin_backoff: Duration,
    /// How many committed write stamps accumulate before `trim()` is run
    /// automatically at the end of a commit. `1` trims after every commit.
    pub gc_interval: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spin_backoff: Duration::from_micros(50),
            gc_interval: 1,
        }
    }
}

/// A read ticket obtained from [`Runtime::begin_read`]. Holds the assigned
/// read stamp alive in the runtime's reader-count table until
/// [`Runtime::release_read`] is called.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadTicket {
    pub stamp: Stamp,
}

/// A write ticket obtained from [`Runtime::allocate_write`]. Remains
/// "in-flight" until the owning transaction deposits its change set with
/// [`Runtime::record_changes`]; `trim()` never advances past an in-flight
/// ticket's stamp.
pub(crate) struct WriteTicket {
    pub stamp: Stamp,
}

#[derive(Default)]
struct GcState {
    /// Count of active readers per outstanding read stamp.
    readers: BTreeMap<Stamp, u64>,
    /// Pending change sets keyed by write stamp, in ascending order. An
    /// entry with `changes: None` is in-flight (ticket allocated, not yet
    /// deposited) and blocks `trim()` from passing its stamp.
    pending: VecDeque<(Stamp, Option<Vec<Arc<dyn Trimmable>>>)>,
    oldest_read: Stamp,
    commits_since_gc: u64,
}

pub(crate) struct Runtime {
    stamps: StampSource,
    txn_ids: AtomicU64,
    gc: Mutex<GcState>,
    pub(crate) commit_list: CommitCheckList,
    pub config: Mutex<RuntimeConfig>,
    committed: AtomicU64,
    retried: AtomicU64,
}

impl Runtime {
    fn new() -> Self {
        Self {
            stamps: StampSource::new(),
            txn_ids: AtomicU64::new(0),
            gc: Mutex::new(GcState::default()),
            commit_list: CommitCheckList::new(),
            config: Mutex::new(RuntimeConfig::default()),
            committed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        }
    }

    /// Records one committed transaction.
    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one retried attempt.
    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.txn_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn config(&self) -> RuntimeConfig {
        self.config.lock().expect("runtime config mutex poisoned").clone()
    }

    /// Assigns a read stamp and registers it as a live reader.
    pub(crate) fn begin_read(&self) -> ReadTicket {
        let stamp = self.stamps.current();
        let mut gc = self.gc.lock().expect("gc mutex poisoned");
        *gc.readers.entry(stamp).or_insert(0) += 1;
        trace!("begin_read: stamp {}", stamp);
        ReadTicket { stamp }
    }

    /// Releases a previously issued read ticket. Readers never stall `trim`;
    /// the count simply drops to zero and `trim()` is free to advance past
    /// it on its next call.
    pub(crate) fn release_read(&self, ticket: ReadTicket) {
        let mut gc = self.gc.lock().expect("gc mutex poisoned");
        if let Some(count) = gc.readers.get_mut(&ticket.stamp) {
            *count -= 1;
            if *count == 0 {
                gc.readers.remove(&ticket.stamp);
            }
        }
        trace!("release_read: stamp {}", ticket.stamp);
    }

    /// Allocates a write stamp for a committing transaction. The ticket is
    /// in-flight until `record_changes` deposits its change set.
    pub(crate) fn allocate_write(&self) -> WriteTicket {
        let stamp = self.stamps.advance();
        let mut gc = self.gc.lock().expect("gc mutex poisoned");
        gc.pending.push_back((stamp, None));
        trace!("allocate_write: stamp {}", stamp);
        WriteTicket { stamp }
    }

    /// Deposits the set of transactional objects a committed write stamp
    /// touched, unblocking `trim()` from passing this stamp.
    pub(crate) fn record_changes(&self, ticket: &WriteTicket, changed: Vec<Arc<dyn Trimmable>>) {
        let mut gc = self.gc.lock().expect("gc mutex poisoned");
        if let Some(entry) = gc.pending.iter_mut().find(|(s, _)| *s == ticket.stamp) {
            entry.1 = Some(changed);
        }
        gc.commits_since_gc += 1;
        let due = gc.commits_since_gc >= self.config().gc_interval;
        drop(gc);
        if due {
            self.trim();
        }
    }

    /// Abandons a write ticket without publishing (rollback path): marks it
    /// with an empty change set so `trim()` is not blocked forever.
    pub(crate) fn abandon_write(&self, ticket: &WriteTicket) {
        let mut gc = self.gc.lock().expect("gc mutex poisoned");
        if let Some(entry) = gc.pending.iter_mut().find(|(s, _)| *s == ticket.stamp) {
            entry.1 = Some(Vec::new());
        }
    }

    /// Computes the oldest stamp any live reader still depends on, advances
    /// it past any fully-deposited write tickets below that bound, and asks
    /// every touched [`Trimmable`] to collapse its chain.
    pub(crate) fn trim(&self) {
        let mut gc = self.gc.lock().expect("gc mutex poisoned");
        let oldest_reader = gc.readers.keys().next().copied().unwrap_or_else(|| self.stamps.current());
        gc.oldest_read = oldest_reader;
        gc.commits_since_gc = 0;

        let mut to_trim: Vec<Arc<dyn Trimmable>> = Vec::new();
        while let Some((stamp, changes)) = gc.pending.front() {
            if *stamp >= oldest_reader {
                break;
            }
            match changes {
                Some(_) => {
                    let (_, changes) = gc.pending.pop_front().expect("front checked above");
                    to_trim.extend(changes.unwrap_or_default());
                }
                None => break, // in-flight ticket: do not advance past it
            }
        }
        drop(gc);

        for item in to_trim {
            item.trim_copies(oldest_reader);
        }
        trace!("trim: oldest_read advanced to {}", oldest_reader);
    }

    #[cfg(test)]
    pub(crate) fn oldest_read(&self) -> Stamp {
        self.gc.lock().expect("gc mutex poisoned").oldest_read
    }
}

lazy_static! {
    pub(crate) static ref RUNTIME: Runtime = Runtime::new();
}

/// Read-only snapshot of runtime activity, for diagnostics and tests.
pub struct RuntimeStats {
    pub current_stamp: Stamp,
    pub oldest_read_stamp: Stamp,
    pub committed: u64,
    pub retried: u64,
}

/// Returns a snapshot of the global runtime's counters.
pub fn stats() -> RuntimeStats {
    RuntimeStats {
        current_stamp: RUNTIME.stamps.current(),
        oldest_read_stamp: RUNTIME.gc.lock().expect("gc mutex poisoned").oldest_read.max(STAMP_ZERO),
        committed: RUNTIME.committed.load(Ordering::Relaxed),
        retried: RUNTIME.retried.load(Ordering::Relaxed),
    }
}

/// Replaces the process-wide [`RuntimeConfig`].
pub fn configure(config: RuntimeConfig) {
    *RUNTIME.config.lock().expect("runtime config mutex poisoned") = config;
}
