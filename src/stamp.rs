// Monotonic stamp issuance.

use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit monotonically increasing version/commit marker.
///
/// Two stamps are drawn from the same counter: a *read stamp*, taken when a
/// transaction begins (reads observe the newest version at or below it), and
/// a *write stamp*, taken immediately before validation.
pub type Stamp = u64;

/// Sentinel meaning "no write has ever happened" / "before time begins".
pub const STAMP_ZERO: Stamp = 0;

/// Issues monotonically increasing stamps from a single global counter.
///
/// One instance backs the whole process; see [`crate::runtime::Runtime`].
#[derive(Debug, Default)]
pub(crate) struct StampSource {
    counter: AtomicU64,
}

impl StampSource {
    pub(crate) fn new() -> Self {
        Self {
            counter: AtomicU64::new(STAMP_ZERO),
        }
    }

    /// Returns the current stamp without advancing it. Used to hand out read
    /// stamps, which observe "now" without claiming a publication slot.
    pub(crate) fn current(&self) -> Stamp {
        self.counter.load(Ordering::SeqCst)
    }

    /// Atomically advances the counter and returns the new value. Used to
    /// allocate a write stamp for a committing transaction.
    pub(crate) fn advance(&self) -> Stamp {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}
