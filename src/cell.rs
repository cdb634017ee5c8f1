// The versioned cell primitive.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::context::{self, TxnId};
use crate::errors::{Result, StmError};
use crate::runtime::{Trimmable, RUNTIME};
use crate::stamp::Stamp;
use crate::transactable::Transactable;
use crate::version::VersionChain;

struct WriteLock {
    owner: TxnId,
    /// `Some(ws)` once the owner has validated and is about to publish;
    /// readers whose read stamp is `>= ws` must wait for the lock to clear.
    pending: Option<Stamp>,
}

struct LocalState<T> {
    value: T,
    dirty: bool,
    /// `true` if this local buffer was produced by draining a commute
    /// against the latest value rather than by a direct read/write; such
    /// buffers skip the read-stamp staleness check at commit time.
    via_commute: bool,
}

pub(crate) struct CellInner<T> {
    versions: Mutex<VersionChain<T>>,
    lock: Mutex<Option<WriteLock>>,
    locals: Mutex<std::collections::HashMap<TxnId, LocalState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> CellInner<T> {
    fn id(&self) -> usize {
        self as *const _ as usize
    }
}

impl<T: Clone + Send + Sync + 'static> Trimmable for CellInner<T> {
    fn trim_copies(&self, bound: Stamp) {
        self.versions.lock().expect("cell version mutex poisoned").trim_copies(bound);
    }
}

impl<T: Clone + Send + Sync + 'static> CellInner<T> {
    fn can_commit(&self, txn: TxnId, read_stamp: Stamp, write_stamp: Stamp) -> bool {
        let locals = self.locals.lock().expect("cell locals mutex poisoned");
        let local = match locals.get(&txn) {
            Some(l) => l,
            None => return true, // enlisted but no local buffer: nothing to validate
        };

        if !local.via_commute {
            let head_stamp = self.versions.lock().expect("cell version mutex poisoned").head_stamp();
            if head_stamp > read_stamp {
                return false;
            }
        }

        let dirty = local.dirty;
        drop(locals);
        let mut lock = self.lock.lock().expect("cell write lock mutex poisoned");
        *lock = Some(WriteLock {
            owner: txn,
            pending: if dirty { Some(write_stamp) } else { None },
        });
        true
    }

    fn commit(&self, txn: TxnId, write_stamp: Stamp) -> bool {
        let mut locals = self.locals.lock().expect("cell locals mutex poisoned");
        let local = locals.remove(&txn);
        drop(locals);

        let changed = match local {
            Some(local) if local.dirty => {
                self.versions
                    .lock()
                    .expect("cell version mutex poisoned")
                    .publish(write_stamp, local.value);
                true
            }
            _ => false,
        };

        *self.lock.lock().expect("cell write lock mutex poisoned") = None;
        changed
    }

    fn rollback(&self, txn: TxnId, _write_stamp: Option<Stamp>) {
        self.locals.lock().expect("cell locals mutex poisoned").remove(&txn);
        let mut lock = self.lock.lock().expect("cell write lock mutex poisoned");
        if matches!(&*lock, Some(wl) if wl.owner == txn) {
            *lock = None;
        }
    }
}

/// A versioned, transactional single-value location.
///
/// Outside a transaction, [`TCell::read`] returns the current head value and
/// [`TCell::write`]/[`TCell::modify`] fail with
/// [`StmError::NotInTransaction`]. Inside a transaction both enlist the cell
/// and participate in MVCC validation at commit time.
pub struct TCell<T> {
    inner: Arc<CellHandle<T>>,
}

/// Thin adapter so `Arc<CellHandle<T>>` can be stored as `Arc<dyn
/// Transactable>` while `CellInner<T>` stays the single owner of the version
/// chain and lock — `Transactable::trimmable` needs a concrete `Arc` to
/// unsize, which `CellInner` alone can't produce for itself.
pub(crate) struct CellHandle<T> {
    inner: Arc<CellInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Transactable for CellHandle<T> {
    fn id(&self) -> usize {
        self.inner.id()
    }
    fn can_commit(&self, txn: TxnId, read_stamp: Stamp, write_stamp: Stamp) -> bool {
        self.inner.can_commit(txn, read_stamp, write_stamp)
    }
    fn commit(&self, txn: TxnId, write_stamp: Stamp) -> bool {
        self.inner.commit(txn, write_stamp)
    }
    fn rollback(&self, txn: TxnId, write_stamp: Option<Stamp>) {
        self.inner.rollback(txn, write_stamp)
    }
    fn trimmable(&self) -> Arc<dyn Trimmable> {
        self.inner.clone()
    }
}

impl<T: Clone + Send + Sync + 'static> TCell<T> {
    /// Creates a new cell holding `initial`, visible to everyone from stamp
    /// zero.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(CellHandle {
                inner: Arc::new(CellInner {
                    versions: Mutex::new(VersionChain::new(initial)),
                    lock: Mutex::new(None),
                    locals: Mutex::new(std::collections::HashMap::new()),
                }),
            }),
        }
    }

    fn handle(&self) -> Arc<dyn Transactable> {
        self.inner.clone() as Arc<dyn Transactable>
    }

    /// Blocks until no write-stamp lock pending at or below `read_stamp` is
    /// held.
    fn wait_for_unlocked(&self, read_stamp: Stamp) {
        let config = RUNTIME.config();
        loop {
            let blocked = {
                let lock = self.inner.inner.lock.lock().expect("cell write lock mutex poisoned");
                matches!(&*lock, Some(wl) if wl.pending.map_or(false, |p| p <= read_stamp))
            };
            if !blocked {
                return;
            }
            thread::sleep(config.spin_backoff);
        }
    }

    /// Reads the value visible to the current transaction, or the head value
    /// if called outside a transaction.
    pub fn read(&self) -> Result<T> {
        context::with_active(|ctx| {
            ctx.enlist(self.handle());
            ctx.mark_direct(self.inner.id());
            let txn = ctx.txn_id();
            let read_stamp = ctx.read_stamp();

            {
                let locals = self.inner.inner.locals.lock().expect("cell locals mutex poisoned");
                if let Some(local) = locals.get(&txn) {
                    return Ok(local.value.clone());
                }
            }

            self.wait_for_unlocked(read_stamp);

            let value = self
                .inner
                .inner
                .versions
                .lock()
                .expect("cell version mutex poisoned")
                .visible_at(read_stamp)
                .ok_or_else(|| StmError::invalid("cell has no version visible at this read stamp"))?;

            // Buffer the read, even though it isn't a write: `can_commit`
            // only re-checks cells that have a local entry, so a pure read
            // with nothing recorded here would silently skip the staleness
            // check (a published version newer than our read stamp must
            // force a retry) at validation time.
            self.inner.inner.locals.lock().expect("cell locals mutex poisoned").entry(txn).or_insert_with(|| LocalState {
                value: (*value).clone(),
                dirty: false,
                via_commute: false,
            });

            Ok((*value).clone())
        })
        .unwrap_or_else(|| Ok((*self.inner.inner.versions.lock().expect("cell version mutex poisoned").head_value()).clone()))
    }

    /// Writes `value`, buffering it in the transaction's local state.
    /// Raises [`StmError::Retry`] immediately if the cell's head has already
    /// advanced past this transaction's read stamp.
    pub fn write(&self, value: T) -> Result<()> {
        context::with_active(|ctx| {
            ctx.enlist(self.handle());
            ctx.check_writable(self.inner.id())?;
            ctx.mark_direct(self.inner.id());
            let txn = ctx.txn_id();
            let read_stamp = ctx.read_stamp();

            let head_stamp = self.inner.inner.versions.lock().expect("cell version mutex poisoned").head_stamp();
            if head_stamp > read_stamp {
                return Err(StmError::Retry);
            }

            self.inner.inner.locals.lock().expect("cell locals mutex poisoned").insert(
                txn,
                LocalState {
                    value,
                    dirty: true,
                    via_commute: false,
                },
            );
            ctx.mark_dirty(self.inner.id());
            Ok(())
        })
        .unwrap_or(Err(StmError::NotInTransaction))
    }

    /// Reads then writes the result of `f`, as one enlistment.
    pub fn modify(&self, f: impl FnOnce(T) -> T) -> Result<()> {
        let current = self.read()?;
        self.write(f(current))
    }

    /// Enqueues `f` as a commute on this cell. The closure must only touch this cell;
    /// it runs at commit time against the then-latest value, not against the
    /// value observed when `commute` was called.
    ///
    /// If the transaction later reads or writes this cell directly, all
    /// pending commutes on it degenerate into an immediate ordinary write.
    pub fn commute(&self, f: impl FnOnce(T) -> T + Send + 'static) -> Result<()> {
        context::with_active(|ctx| {
            ctx.enlist(self.handle());
            if ctx.is_direct(self.inner.id()) {
                // A direct read/write already took place: degenerate now.
                let current = self.read_local_or_head(ctx.txn_id())?;
                return self.write(f(current));
            }

            let inner = self.inner.clone();
            let id = self.inner.id();
            ctx.push_commute(
                id,
                Box::new(move |txn| {
                    let head = inner.inner.versions.lock().expect("cell version mutex poisoned").head_value();
                    let new_value = f((*head).clone());
                    inner.inner.locals.lock().expect("cell locals mutex poisoned").insert(
                        txn,
                        LocalState {
                            value: new_value,
                            dirty: true,
                            via_commute: true,
                        },
                    );
                }),
            );
            Ok(())
        })
        .unwrap_or(Err(StmError::NotInTransaction))
    }

    fn read_local_or_head(&self, txn: TxnId) -> Result<T> {
        let locals = self.inner.inner.locals.lock().expect("cell locals mutex poisoned");
        if let Some(local) = locals.get(&txn) {
            return Ok(local.value.clone());
        }
        drop(locals);
        Ok((*self.inner.inner.versions.lock().expect("cell version mutex poisoned").head_value()).clone())
    }

    /// Reads the current head value without requiring a transaction.
    pub fn value(&self) -> T {
        (*self.inner.inner.versions.lock().expect("cell version mutex poisoned").head_value()).clone()
    }
}

impl<T> Clone for TCell<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomically;

    #[test]
    fn read_after_write_in_same_transaction_sees_write() {
        let cell = TCell::new(5);
        atomically(|| {
            cell.write(20)?;
            assert_eq!(cell.read()?, 20);
            Ok(())
        })
        .unwrap();
        assert_eq!(cell.value(), 20);
    }

    #[test]
    fn outside_transaction_write_fails() {
        let cell = TCell::new(1);
        assert!(matches!(cell.write(2), Err(StmError::NotInTransaction)));
    }

    #[test]
    fn basic_isolation_scenario() {
        let cell = TCell::new(5);
        assert_eq!(cell.value(), 5);
        atomically(|| cell.write(20)).unwrap();
        assert_eq!(cell.value(), 20);
    }
}
