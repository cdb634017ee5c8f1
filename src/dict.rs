// The versioned dictionary: a single enlisted object fronting a
// key->chain-of-versions map plus a key->write-stamp-lock map.

use std::collections::HashMap;
use std::hash::Hash;
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
    pending: Option<Stamp>,
}

/// Per-transaction buffered state for one key. `value: None` records either
/// an observed-absent read or a pending removal; `dirty` distinguishes the
/// latter from the former.
struct LocalEntry<V> {
    value: Option<V>,
    dirty: bool,
}

struct KeyState<V> {
    versions: VersionChain<Option<V>>,
    lock: Option<WriteLock>,
}

struct DictInner<K, V> {
    keys: Mutex<HashMap<K, KeyState<V>>>,
    locals: Mutex<HashMap<TxnId, HashMap<K, LocalEntry<V>>>>,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> DictInner<K, V> {
    fn id(&self) -> usize {
        self as *const _ as usize
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> Trimmable for DictInner<K, V> {
    /// Trims every key's chain independently and drops keys whose newest
    /// surviving entry is the removal tombstone with nothing newer.
    fn trim_copies(&self, bound: Stamp) {
        let mut keys = self.keys.lock().expect("dict keys mutex poisoned");
        keys.retain(|_, state| {
            state.versions.trim_copies(bound);
            !matches!(state.versions.head_value().as_ref(), None if state.versions.only_entry())
        });
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> DictInner<K, V> {
    fn can_commit(&self, txn: TxnId, read_stamp: Stamp, write_stamp: Stamp) -> bool {
        let mut locals = self.locals.lock().expect("dict locals mutex poisoned");
        let local = match locals.get_mut(&txn) {
            Some(l) if !l.is_empty() => l,
            _ => return true,
        };

        let mut keys = self.keys.lock().expect("dict keys mutex poisoned");
        for (key, entry) in local.iter() {
            if let Some(state) = keys.get(key) {
                if matches!(&state.lock, Some(wl) if wl.owner != txn) {
                    return false;
                }
                if state.versions.head_stamp() > read_stamp {
                    return false;
                }
            }
            if entry.dirty {
                let state = keys.entry(key.clone()).or_insert_with(|| KeyState {
                    versions: VersionChain::new(None),
                    lock: None,
                });
                state.lock = Some(WriteLock {
                    owner: txn,
                    pending: Some(write_stamp),
                });
            }
        }
        true
    }

    fn commit(&self, txn: TxnId, write_stamp: Stamp) -> bool {
        let local = self.locals.lock().expect("dict locals mutex poisoned").remove(&txn);
        let local = match local {
            Some(l) => l,
            None => return false,
        };

        let mut changed = false;
        let mut keys = self.keys.lock().expect("dict keys mutex poisoned");
        for (key, entry) in local {
            if !entry.dirty {
                continue;
            }
            let state = keys.entry(key).or_insert_with(|| KeyState {
                versions: VersionChain::new(None),
                lock: None,
            });
            state.versions.publish(write_stamp, entry.value);
            state.lock = None;
            changed = true;
        }
        changed
    }

    fn rollback(&self, txn: TxnId, _write_stamp: Option<Stamp>) {
        let local = self.locals.lock().expect("dict locals mutex poisoned").remove(&txn);
        if let Some(local) = local {
            let mut keys = self.keys.lock().expect("dict keys mutex poisoned");
            for key in local.keys() {
                if let Some(state) = keys.get_mut(key) {
                    if matches!(&state.lock, Some(wl) if wl.owner == txn) {
                        state.lock = None;
                    }
                }
            }
        }
    }
}

/// A versioned key-value map. Unlike [`crate::cell::TCell`], the
/// whole dictionary enlists as a single transactional object regardless of
/// how many distinct keys a transaction touches; per-key state only governs
/// write-stamp conflicts and version visibility.
///
/// Restricted-mode note: [`crate::when_committing`] observers may write any
/// key of an already-enlisted dictionary, not just keys the validating
/// transaction itself touched, as long as this transaction wrote *some* key
/// of it before entering restricted mode — the restriction enforced by
/// [`crate::context::TxContext`] operates at object granularity (matching
/// every other enlistable container here), not per-key; a read-only
/// dictionary enlistment still cannot be promoted to a writer, only the
/// per-key refinement beyond that is unmodeled (see DESIGN.md).
pub struct TDict<K, V> {
    inner: Arc<DictHandle<K, V>>,
}

pub(crate) struct DictHandle<K, V> {
    inner: Arc<DictInner<K, V>>,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> Transactable for DictHandle<K, V> {
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

impl<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> TDict<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DictHandle {
                inner: Arc::new(DictInner {
                    keys: Mutex::new(HashMap::new()),
                    locals: Mutex::new(HashMap::new()),
                }),
            }),
        }
    }

    fn handle(&self) -> Arc<dyn Transactable> {
        self.inner.clone() as Arc<dyn Transactable>
    }

    fn wait_for_unlocked(&self, key: &K, read_stamp: Stamp) {
        let config = RUNTIME.config();
        loop {
            let blocked = {
                let keys = self.inner.inner.keys.lock().expect("dict keys mutex poisoned");
                matches!(keys.get(key).and_then(|s| s.lock.as_ref()), Some(wl) if wl.pending.map_or(false, |p| p <= read_stamp))
            };
            if !blocked {
                return;
            }
            thread::sleep(config.spin_backoff);
        }
    }

    /// Reads `key`'s value, recording it as touched in the transaction's
    /// local map. Returns `None` if the key is absent.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        context::with_active(|ctx| {
            ctx.enlist(self.handle());
            ctx.mark_direct(self.inner.id());
            let txn = ctx.txn_id();
            let read_stamp = ctx.read_stamp();

            {
                let locals = self.inner.inner.locals.lock().expect("dict locals mutex poisoned");
                if let Some(local) = locals.get(&txn).and_then(|m| m.get(key)) {
                    return Ok(local.value.clone());
                }
            }

            self.wait_for_unlocked(key, read_stamp);

            let value = {
                let keys = self.inner.inner.keys.lock().expect("dict keys mutex poisoned");
                keys.get(key).and_then(|state| state.versions.visible_at(read_stamp)).and_then(|v| (*v).clone())
            };

            self.inner
                .inner
                .locals
                .lock()
                .expect("dict locals mutex poisoned")
                .entry(txn)
                .or_default()
                .entry(key.clone())
                .or_insert(LocalEntry { value: value.clone(), dirty: false });

            Ok(value)
        })
        .unwrap_or_else(|| {
            let keys = self.inner.inner.keys.lock().expect("dict keys mutex poisoned");
            Ok(keys.get(key).and_then(|state| (*state.versions.head_value()).clone()))
        })
    }

    /// Buffers `value` under `key`, raising [`StmError::Retry`] if the key's
    /// head has advanced past this transaction's read stamp.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.write_local(key, Some(value))
    }

    /// Equivalent to writing the "empty" marker for `key`.
    pub fn remove(&self, key: K) -> Result<()> {
        self.write_local(key, None)
    }

    fn write_local(&self, key: K, value: Option<V>) -> Result<()> {
        context::with_active(|ctx| {
            ctx.enlist(self.handle());
            ctx.check_writable(self.inner.id())?;
            ctx.mark_direct(self.inner.id());
            let txn = ctx.txn_id();
            let read_stamp = ctx.read_stamp();

            let head_stamp = {
                let keys = self.inner.inner.keys.lock().expect("dict keys mutex poisoned");
                keys.get(&key).map(|s| s.versions.head_stamp()).unwrap_or(crate::stamp::STAMP_ZERO)
            };
            if head_stamp > read_stamp {
                return Err(StmError::Retry);
            }

            self.inner
                .inner
                .locals
                .lock()
                .expect("dict locals mutex poisoned")
                .entry(txn)
                .or_default()
                .insert(key, LocalEntry { value, dirty: true });
            ctx.mark_dirty(self.inner.id());
            Ok(())
        })
        .unwrap_or(Err(StmError::NotInTransaction))
    }

    /// True if `key` currently has a value, checked through the same
    /// transactional read path as [`TDict::get`].
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns `key`'s value, failing with [`StmError::KeyNotFound`] if
    /// absent.
    pub fn require(&self, key: &K) -> Result<V> {
        self.get(key)?.ok_or(StmError::KeyNotFound)
    }

    /// Safe-default enumeration: holds the dictionary's key-map lock for the
    /// whole snapshot, so no concurrent transaction can insert a new key
    /// mid-enumeration. See [`TDict::iter_lax`] for the cheaper opt-in.
    pub fn iter(&self) -> Result<Vec<(K, V)>> {
        context::with_active(|ctx| {
            ctx.enlist(self.handle());
            ctx.mark_direct(self.inner.id());
            let read_stamp = ctx.read_stamp();
            let keys = self.inner.inner.keys.lock().expect("dict keys mutex poisoned");
            keys.iter()
                .filter_map(|(k, state)| state.versions.visible_at(read_stamp).and_then(|v| (*v).clone()).map(|v| (k.clone(), v)))
                .collect::<Vec<_>>()
        })
        .ok_or(StmError::NotInTransaction)
    }

    /// Lax opt-in enumeration: snapshots the key set without
    /// holding the lock across the whole pass, so a key inserted by a
    /// concurrently-committing transaction may or may not be observed.
    /// Safe only for read-only transactions or writers that do not depend
    /// on seeing every item.
    pub fn iter_lax(&self) -> Result<Vec<(K, V)>> {
        context::with_active(|ctx| {
            ctx.enlist(self.handle());
            ctx.mark_direct(self.inner.id());
            let read_stamp = ctx.read_stamp();
            let snapshot: Vec<K> = self.inner.inner.keys.lock().expect("dict keys mutex poisoned").keys().cloned().collect();
            let mut out = Vec::with_capacity(snapshot.len());
            for k in snapshot {
                let value = {
                    let keys = self.inner.inner.keys.lock().expect("dict keys mutex poisoned");
                    keys.get(&k).and_then(|s| s.versions.visible_at(read_stamp)).and_then(|v| (*v).clone())
                };
                if let Some(v) = value {
                    out.push((k, v));
                }
            }
            out
        })
        .ok_or(StmError::NotInTransaction)
    }

    /// Number of keys currently holding a value, visible to the active
    /// transaction.
    pub fn len(&self) -> Result<usize> {
        Ok(self.iter()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every key currently holding a value, via the safe-default [`TDict::iter`].
    pub fn keys(&self) -> Result<Vec<K>> {
        Ok(self.iter()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Every value currently present, via the safe-default [`TDict::iter`].
    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.iter()?.into_iter().map(|(_, v)| v).collect())
    }
}

impl<K, V> Clone for TDict<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> Default for TDict<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
