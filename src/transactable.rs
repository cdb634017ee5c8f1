// Common seam every enlistable transactional object implements, so the
// driver can validate/commit/rollback a heterogeneous enlisted set without
// knowing the concrete value types involved.

use std::sync::Arc;

use crate::context::TxnId;
use crate::runtime::Trimmable;
use crate::stamp::Stamp;

/// Object-safe seam implemented by [`crate::cell::TCell`],
/// [`crate::dict::TDict`] and [`crate::tree::ShieldedTree`] (via internal
/// handle types) so the transaction context can hold a heterogeneous
/// `Vec<Arc<dyn Transactable>>` as its enlisted set.
pub(crate) trait Transactable: Send + Sync {
    /// Stable identity used for enlistment dedup and commit-list overlap
    /// checks — the address of the object's shared inner state.
    fn id(&self) -> usize;

    /// Step 5 of the validation pipeline: may this transaction's
    /// write stamp be published? If `true`, the object must have taken
    /// whatever per-location lock prevents concurrent publication until
    /// `commit`/`rollback` releases it.
    fn can_commit(&self, txn: TxnId, read_stamp: Stamp, write_stamp: Stamp) -> bool;

    /// Step 7: publish the buffered local state under `write_stamp`. Returns
    /// `true` if a new version was actually published (i.e. the object was
    /// dirty), so the driver can include it in the change set handed to
    /// [`crate::runtime::Runtime::record_changes`].
    fn commit(&self, txn: TxnId, write_stamp: Stamp) -> bool;

    /// Discards local state for `txn` and releases any lock it holds. Called
    /// both on ordinary rollback (`write_stamp: None`) and when `can_commit`
    /// refused after some other object in the set already took its lock
    /// (`write_stamp: Some(ws)`).
    fn rollback(&self, txn: TxnId, write_stamp: Option<Stamp>);

    /// A handle usable by the GC epoch sweep to collapse this object's
    /// version history once it is no longer reachable by any live reader.
    fn trimmable(&self) -> Arc<dyn Trimmable>;
}
