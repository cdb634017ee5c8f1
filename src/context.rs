// Transaction driver: per-thread state plus the validation/commit pipeline.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::commit_list::Ticket as CommitTicket;
use crate::errors::{Result, StmError};
use crate::runtime::{ReadTicket, WriteTicket, RUNTIME};
use crate::stamp::Stamp;
use crate::subscription;
use crate::transactable::Transactable;

/// Identifies one attempt at running an atomic block. Distinct from
/// [`Stamp`]: a transaction retried three times has one changing read stamp
/// per attempt but, within a single attempt, one fixed `TxnId`.
pub type TxnId = u64;

type PreCommitHook = (Box<dyn Fn() -> bool + Send + Sync>, Box<dyn Fn() + Send + Sync>);
type CommuteEntry = (usize, Box<dyn FnOnce(TxnId) + Send>);

struct SideEffect {
    on_commit: Option<Box<dyn FnOnce() + Send>>,
    on_rollback: Option<Box<dyn FnOnce() + Send>>,
}

/// Opaque set of transactional-object identities touched by a commit, handed
/// to [`crate::when_committing`] filters.
pub struct ChangeSet(pub(crate) HashSet<usize>);

impl ChangeSet {
    /// True if `cell` (or dictionary, or sequence, or tree) is part of this
    /// change set.
    pub fn contains_id(&self, id: usize) -> bool {
        self.0.contains(&id)
    }
}

/// Per-attempt transaction state.
///
/// Guarded with [`Mutex`] rather than [`RefCell`] even though, for an
/// ordinary [`atomically`] call, only the owning thread ever touches it: a
/// [`crate::continuation::Continuation`] can hand the same `TxContext` to a
/// background timeout thread or to a caller committing from elsewhere, so it
/// must be `Send + Sync` like everything else this crate hands across
/// threads.
pub(crate) struct TxContext {
    pub id: TxnId,
    read_ticket: ReadTicket,
    enlisted: Mutex<HashMap<usize, Arc<dyn Transactable>>>,
    comm_enlisted: Mutex<HashSet<usize>>,
    direct: Mutex<HashSet<usize>>,
    /// Ids that actually received a buffered write this attempt — via a
    /// direct `write`/`modify` or a drained/degenerated commute. Distinct
    /// from `enlisted`, which also contains pure reads: restricted mode
    /// (`when_committing`, `Continuation::in_context`) must gate writes on
    /// this set, not on enlistment, or a read-only participant could be
    /// promoted to a writer.
    dirty: Mutex<HashSet<usize>>,
    commutes: Mutex<Vec<CommuteEntry>>,
    side_effects: Mutex<Vec<SideEffect>>,
    pre_commit_hooks: Mutex<Vec<PreCommitHook>>,
    restricted: Mutex<Option<RestrictedScope>>,
}

struct RestrictedScope {
    allowed_enlist: HashSet<usize>,
    allowed_write: HashSet<usize>,
}

impl TxContext {
    pub(crate) fn begin() -> Self {
        let read_ticket = RUNTIME.begin_read();
        let id = RUNTIME.next_txn_id();
        trace!("tx({}): begin, read stamp {}", id, read_ticket.stamp);
        Self {
            id,
            read_ticket,
            enlisted: Mutex::new(HashMap::new()),
            comm_enlisted: Mutex::new(HashSet::new()),
            direct: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
            commutes: Mutex::new(Vec::new()),
            side_effects: Mutex::new(Vec::new()),
            pre_commit_hooks: Mutex::new(Vec::new()),
            restricted: Mutex::new(None),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.id
    }

    pub fn read_stamp(&self) -> Stamp {
        self.read_ticket.stamp
    }

    pub fn enlist(&self, item: Arc<dyn Transactable>) {
        let id = item.id();
        if let Some(scope) = self.restricted.lock().expect("tx restricted mutex poisoned").as_ref() {
            if !scope.allowed_enlist.contains(&id) {
                // Fail-fast: restricted transactions may not widen their
                // footprint.
                panic!("restricted transaction attempted to enlist a new transactional object");
            }
        }
        self.enlisted.lock().expect("tx enlisted mutex poisoned").entry(id).or_insert(item);
    }

    /// Marks `id` as touched by commute only (not yet a direct read/write).
    pub fn enlist_commute_only(&self, id: usize) {
        self.comm_enlisted.lock().expect("tx comm_enlisted mutex poisoned").insert(id);
    }

    /// Returns whether `id` already has a buffered local value from a direct
    /// read or write within this transaction.
    pub fn is_direct(&self, id: usize) -> bool {
        self.direct.lock().expect("tx direct mutex poisoned").contains(&id)
    }

    /// Records that `id` now has a direct local buffer, draining any
    /// commutes enqueued for it first.
    pub fn mark_direct(&self, id: usize) {
        self.degenerate_commutes(id);
        self.direct.lock().expect("tx direct mutex poisoned").insert(id);
    }

    /// Records that `id` has a buffered write this attempt, widening what
    /// restricted mode will allow it to write again.
    pub fn mark_dirty(&self, id: usize) {
        self.dirty.lock().expect("tx dirty mutex poisoned").insert(id);
    }

    pub fn check_writable(&self, id: usize) -> Result<()> {
        if let Some(scope) = self.restricted.lock().expect("tx restricted mutex poisoned").as_ref() {
            if !scope.allowed_write.contains(&id) {
                return Err(StmError::invalid(
                    "restricted transaction may only write cells already writable before restriction",
                ));
            }
        }
        Ok(())
    }

    /// Runs every commute queued for `id` immediately, in enqueue order,
    /// against the object's current latest value.
    pub fn degenerate_commutes(&self, id: usize) {
        let mut commutes = self.commutes.lock().expect("tx commutes mutex poisoned");
        if !commutes.iter().any(|(cid, _)| *cid == id) {
            return;
        }
        let mut remaining = Vec::with_capacity(commutes.len());
        let mut matching = Vec::new();
        for entry in commutes.drain(..) {
            if entry.0 == id {
                matching.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        *commutes = remaining;
        drop(commutes);
        for (cid, run) in matching {
            run(self.id);
            self.mark_dirty(cid);
        }
    }

    pub fn push_commute(&self, id: usize, run: Box<dyn FnOnce(TxnId) + Send>) {
        self.comm_enlisted.lock().expect("tx comm_enlisted mutex poisoned").insert(id);
        self.commutes.lock().expect("tx commutes mutex poisoned").push((id, run));
    }

    pub fn push_side_effect(
        &self,
        on_commit: Option<Box<dyn FnOnce() + Send>>,
        on_rollback: Option<Box<dyn FnOnce() + Send>>,
    ) {
        self.side_effects
            .lock()
            .expect("tx side_effects mutex poisoned")
            .push(SideEffect { on_commit, on_rollback });
    }

    pub fn push_pre_commit(&self, test: Box<dyn Fn() -> bool + Send + Sync>, action: Box<dyn Fn() + Send + Sync>) {
        self.pre_commit_hooks.lock().expect("tx pre_commit_hooks mutex poisoned").push((test, action));
    }

    fn enlisted_ids(&self) -> HashSet<usize> {
        self.enlisted.lock().expect("tx enlisted mutex poisoned").keys().copied().collect()
    }

    /// Snapshot of every object id enlisted so far, for subscriptions
    /// capturing the dependency set of a `conditional` `test`.
    pub(crate) fn enlisted_ids_snapshot(&self) -> HashSet<usize> {
        self.enlisted_ids()
    }

    fn comm_enlisted_ids(&self) -> HashSet<usize> {
        self.comm_enlisted.lock().expect("tx comm_enlisted mutex poisoned").clone()
    }

    fn enlisted_items(&self) -> Vec<Arc<dyn Transactable>> {
        self.enlisted.lock().expect("tx enlisted mutex poisoned").values().cloned().collect()
    }

    /// Validation pipeline step 1: re-run pre-commit validators until a full
    /// pass makes no further change.
    fn run_pre_commit(&self) -> Result<()> {
        const MAX_PASSES: usize = 1000;
        for _ in 0..MAX_PASSES {
            let hook_count = self.pre_commit_hooks.lock().expect("tx pre_commit_hooks mutex poisoned").len();
            let mut any_fired = false;
            for idx in 0..hook_count {
                let fires = {
                    let hooks = self.pre_commit_hooks.lock().expect("tx pre_commit_hooks mutex poisoned");
                    (hooks[idx].0)()
                };
                if fires {
                    any_fired = true;
                    let hooks = self.pre_commit_hooks.lock().expect("tx pre_commit_hooks mutex poisoned");
                    (hooks[idx].1)();
                }
            }
            if !any_fired {
                return Ok(());
            }
        }
        Err(StmError::invalid("pre-commit validators did not converge"))
    }

    /// Validation pipeline step 2: drain every remaining (non-degenerated)
    /// commute against each target's current latest value.
    ///
    /// Must only be called after this transaction has entered the commit
    /// check list (`validate`): every other transaction whose footprint
    /// overlaps this one's `comm_enlisted`/`enlisted` sets — including any
    /// other transaction commuting the same cell — is guaranteed to have
    /// already committed or rolled back by the time `enter` returns. Running
    /// this earlier, unprotected, lets two concurrent commutes on the same
    /// cell both read the same stale value and lose one's update.
    fn drain_commutes(&self) {
        let entries: Vec<CommuteEntry> = self.commutes.lock().expect("tx commutes mutex poisoned").drain(..).collect();
        for (cid, run) in entries {
            run(self.id);
            self.mark_dirty(cid);
        }
    }

    pub(crate) fn enter_restricted(&self) {
        let scope = RestrictedScope {
            allowed_enlist: self.enlisted_ids(),
            allowed_write: self.dirty_ids(),
        };
        *self.restricted.lock().expect("tx restricted mutex poisoned") = Some(scope);
    }

    pub(crate) fn exit_restricted(&self) {
        *self.restricted.lock().expect("tx restricted mutex poisoned") = None;
    }

    fn dirty_ids(&self) -> HashSet<usize> {
        self.dirty.lock().expect("tx dirty mutex poisoned").clone()
    }

    pub(crate) fn release(self) {
        RUNTIME.release_read(self.read_ticket);
    }

    pub(crate) fn rollback_all(&self, write_stamp: Option<Stamp>) {
        for item in self.enlisted_items() {
            item.rollback(self.id, write_stamp);
        }
    }

    pub(crate) fn run_pre_commit_public(&self) -> Result<()> {
        self.run_pre_commit()
    }

    pub(crate) fn run_side_effects_commit(&self) -> Result<()> {
        let effects: Vec<Box<dyn FnOnce() + Send>> = self
            .side_effects
            .lock()
            .expect("tx side_effects mutex poisoned")
            .iter_mut()
            .filter_map(|e| e.on_commit.take())
            .collect();
        let mut first: Option<String> = None;
        let mut rest = Vec::new();
        for effect in effects {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(effect));
            if let Err(payload) = result {
                let msg = panic_message(payload);
                if first.is_none() {
                    first = Some(msg);
                } else {
                    rest.push(msg);
                }
            }
        }
        match first {
            Some(first) => Err(StmError::SideEffect { first, aggregated: rest }),
            None => Ok(()),
        }
    }

    pub(crate) fn run_side_effects_rollback(&self) {
        let effects: Vec<Box<dyn FnOnce() + Send>> = self
            .side_effects
            .lock()
            .expect("tx side_effects mutex poisoned")
            .iter_mut()
            .filter_map(|e| e.on_rollback.take())
            .collect();
        for effect in effects {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(effect));
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "side effect panicked".to_string()
    }
}

thread_local! {
    static STACK: RefCell<Vec<Arc<TxContext>>> = RefCell::new(Vec::new());
}

/// Runs `f` inside `ctx`'s closure for the currently active thread-local
/// slot, used both by `atomically` and by a [`crate::continuation::Continuation`]
/// resuming on (possibly) a different thread.
pub(crate) fn with_context<R>(ctx: Arc<TxContext>, f: impl FnOnce() -> R) -> R {
    STACK.with(|s| s.borrow_mut().push(ctx));
    let result = f();
    STACK.with(|s| {
        s.borrow_mut().pop();
    });
    result
}

/// Runs `f` with the currently active [`TxContext`], or returns `None` if no
/// transaction is active on this thread.
pub(crate) fn with_active<R>(f: impl FnOnce(&TxContext) -> R) -> Option<R> {
    STACK.with(|s| s.borrow().last().map(|ctx| f(ctx)))
}

pub(crate) fn is_active() -> bool {
    STACK.with(|s| !s.borrow().is_empty())
}

/// Runs `f` to completion as one atomic transaction, retrying on conflict
///. Nested calls are idempotent: if a transaction is
/// already active on this thread, `f` runs directly inside it.
pub fn atomically<T>(f: impl Fn() -> Result<T>) -> Result<T> {
    if is_active() {
        return f();
    }

    loop {
        let ctx = Arc::new(TxContext::begin());
        let outcome = with_context(ctx.clone(), || -> Result<T> {
            let value = f()?;
            ctx.run_pre_commit()?;
            validate_and_commit(&ctx)?;
            Ok(value)
        });

        match outcome {
            Ok(value) => {
                RUNTIME.record_commit();
                ctx.release();
                match ctx.run_side_effects_commit() {
                    Ok(()) => return Ok(value),
                    Err(e) => return Err(e),
                }
            }
            Err(StmError::Retry) => {
                RUNTIME.record_retry();
                ctx.rollback_all(None);
                ctx.release();
                ctx.run_side_effects_rollback();
                debug!("tx({}): retrying", ctx.id);
                continue;
            }
            Err(other) => {
                ctx.rollback_all(None);
                ctx.release();
                ctx.run_side_effects_rollback();
                return Err(other);
            }
        }
    }
}

/// A transaction that has passed `can_commit` and the `when_committing`
/// observer pass but has not yet published: every validated object still
/// holds its write-stamp lock. Produced by [`validate`], consumed by either
/// [`publish`] or [`abort_pending`].
///
/// This is the seam [`crate::continuation::Continuation`] holds open across
/// `run_to_commit`'s timeout window: ordinary
/// `atomically` calls `validate` and `publish` back to back with nothing in
/// between.
pub(crate) struct PendingCommit {
    write_ticket: WriteTicket,
    commit_ticket: CommitTicket,
    write_stamp: Stamp,
    validated: Vec<Arc<dyn Transactable>>,
}

/// Validation pipeline steps 2–6: drain commutes under commit check-list
/// protection, allocate a write stamp, validate every enlisted object, then
/// run restricted `when_committing` observers. On success every validated
/// object's write-stamp lock is held until the caller publishes or aborts.
pub(crate) fn validate(ctx: &TxContext) -> Result<PendingCommit> {
    let write_ticket = RUNTIME.allocate_write();
    let write_stamp = write_ticket.stamp;
    let config = RUNTIME.config();
    let commit_ticket = RUNTIME
        .commit_list
        .enter(ctx.enlisted_ids(), ctx.comm_enlisted_ids(), &config);

    // Every other transaction whose footprint overlaps ours has already
    // committed or rolled back by the time `enter` returns above, so this
    // drain always applies each commute to the true latest value instead of
    // a value some concurrent commuter already raced past.
    ctx.drain_commutes();

    let items = ctx.enlisted_items();
    let mut validated = Vec::with_capacity(items.len());
    let mut refused = false;
    for item in &items {
        if item.can_commit(ctx.id, ctx.read_stamp(), write_stamp) {
            validated.push(item.clone());
        } else {
            refused = true;
            break;
        }
    }

    if refused {
        for item in &validated {
            item.rollback(ctx.id, Some(write_stamp));
        }
        RUNTIME.commit_list.release(commit_ticket);
        RUNTIME.abandon_write(&write_ticket);
        return Err(StmError::Retry);
    }

    let change_ids: HashSet<usize> = validated.iter().map(|i| i.id()).collect();
    ctx.enter_restricted();
    let observer_outcome = subscription::run_when_committing(&ChangeSet(change_ids));
    ctx.exit_restricted();

    if let Err(e) = observer_outcome {
        for item in &validated {
            item.rollback(ctx.id, Some(write_stamp));
        }
        RUNTIME.commit_list.release(commit_ticket);
        RUNTIME.abandon_write(&write_ticket);
        return Err(e);
    }

    Ok(PendingCommit {
        write_ticket,
        commit_ticket,
        write_stamp,
        validated,
    })
}

/// Validation pipeline steps 7–9: publish every validated object's buffered
/// state, deposit the change set for GC, and notify subscriptions.
pub(crate) fn publish(ctx: &TxContext, pending: PendingCommit) -> Result<()> {
    let PendingCommit {
        write_ticket,
        commit_ticket,
        write_stamp,
        validated,
    } = pending;

    let mut changed_trimmables = Vec::new();
    let mut changed_ids = HashSet::new();
    for item in &validated {
        if item.commit(ctx.id, write_stamp) {
            changed_trimmables.push(item.trimmable());
            changed_ids.insert(item.id());
        }
    }

    RUNTIME.record_changes(&write_ticket, changed_trimmables);
    RUNTIME.commit_list.release(commit_ticket);

    if !changed_ids.is_empty() {
        subscription::notify(&changed_ids);
    }

    Ok(())
}

/// Releases a [`PendingCommit`] without publishing: rolls back every
/// validated object's lock, abandons the write stamp, and lets `trim()` pass
/// it. Used by `run_to_commit`'s timeout and explicit `dispose()` paths.
pub(crate) fn abort_pending(ctx: &TxContext, pending: PendingCommit) {
    for item in &pending.validated {
        item.rollback(ctx.id, Some(pending.write_stamp));
    }
    RUNTIME.commit_list.release(pending.commit_ticket);
    RUNTIME.abandon_write(&pending.write_ticket);
}

/// Validation pipeline steps 3–9 in one call, used by ordinary `atomically`
/// transactions that have no reason to hold the window open.
fn validate_and_commit(ctx: &TxContext) -> Result<()> {
    let pending = validate(ctx)?;
    publish(ctx, pending)
}

/// Returns the opaque identity of `item`, for `ChangeSet` membership checks
/// from outside this module.
pub(crate) fn object_id(item: &Arc<dyn Transactable>) -> usize {
    item.id()
}

/// Registers an on-commit and/or on-rollback closure for the active
/// transaction.
pub fn side_effect(
    on_commit: Option<impl FnOnce() + Send + 'static>,
    on_rollback: Option<impl FnOnce() + Send + 'static>,
) -> Result<()> {
    with_active(|ctx| {
        ctx.push_side_effect(
            on_commit.map(|f| Box::new(f) as Box<dyn FnOnce() + Send>),
            on_rollback.map(|f| Box::new(f) as Box<dyn FnOnce() + Send>),
        );
    })
    .ok_or(StmError::NotInTransaction)
}

/// Registers a pre-commit validator.
pub fn pre_commit(test: impl Fn() -> bool + Send + Sync + 'static, action: impl Fn() + Send + Sync + 'static) -> Result<()> {
    with_active(|ctx| {
        ctx.push_pre_commit(Box::new(test), Box::new(action));
    })
    .ok_or(StmError::NotInTransaction)
}

/// Constructs the retry signal the closure passed to [`atomically`] should
/// return to force a rollback-and-retry.
pub fn retry() -> StmError {
    StmError::Retry
}

/// Constructs the abort signal: rolls back without retrying, propagating to
/// the caller of [`atomically`].
pub fn abort(reason: impl Into<String>) -> StmError {
    StmError::abort(reason)
}

pub(crate) fn spin_sleep() {
    std::thread::sleep(RUNTIME.config().spin_backoff);
}

#[allow(dead_code)]
pub(crate) fn default_poll_interval() -> Duration {
    RUNTIME.config().spin_backoff
}
