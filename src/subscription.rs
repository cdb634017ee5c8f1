// Global registries for `conditional` subscriptions and `when_committing`
// observers.

use std::collections::HashSet;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::{debug, trace};

use crate::context::{atomically, with_active, ChangeSet};
use crate::errors::{Result, StmError};

/// One `conditional(test, action)` registration. `dependency_set` is the
/// union of every cell `test` has read across its evaluations so far.
struct Subscription {
    dependency_set: HashSet<usize>,
    test: Box<dyn Fn() -> Result<bool> + Send + Sync>,
    action: Box<dyn Fn() -> Result<bool> + Send + Sync>,
}

struct WhenCommitting {
    filter: Box<dyn Fn(&ChangeSet) -> bool + Send + Sync>,
    observer: Box<dyn Fn(&ChangeSet) -> Result<()> + Send + Sync>,
}

lazy_static! {
    static ref SUBSCRIPTIONS: Mutex<Vec<Subscription>> = Mutex::new(Vec::new());
    static ref WHEN_COMMITTING: Mutex<Vec<WhenCommitting>> = Mutex::new(Vec::new());
}

/// Registers `test`/`action` as a conditional retry subscription. `test` runs once up front in its own sub-transaction to
/// capture an initial dependency set; [`StmError::InvalidState`] if it
/// touches no transactional object, since such a subscription could never
/// fire.
pub fn conditional(
    test: impl Fn() -> Result<bool> + Send + Sync + 'static,
    action: impl Fn() -> Result<bool> + Send + Sync + 'static,
) -> Result<()> {
    let (fired, deps) = evaluate_test(&test)?;
    if deps.is_empty() {
        return Err(StmError::invalid("conditional test did not touch any transactional object"));
    }

    if fired {
        let keep = atomically(|| action())?;
        if keep {
            register(deps, test, action);
        }
        return Ok(());
    }

    register(deps, test, action);
    Ok(())
}

fn register(
    deps: HashSet<usize>,
    test: impl Fn() -> Result<bool> + Send + Sync + 'static,
    action: impl Fn() -> Result<bool> + Send + Sync + 'static,
) {
    SUBSCRIPTIONS.lock().expect("subscriptions mutex poisoned").push(Subscription {
        dependency_set: deps,
        test: Box::new(test),
        action: Box::new(action),
    });
}

/// Runs `test` in a fresh sub-transaction, recording every object it
/// enlisted as the returned dependency set.
///
/// The snapshot must be taken from *inside* the closure handed to
/// [`atomically`]: by the time `atomically` returns, the transaction's
/// thread-local context has already been popped and dropped, so a
/// `with_active` call after the fact would always see no active
/// transaction and silently report an empty dependency set.
fn evaluate_test(test: &(impl Fn() -> Result<bool> + Send + Sync + ?Sized)) -> Result<(bool, HashSet<usize>)> {
    let deps: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
    let fired = atomically(|| {
        let fired = test()?;
        with_active(|ctx| {
            *deps.lock().expect("conditional deps mutex poisoned") = ctx.enlisted_ids_snapshot();
        });
        Ok(fired)
    })?;
    Ok((fired, deps.into_inner().expect("conditional deps mutex poisoned")))
}

/// Registers a `when_committing(filter, observer)` global validation-time
/// hook. Observers run in registration order, in the
/// restricted mode entered by [`crate::context::validate_and_commit`].
pub fn when_committing(
    filter: impl Fn(&ChangeSet) -> bool + Send + Sync + 'static,
    observer: impl Fn(&ChangeSet) -> Result<()> + Send + Sync + 'static,
) {
    WHEN_COMMITTING.lock().expect("when_committing mutex poisoned").push(WhenCommitting {
        filter: Box::new(filter),
        observer: Box::new(observer),
    });
}

/// Invoked from inside the committing transaction's restricted scope. Runs every registered observer whose filter matches
/// `changes`, in registration order, stopping at (and propagating) the first
/// failure.
pub(crate) fn run_when_committing(changes: &ChangeSet) -> Result<()> {
    let observers = WHEN_COMMITTING.lock().expect("when_committing mutex poisoned");
    for entry in observers.iter() {
        if (entry.filter)(changes) {
            (entry.observer)(changes)?;
        }
    }
    Ok(())
}

/// Invoked after a successful commit. Re-evaluates
/// every subscription whose dependency set intersects `changed_ids`,
/// synchronously on the committing thread.
pub(crate) fn notify(changed_ids: &HashSet<usize>) {
    let candidates: Vec<usize> = {
        let subs = SUBSCRIPTIONS.lock().expect("subscriptions mutex poisoned");
        subs.iter()
            .enumerate()
            .filter(|(_, s)| !s.dependency_set.is_disjoint(changed_ids))
            .map(|(i, _)| i)
            .collect()
    };

    // Re-evaluation can change a subscription's position (or remove it), so
    // re-index is done through identity of the stored closures rather than a
    // stale index: take the entries out, run them outside the lock, then
    // decide what to put back.
    if candidates.is_empty() {
        return;
    }

    let taken: Vec<Subscription> = {
        let mut subs = SUBSCRIPTIONS.lock().expect("subscriptions mutex poisoned");
        let mut taken = Vec::with_capacity(candidates.len());
        // Remove from the back so earlier indices stay valid.
        let mut idxs = candidates;
        idxs.sort_unstable_by(|a, b| b.cmp(a));
        for idx in idxs {
            taken.push(subs.remove(idx));
        }
        taken
    };

    for sub in taken {
        reevaluate(sub);
    }
}

fn reevaluate(sub: Subscription) {
    let mut deps = sub.dependency_set.clone();
    let observed: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
    let fired = match atomically(|| {
        let fired = (sub.test)()?;
        with_active(|ctx| {
            *observed.lock().expect("conditional deps mutex poisoned") = ctx.enlisted_ids_snapshot();
        });
        Ok(fired)
    }) {
        Ok(v) => v,
        Err(e) => {
            debug!("subscription test raised during re-evaluation: {e}");
            return;
        }
    };
    deps.extend(observed.into_inner().expect("conditional deps mutex poisoned"));

    if !fired {
        reregister(deps, sub.test, sub.action);
        return;
    }

    let keep = match atomically(|| (sub.action)()) {
        Ok(v) => v,
        Err(e) => {
            debug!("subscription action raised during re-evaluation: {e}");
            return;
        }
    };
    trace!("conditional: test fired, action ran, keep={keep}");
    if keep {
        reregister(deps, sub.test, sub.action);
    }
}

fn reregister(deps: HashSet<usize>, test: Box<dyn Fn() -> Result<bool> + Send + Sync>, action: Box<dyn Fn() -> Result<bool> + Send + Sync>) {
    SUBSCRIPTIONS.lock().expect("subscriptions mutex poisoned").push(Subscription {
        dependency_set: deps,
        test,
        action,
    });
}
