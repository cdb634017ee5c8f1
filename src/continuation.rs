// `run_to_commit` continuations.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::context::{self, PendingCommit, TxContext};
use crate::errors::{Result, StmError};

/// How long [`run_to_commit`] holds its write-stamp locks open before
/// forcing a rollback.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    Millis(u64),
    Infinite,
}

struct Held {
    ctx: Arc<TxContext>,
    pending: PendingCommit,
}

/// A validated-but-unpublished transaction, returned by [`run_to_commit`].
/// Every write-stamp lock the transaction acquired during validation stays
/// held — blocking any reader whose read stamp would observe it — until
/// [`Continuation::commit`], [`Continuation::dispose`], or the timeout
/// releases it.
pub struct Continuation {
    held: Arc<Mutex<Option<Held>>>,
}

/// Runs `f` as one attempt at a transaction, validates it, and returns a
/// [`Continuation`] holding the result open rather than publishing
/// immediately. A background timer forces
/// rollback after `timeout` if neither `commit` nor `dispose` is called
/// first.
///
/// Unlike [`crate::atomically`], a failed validation here returns the error
/// directly rather than retrying — the caller decides whether to try again.
pub fn run_to_commit(timeout: Timeout, f: impl FnOnce() -> Result<()>) -> Result<Continuation> {
    let ctx = Arc::new(TxContext::begin());
    let outcome = context::with_context(ctx.clone(), || -> Result<PendingCommit> {
        f()?;
        ctx.run_pre_commit_public()?;
        context::validate(&ctx)
    });

    let pending = match outcome {
        Ok(pending) => pending,
        Err(e) => {
            ctx.rollback_all(None);
            unwrap_ctx(ctx).release();
            return Err(e);
        }
    };

    let held = Arc::new(Mutex::new(Some(Held { ctx, pending })));

    if let Timeout::Millis(ms) = timeout {
        let held = held.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            let taken = held.lock().expect("continuation mutex poisoned").take();
            if let Some(held) = taken {
                debug!("run_to_commit: timeout elapsed, rolling back");
                rollback_held(held);
            }
        });
    }

    Ok(Continuation { held })
}

fn unwrap_ctx(ctx: Arc<TxContext>) -> TxContext {
    Arc::try_unwrap(ctx).unwrap_or_else(|_| panic!("continuation context still shared when it should be exclusive"))
}

fn rollback_held(held: Held) {
    context::abort_pending(&held.ctx, held.pending);
    held.ctx.run_side_effects_rollback();
    unwrap_ctx(held.ctx).release();
}

impl Continuation {
    /// Publishes the held transaction, releasing its locks and running
    /// on-commit side effects.
    pub fn commit(&self) -> Result<()> {
        let taken = self.held.lock().expect("continuation mutex poisoned").take();
        let held = taken.ok_or(StmError::ContinuationCompleted)?;
        context::publish(&held.ctx, held.pending)?;
        let ctx = unwrap_ctx(held.ctx);
        let effects = ctx.run_side_effects_commit();
        ctx.release();
        trace!("continuation: committed");
        effects
    }

    /// Rolls back the held transaction without committing, running
    /// on-rollback side effects.
    pub fn dispose(&self) -> Result<()> {
        let taken = self.held.lock().expect("continuation mutex poisoned").take();
        let held = taken.ok_or(StmError::ContinuationCompleted)?;
        trace!("continuation: disposed");
        rollback_held(held);
        Ok(())
    }

    /// Runs `f` under the paused transaction in restricted mode — it may
    /// read any cell already enlisted and write any cell already dirty, but
    /// cannot enlist anything new or promote a reader to writer.
    pub fn in_context<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = self.held.lock().expect("continuation mutex poisoned");
        let held = guard.as_ref().ok_or(StmError::ContinuationCompleted)?;
        let ctx = held.ctx.clone();
        drop(guard);

        ctx.enter_restricted();
        let result = context::with_context(ctx.clone(), f);
        ctx.exit_restricted();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomically;
    use crate::cell::TCell;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn dispose_rolls_back_without_publishing() {
        let cell = TCell::new(1);
        let inner = cell.clone();
        let cont = run_to_commit(Timeout::Infinite, move || inner.write(99)).unwrap();
        cont.dispose().unwrap();
        assert_eq!(cell.value(), 1);
    }

    #[test]
    fn commit_publishes_held_write() {
        let cell = TCell::new(1);
        let inner = cell.clone();
        let cont = run_to_commit(Timeout::Infinite, move || inner.write(99)).unwrap();
        cont.commit().unwrap();
        assert_eq!(cell.value(), 99);
    }

    #[test]
    fn timeout_forces_rollback_and_concurrent_read_sees_prewrite_value() {
        let cell = TCell::new(1);
        let rolled_back = StdArc::new(AtomicBool::new(false));
        let rb = rolled_back.clone();
        let inner = cell.clone();
        let _cont = run_to_commit(Timeout::Millis(50), move || {
            crate::context::side_effect(None, Some(move || rb.store(true, Ordering::SeqCst)))?;
            inner.write(10)
        })
        .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(rolled_back.load(Ordering::SeqCst));
        assert_eq!(atomically(|| cell.read()).unwrap(), 1);
    }
}
