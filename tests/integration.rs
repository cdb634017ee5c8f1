// Integration tests exercising the public transactional API end to end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mvcc_stm::{atomically, conditional, run_to_commit, side_effect, TCell, TDict, TSequence, Timeout};

#[test]
fn single_transaction_read_modify_write() {
    let var: TCell<usize> = TCell::new(21);

    atomically(|| {
        let current = var.read()?;
        var.write(current + 42)
    })
    .expect("transaction failed");

    assert_eq!(var.value(), 63);
}

#[test]
fn multiple_transactions_on_distinct_cells() {
    let a: TCell<usize> = TCell::new(0);
    let b: TCell<usize> = TCell::new(0);

    let a1 = a.clone();
    let t1 = thread::spawn(move || atomically(|| a1.write(10)).unwrap());

    let b1 = b.clone();
    let t2 = thread::spawn(move || atomically(|| b1.write(20)).unwrap());

    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(a.value(), 10);
    assert_eq!(b.value(), 20);
}

#[test]
fn outside_transaction_reads_see_only_committed_state() {
    // Basic isolation: writes outside a transaction are still atomic.
    let cell: TCell<usize> = TCell::new(5);
    assert_eq!(cell.value(), 5);

    atomically(|| cell.write(20)).unwrap();
    assert_eq!(cell.value(), 20);
}

#[test]
fn race_convergence_under_contention() {
    // 100 threads each add their own index to a shared counter, sleeping
    // briefly between read and write to widen the race window. The sum
    // 1..=100 is 5050 regardless of how many times any attempt retried.
    let x: Arc<TCell<i64>> = Arc::new(TCell::new(0));
    let mut handles = Vec::new();
    for i in 1..=100i64 {
        let x = x.clone();
        handles.push(thread::spawn(move || {
            atomically(|| {
                let current = x.read()?;
                thread::sleep(Duration::from_millis(5));
                x.write(current + i)
            })
            .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(x.value(), 5050);
}

#[test]
fn skew_write_prevention() {
    // Two cells start at `cats = dogs = 1`; each
    // transaction re-checks `cats + dogs < 3` before incrementing its own
    // counter, so only one of the two may ever actually apply its
    // increment. The cell it merely read (not wrote) still gets enlisted,
    // so whichever transaction validates second must observe the other's
    // commit and retry its guard check — this relies on the invariant-2
    // fix above applying to read-only participants, not just writers.
    let cats: Arc<TCell<i64>> = Arc::new(TCell::new(1));
    let dogs: Arc<TCell<i64>> = Arc::new(TCell::new(1));

    let c1 = cats.clone();
    let d1 = dogs.clone();
    let t1 = thread::spawn(move || {
        atomically(|| {
            let total = c1.read()? + d1.read()?;
            thread::sleep(Duration::from_millis(200));
            if total >= 3 {
                return Ok(());
            }
            let current = c1.read()?;
            c1.write(current + 1)
        })
        .unwrap()
    });

    let c2 = cats.clone();
    let d2 = dogs.clone();
    let t2 = thread::spawn(move || {
        atomically(|| {
            let total = c2.read()? + d2.read()?;
            thread::sleep(Duration::from_millis(200));
            if total >= 3 {
                return Ok(());
            }
            let current = d2.read()?;
            d2.write(current + 1)
        })
        .unwrap()
    });

    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(cats.value() + dogs.value(), 3);
}

#[test]
fn commutative_append_from_concurrent_transactions() {
    // Two concurrent appends to the same sequence must not clobber each other.
    let seq: Arc<TSequence<usize>> = Arc::new(TSequence::new());

    let s1 = seq.clone();
    let t1 = thread::spawn(move || atomically(|| s1.append(1)).unwrap());
    let s2 = seq.clone();
    let t2 = thread::spawn(move || atomically(|| s2.append(2)).unwrap());

    t1.join().unwrap();
    t2.join().unwrap();

    let items = atomically(|| seq.copy_to()).unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.contains(&1) && items.contains(&2));
}

#[test]
fn conditional_trigger_never_fires_on_odd_values() {
    // Reduced iteration count for test speed.
    let x: Arc<TCell<i64>> = Arc::new(TCell::new(0));
    let test_calls = Arc::new(AtomicUsize::new(0));
    let action_calls = Arc::new(AtomicUsize::new(0));
    let saw_odd = Arc::new(AtomicBool::new(false));

    let x_test = x.clone();
    let calls_test = test_calls.clone();
    let saw_odd_test = saw_odd.clone();
    let calls_action = action_calls.clone();

    conditional(
        move || {
            calls_test.fetch_add(1, Ordering::SeqCst);
            let v = x_test.read()?;
            if v % 2 != 0 {
                saw_odd_test.store(true, Ordering::SeqCst);
            }
            Ok(v > 0 && v % 2 == 0)
        },
        move || {
            calls_action.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        },
    )
    .unwrap();

    for _ in 0..100 {
        atomically(|| {
            let current = x.read()?;
            x.write(current + 1)
        })
        .unwrap();
    }

    assert!(!saw_odd.load(Ordering::SeqCst), "conditional test must never observe an odd value as triggering");
    assert!(action_calls.load(Ordering::SeqCst) >= 1);
}

#[test]
fn run_to_commit_timeout_rolls_back_and_runs_side_effect() {
    // A continuation that never commits before its deadline rolls back and
    // runs its registered rollback side effect.
    let cell: TCell<i64> = TCell::new(1);
    let rolled_back = Arc::new(AtomicBool::new(false));

    let inner = cell.clone();
    let rb = rolled_back.clone();
    let _continuation = run_to_commit(Timeout::Millis(50), move || {
        side_effect(None, Some(move || rb.store(true, Ordering::SeqCst)))?;
        inner.write(10)
    })
    .unwrap();

    thread::sleep(Duration::from_millis(200));

    assert!(rolled_back.load(Ordering::SeqCst));
    assert_eq!(atomically(|| cell.read()).unwrap(), 1);
}

#[test]
fn dictionary_insert_remove_and_iteration() {
    let dict: TDict<String, i32> = TDict::new();
    atomically(|| {
        dict.insert("a".to_string(), 1)?;
        dict.insert("b".to_string(), 2)?;
        dict.insert("c".to_string(), 3)?;
        Ok(())
    })
    .unwrap();

    atomically(|| dict.remove("b".to_string())).unwrap();

    let mut pairs = atomically(|| dict.iter()).unwrap();
    pairs.sort();
    assert_eq!(pairs, vec![("a".to_string(), 1), ("c".to_string(), 3)]);
    assert_eq!(atomically(|| dict.len()).unwrap(), 2);
}
