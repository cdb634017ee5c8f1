// Broader scenario tests in the style of the crate this runtime grew out of:
// thread-pooled workers hammering shared transactional state, checked against
// an expected final value rather than against any particular interleaving.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::distributions::{Bernoulli, Distribution};
use threadpool::ThreadPool;

use mvcc_stm::{atomically, stats, ShieldedTree, TCell, TDict, TSequence};

#[cfg(feature = "verbose")]
#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Debug).try_init();
}

#[test]
fn transfer_between_three_accounts() {
    let alice = TCell::new(10i64);
    let bob = TCell::new(100i64);
    let charly = TCell::new(0i64);

    let (a, b, c) = (alice.clone(), bob.clone(), charly.clone());
    let transfer_bob_charly = 30;
    let alice_bonus = 40;

    let result = atomically(move || {
        let mut amt_alice = a.read()?;
        let mut amt_bob = b.read()?;
        let mut amt_charly = c.read()?;
        amt_alice += alice_bonus;
        amt_bob -= transfer_bob_charly;
        amt_charly += transfer_bob_charly;

        a.write(amt_alice)?;
        b.write(amt_bob)?;
        c.write(amt_charly)
    });

    assert!(result.is_ok(), "transaction failed");
    assert_eq!(alice.value(), 50);
    assert_eq!(bob.value(), 70);
    assert_eq!(charly.value(), 30);
}

#[test]
fn threaded_inserts_and_read_only_passes_over_a_dictionary() {
    let entries: usize = 1000;
    let distribution = Bernoulli::new(0.7).unwrap();

    let mut expected: HashSet<String> = (0..entries).map(|e| format!("{:04}", e)).collect();
    let dict: Arc<TDict<String, ()>> = Arc::new(TDict::new());
    let pool = ThreadPool::new(8);
    let mut skipped = HashSet::new();

    for value in expected.iter() {
        let dict = dict.clone();
        let value = value.clone();
        let is_read_only = distribution.sample(&mut rand::thread_rng());
        if is_read_only {
            skipped.insert(value.clone());
        }

        pool.execute(move || {
            let outcome = if is_read_only {
                atomically(|| dict.get(&value).map(|_| ()))
            } else {
                atomically(|| dict.insert(value.clone(), ()))
            };
            assert!(outcome.is_ok(), "transaction failed");
        });
    }
    pool.join();

    for value in skipped.iter() {
        expected.remove(value);
    }

    let present: HashSet<String> = atomically(|| dict.keys()).unwrap().into_iter().collect();
    assert_eq!(present, expected, "dictionary contents diverge from the inserted keys");
}

#[test]
fn multiple_readers_single_writer_converge() {
    const EXPECTED: usize = 15;

    let cell = TCell::new(6usize);

    atomically(|| {
        let data = cell.read()?;
        cell.write(data + 9)
    })
    .unwrap();

    for _ in 0..500 {
        atomically(|| {
            let data = cell.read()?;
            assert_eq!(data, EXPECTED);
            Ok(())
        })
        .unwrap();
    }

    assert_eq!(cell.value(), EXPECTED);
}

// Adapted from the high-churn pattern in "Testing patterns for software
// transactional memory engines": a reader repeatedly scans a shared sequence
// while a writer drains it element by element, until nothing is left.
#[test]
fn reader_scans_while_writer_drains_a_sequence() {
    const NB_MSG: usize = 500;
    const MARKER: &str = "in the list";

    let seq: Arc<TSequence<String>> = Arc::new(TSequence::new());
    atomically(|| {
        for _ in 0..NB_MSG {
            seq.append(MARKER.to_string())?;
        }
        Ok(())
    })
    .unwrap();

    let reader_seq = seq.clone();
    let reader = std::thread::spawn(move || loop {
        let is_empty = atomically(|| {
            let items = reader_seq.copy_to()?;
            for item in &items {
                assert_eq!(item, MARKER);
            }
            Ok(items.is_empty())
        })
        .unwrap();
        if is_empty {
            break;
        }
    });

    let writer_seq = seq.clone();
    let writer = std::thread::spawn(move || {
        for _ in 0..NB_MSG {
            atomically(|| writer_seq.take_head().map(|_| ())).unwrap();
        }
    });

    reader.join().unwrap();
    writer.join().unwrap();

    assert_eq!(atomically(|| seq.count()).unwrap(), 0);
}

// High number of transactions on a single cell, to force a lot of
// retry/commit churn.
#[test]
fn high_contention_on_a_single_counter() {
    const NB_THREADS: usize = 16;
    const NB_ITER: usize = 200;

    let counter = Arc::new(TCell::new(0i64));
    let pool = ThreadPool::new(NB_THREADS);

    for _ in 0..NB_THREADS {
        let counter = counter.clone();
        pool.execute(move || {
            for _ in 0..NB_ITER {
                atomically(|| {
                    let v = counter.read()?;
                    counter.write(v + 1)
                })
                .unwrap();
            }
        });
    }
    pool.join();

    assert_eq!(counter.value(), (NB_THREADS * NB_ITER) as i64);
    let snapshot = stats();
    assert!(snapshot.committed >= (NB_THREADS * NB_ITER) as u64);
}

// High number of distinct transactional cells touched by every thread, to
// check that enlistment bookkeeping keyed by object identity does not
// collide across a large working set.
#[test]
fn many_distinct_cells_touched_by_every_thread() {
    const NB_CELLS: usize = 2000;
    const NB_THREADS: usize = 8;

    let cells: Vec<Arc<TCell<i64>>> = (0..NB_CELLS).map(|_| Arc::new(TCell::new(0))).collect();
    let pool = ThreadPool::new(NB_THREADS);

    for _ in 0..NB_THREADS {
        let cells = cells.clone();
        pool.execute(move || {
            atomically(move || {
                for cell in &cells {
                    let v = cell.read()?;
                    cell.write(v + 1)?;
                }
                Ok(())
            })
            .unwrap();
        });
    }
    pool.join();

    for cell in &cells {
        assert_eq!(cell.value(), NB_THREADS as i64);
    }
}

#[test]
fn concurrent_tree_inserts_preserve_count_and_order() {
    let tree: Arc<ShieldedTree<i32, usize>> = Arc::new(ShieldedTree::new());
    let pool = ThreadPool::new(8);
    let next_value = Arc::new(AtomicUsize::new(0));

    for k in 0..200 {
        let tree = tree.clone();
        let next_value = next_value.clone();
        pool.execute(move || {
            let v = next_value.fetch_add(1, Ordering::SeqCst);
            atomically(|| tree.add(k % 20, v)).unwrap();
        });
    }
    pool.join();

    assert_eq!(atomically(|| tree.count()).unwrap(), 200);
    let ascending = atomically(|| tree.enumerate_ascending()).unwrap();
    let keys: Vec<i32> = ascending.iter().map(|(k, _)| *k).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "ascending enumeration must be sorted by key");
}

#[test]
fn nested_atomically_runs_directly_in_the_parent_transaction() {
    let cell = TCell::new(1i64);
    atomically(|| {
        cell.write(2)?;
        // A nested call does not begin a fresh transaction; it must see the
        // write above.
        atomically(|| {
            assert_eq!(cell.read()?, 2);
            cell.write(3)
        })
    })
    .unwrap();
    assert_eq!(cell.value(), 3);
}

#[test]
fn explicit_abort_propagates_without_retrying() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let cell = TCell::new(0i64);
    let attempts_inner = attempts.clone();

    let result = atomically(|| {
        attempts_inner.fetch_add(1, Ordering::SeqCst);
        cell.write(99)?;
        Err(mvcc_stm::abort("deliberate"))
    });

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "abort must not retry");
    assert_eq!(cell.value(), 0, "aborted write must not be published");
}
