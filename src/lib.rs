//! # MVCC Software Transactional Memory
//!
//! A software transactional memory runtime for in-process shared state.
//! Application code groups reads and writes to transactional cells inside
//! [`atomically`] blocks; the runtime provides serializable snapshot
//! isolation through multi-version concurrency control, optimistic
//! validation, and automatic retry on conflict.
//!
//! ```
//! use mvcc_stm::{atomically, TCell};
//!
//! let balance = TCell::new(100i64);
//! let other = balance.clone();
//!
//! atomically(|| {
//!     let current = other.read()?;
//!     other.write(current - 10)
//! })
//! .unwrap();
//!
//! assert_eq!(balance.value(), 90);
//! ```
//!
//! Four transactional containers are built on top of the same cell
//! primitive and commit protocol: [`TCell`] (a single versioned value),
//! [`TDict`] (a key-value map), [`TSequence`] (an ordered list with
//! commutative append), and [`ShieldedTree`] (an ordered multimap).
#![allow(clippy::type_complexity)]

mod commit_list;
mod context;
mod runtime;
mod stamp;
mod subscription;
mod transactable;
mod version;

pub mod cell;
pub mod continuation;
pub mod dict;
pub mod errors;
pub mod sequence;
pub mod tree;

pub use cell::TCell;
pub use context::{abort, atomically, pre_commit, retry, side_effect, ChangeSet, TxnId};
pub use continuation::{run_to_commit, Continuation, Timeout};
pub use dict::TDict;
pub use errors::{Result, StmError};
pub use runtime::{configure, stats, RuntimeConfig, RuntimeStats};
pub use sequence::TSequence;
pub use subscription::{conditional, when_committing};
pub use tree::ShieldedTree;
