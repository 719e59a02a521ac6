//! # CorvusDB engine
//!
//! The storage and transaction core of CorvusDB: a versioned in-memory
//! tuple store, a pluggable transaction manager (optimistic snapshot or
//! strict two-phase locking), a catalog, and a small plan/execute pipeline
//! fronted by the traffic cop.
//!
//! The wire protocol lives in `corvus-server`; this crate knows nothing
//! about sockets or packets.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use corvus_core::catalog::Catalog;
//! use corvus_core::storage::TupleStore;
//! use corvus_core::tcop::TrafficCop;
//! use corvus_core::txn::TransactionManager;
//! use corvus_core::types::CcConfig;
//!
//! let catalog = Arc::new(Catalog::new());
//! let store = Arc::new(TupleStore::new());
//! let tm = Arc::new(TransactionManager::new(&CcConfig::default(), Arc::clone(&store)));
//! let tcop = TrafficCop::new(catalog, store, tm);
//!
//! let mut txn = None;
//! tcop.portal_exec(&mut txn, "CREATE TABLE t (a int)").unwrap();
//! tcop.portal_exec(&mut txn, "INSERT INTO t VALUES (7)").unwrap();
//! let outcome = tcop.portal_exec(&mut txn, "SELECT a FROM t").unwrap();
//! assert_eq!(outcome.rows_affected, 1);
//! ```

pub mod catalog;
pub mod error;
pub mod executor;
pub mod plan;
pub mod planner;
pub mod storage;
pub mod tcop;
pub mod txn;
pub mod types;
pub mod value;
