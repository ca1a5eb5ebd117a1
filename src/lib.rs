//! # docudb
//!
//! Embedded, single-node document database engine: ACID transactions with
//! MVCC snapshot isolation, crash recovery through a group-committed
//! write-ahead log, B+Tree primary and secondary indexes over an 8 KiB
//! paged store with segmented-LRU caching and optional AES-256-GCM
//! encryption at rest, and a durable JSON system catalog.
//!
//! The crate is consumed as a library by higher-level collaborators (REST
//! servers, administrative CLIs); everything network- or policy-shaped
//! lives outside.
//!
//! ```no_run
//! use docudb::{Database, IsolationLevel, Options};
//! use serde_json::json;
//!
//! # fn main() -> docudb::Result<()> {
//! let db = Database::open(Options::new("/tmp/mydb"))?;
//! let users = db.create_collection("users")?;
//!
//! let txn = db.begin_transaction(IsolationLevel::ReadCommitted)?;
//! users.insert(&txn, json!({"_id": "u1", "name": "Alice"}).as_object().unwrap().clone())?;
//! let alice = users.find_by_id(&txn, "u1")?;
//! db.commit_transaction(&txn)?;
//! # db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod catalog;
pub mod collection;
pub mod common;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod mvcc;
pub mod storage;
pub mod transaction;
pub mod wal;

pub use collection::query::{FindOptions, SortOrder};
pub use collection::Collection;
pub use database::{Database, Options};
pub use document::Document;
pub use error::{DbError, Result};
pub use transaction::{IsolationLevel, Txn, TxnState};
