//! Sluice Storage - SQLite persistence layer.
//!
//! Stores the latest snapshot of every non-ignored session, keyed by
//! session id.
//!
//! # Example
//!
//! ```no_run
//! use sluice_core::Session;
//! use sluice_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! let session = Session::new();
//! db.save_session(&session).unwrap();
//! assert_eq!(db.count_sessions().unwrap(), 1);
//! ```

mod database;
pub mod error;
mod pool;
pub mod repository;
mod schema;

pub use database::{Database, DB_FILE};
pub use error::{Result, StorageError};
pub use pool::ConnectionPool;
pub use repository::SessionsRepo;
