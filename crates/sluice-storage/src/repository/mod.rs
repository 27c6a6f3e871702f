//! Database repositories for each table.

pub mod sessions;

pub use sessions::SessionsRepo;
