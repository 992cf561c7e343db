//! Persistence layer modules.

pub mod artifact_repo;
pub mod checkpoint_repo;
pub mod db;
pub mod merge;
pub mod retention;
pub mod schema;
pub mod trace_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
