//! `SQLite` persistence for the standalone binary's session store.

pub mod db;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
