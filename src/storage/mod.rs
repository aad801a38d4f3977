//! Persistent storage for the embedding cache.
//!
//! - SQLite database files holding cache headers and entries
//! - Async-safe database operations via tokio::task::spawn_blocking

mod database;
mod schema;

pub use database::{Database, DatabaseError, Result};
