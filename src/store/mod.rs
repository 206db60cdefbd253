//! Durable engine storage (SQLite)

pub mod engine_db;

pub use engine_db::*;
