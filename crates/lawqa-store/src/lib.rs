//! lawqa-store - Passage store backends
//!
//! This crate provides the two `PassageStore` implementations: a persistent
//! SQLite store (FTS5 `bm25()` for lexical search, exact cosine scan for
//! dense search) and an in-memory store with Okapi BM25.

mod memory;
mod schema;
mod sqlite;
mod vector;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use vector::cosine_similarity;

// Re-export schema for testing/migrations
pub use schema::{SCHEMA, SCHEMA_VERSION};
