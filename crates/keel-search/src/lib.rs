//! keel-search library.
//!
//! Maintains the secondary full-text index over materialized tickets. One
//! document per `(repository, number)`, upserted after every write and
//! rebuildable wholesale from the change log via the materializer. Queries
//! are served from an SQLite FTS5 table with BM25 ranking plus a metadata
//! table for structured filters.

pub mod indexer;
pub mod query;
pub mod schema;

pub use indexer::TicketIndexer;
pub use query::{IndexQuery, QueryResult, SortBy};
