//! SQLite schema for the ticket index.
//!
//! - `tickets` keeps one metadata row per `(repository, number)` for
//!   structured queries and sorting
//! - `tickets_fts` is the FTS5 side: weighted free text (title vs. the
//!   body-and-comments blob), porter stemming, prefix indexes
//!
//! The two are kept in step manually by the indexer: a document upsert
//! always replaces both rows in the same transaction.

/// Metadata table and read-path indexes.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tickets (
    repository TEXT NOT NULL,
    number INTEGER NOT NULL CHECK (number > 0),
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    kind TEXT NOT NULL,
    priority TEXT NOT NULL,
    severity TEXT NOT NULL,
    topic TEXT,
    responsible TEXT,
    milestone TEXT,
    labels TEXT NOT NULL DEFAULT '',
    mergesha TEXT,
    refhashes TEXT NOT NULL DEFAULT '',
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER,
    PRIMARY KEY (repository, number)
);

CREATE INDEX IF NOT EXISTS idx_tickets_repo_status
    ON tickets(repository, status);

CREATE INDEX IF NOT EXISTS idx_tickets_repo_milestone
    ON tickets(repository, milestone);

CREATE INDEX IF NOT EXISTS idx_tickets_created
    ON tickets(created_at_us DESC);
";

/// FTS5 table: searchable text plus unindexed join keys.
pub const FTS_SQL: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS tickets_fts USING fts5(
    title,
    content,
    repository UNINDEXED,
    number UNINDEXED,
    tokenize='porter unicode61',
    prefix='2 3'
);
";

/// Apply the full schema to a connection.
///
/// # Errors
///
/// Returns the underlying SQLite error if DDL fails.
pub fn migrate(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(FTS_SQL)?;
    Ok(())
}
