//! Index maintenance and query execution.
//!
//! One document per `(repository, number)`. `index_ticket` upserts the
//! metadata row and the FTS row in a single transaction; `reindex` drops a
//! repository's documents and rebuilds them from materialized models,
//! which makes it idempotent and safe to run while writers keep appending
//! (they re-upsert their own documents afterwards).
//!
//! # BM25 weights
//!
//! | Column  | Weight | Rationale                          |
//! |---------|--------|------------------------------------|
//! | title   | 3.0    | Short, high signal                 |
//! | content | 1.0    | Body and comment text, long tail   |

use crate::query::{IndexQuery, QueryResult, SortBy};
use crate::schema;
use anyhow::{Context, Result};
use chrono::DateTime;
use keel_core::TicketModel;
use rusqlite::{Connection, Row, params};
use std::path::Path;
use std::str::FromStr;

const BM25_WEIGHT_TITLE: f64 = 3.0;
const BM25_WEIGHT_CONTENT: f64 = 1.0;

const RESULT_COLUMNS: &str = "repository, number, title, status, kind, priority, \
                              severity, responsible, milestone, labels, created_at_us";

/// The ticket search index.
pub struct TicketIndexer {
    conn: Connection,
}

impl TicketIndexer {
    /// Open (or create) an index file on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create index directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open ticket index at {}", path.display()))?;
        schema::migrate(&conn).context("migrate ticket index schema")?;
        Ok(Self { conn })
    }

    /// Open an in-memory index (tests, ephemeral deployments).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ticket index")?;
        schema::migrate(&conn).context("migrate ticket index schema")?;
        Ok(Self { conn })
    }

    /// Upsert the document for a materialized ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert transaction fails.
    pub fn index_ticket(&self, ticket: &TicketModel) -> Result<()> {
        let labels = ticket.labels().into_iter().collect::<Vec<_>>().join(" ");
        let refhashes = ticket
            .references()
            .iter()
            .map(|r| r.hash.clone())
            .collect::<Vec<_>>()
            .join(" ");
        let number = i64::try_from(ticket.number).context("ticket number out of range")?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM tickets WHERE repository = ?1 AND number = ?2",
            params![ticket.repository, number],
        )?;
        tx.execute(
            "INSERT INTO tickets (repository, number, title, status, kind, priority, \
             severity, topic, responsible, milestone, labels, mergesha, refhashes, \
             created_at_us, updated_at_us) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                ticket.repository,
                number,
                ticket.title,
                ticket.status.to_string(),
                ticket.kind.to_string(),
                ticket.priority.to_string(),
                ticket.severity.to_string(),
                ticket.topic,
                ticket.responsible,
                ticket.milestone,
                labels,
                ticket.merge_sha,
                refhashes,
                ticket.created_at.timestamp_micros(),
                ticket.updated_at.map(|at| at.timestamp_micros()),
            ],
        )?;
        tx.execute(
            "DELETE FROM tickets_fts WHERE repository = ?1 AND number = ?2",
            params![ticket.repository, number.to_string()],
        )?;
        tx.execute(
            "INSERT INTO tickets_fts (title, content, repository, number) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                ticket.title,
                ticket.to_indexable_string(),
                ticket.repository,
                number.to_string(),
            ],
        )?;
        tx.commit()
            .with_context(|| format!("index {}#{}", ticket.repository, ticket.number))?;
        tracing::debug!(
            repository = %ticket.repository,
            number = ticket.number,
            "indexed ticket"
        );
        Ok(())
    }

    /// Remove one document.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, repo: &str, number: u64) -> Result<()> {
        let number = i64::try_from(number).context("ticket number out of range")?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM tickets WHERE repository = ?1 AND number = ?2",
            params![repo, number],
        )?;
        tx.execute(
            "DELETE FROM tickets_fts WHERE repository = ?1 AND number = ?2",
            params![repo, number.to_string()],
        )?;
        tx.commit().context("delete ticket document")?;
        Ok(())
    }

    /// Remove every document of one repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_repository(&self, repo: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM tickets WHERE repository = ?1", params![repo])?;
        tx.execute(
            "DELETE FROM tickets_fts WHERE repository = ?1",
            params![repo],
        )?;
        tx.commit().context("delete repository documents")?;
        Ok(())
    }

    /// Drop and rebuild one repository's documents from materialized
    /// models. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if any document fails to index.
    pub fn reindex(&self, repo: &str, tickets: &[TicketModel]) -> Result<()> {
        self.delete_repository(repo)?;
        for ticket in tickets {
            self.index_ticket(ticket)?;
        }
        tracing::info!(repository = repo, count = tickets.len(), "reindexed");
        Ok(())
    }

    /// Whether any document exists for the repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn has_tickets(&self, repo: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tickets WHERE repository = ?1",
            params![repo],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Ranked free-text search within one repository.
    ///
    /// `page` is 1-based; a `page_size` of 0 means unbounded.
    ///
    /// # Errors
    ///
    /// Returns an error if the FTS query is malformed or execution fails.
    pub fn search_for(
        &self,
        repo: &str,
        text: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<QueryResult>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let (limit, offset) = page_window(page, page_size);
        let sql = format!(
            "SELECT t.repository, t.number, t.title, t.status, t.kind, t.priority, \
                    t.severity, t.responsible, t.milestone, t.labels, t.created_at_us \
             FROM tickets_fts f \
             INNER JOIN tickets t \
                ON t.repository = f.repository AND t.number = CAST(f.number AS INTEGER) \
             WHERE tickets_fts MATCH ?1 AND f.repository = ?2 \
             ORDER BY bm25(tickets_fts, {BM25_WEIGHT_TITLE}, {BM25_WEIGHT_CONTENT}) \
             LIMIT {limit} OFFSET {offset}"
        );
        let mut stmt = self.conn.prepare(&sql).context("prepare FTS search")?;
        let rows = stmt
            .query_map(params![text, repo], row_to_result)
            .with_context(|| format!("execute FTS search for '{text}'"))?;
        collect(rows)
    }

    /// Structured query, cross-repository unless the query pins one.
    ///
    /// `page` is 1-based; a `page_size` of 0 means unbounded.
    ///
    /// # Errors
    ///
    /// Returns an error if execution fails.
    pub fn query_for(
        &self,
        query: &IndexQuery,
        page: usize,
        page_size: usize,
        sort_by: SortBy,
        descending: bool,
    ) -> Result<Vec<QueryResult>> {
        let (clause, params) = query.to_sql();
        let direction = if descending { "DESC" } else { "ASC" };
        let (limit, offset) = page_window(page, page_size);
        let sql = format!(
            "SELECT {RESULT_COLUMNS} FROM tickets WHERE {clause} \
             ORDER BY {column} {direction}, number ASC \
             LIMIT {limit} OFFSET {offset}",
            column = sort_by.column(),
        );
        let mut stmt = self.conn.prepare(&sql).context("prepare index query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), row_to_result)
            .context("execute index query")?;
        collect(rows)
    }
}

fn page_window(page: usize, page_size: usize) -> (i64, i64) {
    if page_size == 0 {
        return (-1, 0);
    }
    let page = page.max(1);
    let limit = i64::try_from(page_size).unwrap_or(i64::MAX);
    let offset = i64::try_from((page - 1).saturating_mul(page_size)).unwrap_or(i64::MAX);
    (limit, offset)
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<QueryResult> {
    let number: i64 = row.get(1)?;
    let status: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let severity: String = row.get(6)?;
    let labels: String = row.get(9)?;
    let created_at_us: i64 = row.get(10)?;
    Ok(QueryResult {
        repository: row.get(0)?,
        number: number.unsigned_abs(),
        title: row.get(2)?,
        status: FromStr::from_str(&status).unwrap_or_default(),
        kind: FromStr::from_str(&kind).unwrap_or_default(),
        priority: FromStr::from_str(&priority).unwrap_or_default(),
        severity: FromStr::from_str(&severity).unwrap_or_default(),
        responsible: row.get(7)?,
        milestone: row.get(8)?,
        labels: labels.split_whitespace().map(String::from).collect(),
        created_at: DateTime::from_timestamp_micros(created_at_us)
            .unwrap_or(DateTime::UNIX_EPOCH),
    })
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<QueryResult>>,
) -> Result<Vec<QueryResult>> {
    let mut results = Vec::new();
    for row in rows {
        results.push(row.context("read query result row")?);
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
