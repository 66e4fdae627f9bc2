//! Structured queries against the ticket index.
//!
//! [`IndexQuery`] is a conjunction of optional filters compiled to SQL by
//! the indexer; leaving `repository` unset makes the query
//! cross-repository. Sorting is restricted to a fixed column whitelist so
//! callers can never smuggle SQL through a sort-field name.

use chrono::{DateTime, Utc};
use keel_core::{Kind, Priority, Severity, Status};

/// A ranked or sorted query hit. Carries enough of the document to render
/// result lists without materializing the ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub repository: String,
    pub number: u64,
    pub title: String,
    pub status: Status,
    pub kind: Kind,
    pub priority: Priority,
    pub severity: Severity,
    pub responsible: Option<String>,
    pub milestone: Option<String>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Columns a caller may sort by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Number,
    Created,
    Updated,
    Title,
    Status,
    Priority,
    Severity,
}

impl SortBy {
    /// The whitelisted column expression for this sort.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Created => "created_at_us",
            Self::Updated => "updated_at_us",
            Self::Title => "title",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::Severity => "severity",
        }
    }
}

/// Conjunctive filter set over the metadata table.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub repository: Option<String>,
    pub status: Option<Status>,
    pub kind: Option<Kind>,
    pub priority: Option<Priority>,
    pub severity: Option<Severity>,
    pub milestone: Option<String>,
    pub label: Option<String>,
    pub responsible: Option<String>,
}

impl IndexQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn repository(mut self, repository: &str) -> Self {
        self.repository = Some(repository.to_string());
        self
    }

    #[must_use]
    pub const fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub const fn kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub const fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    #[must_use]
    pub fn milestone(mut self, milestone: &str) -> Self {
        self.milestone = Some(milestone.to_string());
        self
    }

    #[must_use]
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    #[must_use]
    pub fn responsible(mut self, responsible: &str) -> Self {
        self.responsible = Some(responsible.to_string());
        self
    }

    /// Compile to a WHERE clause and its parameters.
    pub(crate) fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(repository) = &self.repository {
            clauses.push("repository = ?");
            params.push(repository.clone());
        }
        if let Some(status) = self.status {
            clauses.push("status = ?");
            params.push(status.to_string());
        }
        if let Some(kind) = self.kind {
            clauses.push("kind = ?");
            params.push(kind.to_string());
        }
        if let Some(priority) = self.priority {
            clauses.push("priority = ?");
            params.push(priority.to_string());
        }
        if let Some(severity) = self.severity {
            clauses.push("severity = ?");
            params.push(severity.to_string());
        }
        if let Some(milestone) = &self.milestone {
            clauses.push("milestone = ?");
            params.push(milestone.clone());
        }
        if let Some(label) = &self.label {
            clauses.push("' ' || labels || ' ' LIKE '% ' || ? || ' %'");
            params.push(label.clone());
        }
        if let Some(responsible) = &self.responsible {
            clauses.push("responsible = ?");
            params.push(responsible.clone());
        }

        let where_clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (where_clause, params)
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexQuery, SortBy};
    use keel_core::{Priority, Status};

    #[test]
    fn empty_query_matches_everything() {
        let (clause, params) = IndexQuery::new().to_sql();
        assert_eq!(clause, "1 = 1");
        assert!(params.is_empty());
    }

    #[test]
    fn filters_conjoin_in_order() {
        let (clause, params) = IndexQuery::new()
            .repository("r.git")
            .status(Status::New)
            .priority(Priority::High)
            .label("helpdesk")
            .to_sql();
        assert!(clause.contains("repository = ?"));
        assert!(clause.contains("status = ?"));
        assert!(clause.contains("priority = ?"));
        assert!(clause.contains("labels"));
        assert_eq!(clause.matches(" AND ").count(), 3);
        assert_eq!(params, vec!["r.git", "new", "high", "helpdesk"]);
    }

    #[test]
    fn sort_columns_are_whitelisted() {
        assert_eq!(SortBy::Created.column(), "created_at_us");
        assert_eq!(SortBy::Number.column(), "number");
    }
}
