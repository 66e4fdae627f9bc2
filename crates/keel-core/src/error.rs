//! Error taxonomy shared by the store backends, the facade, and the index.
//!
//! Four conditions cover every failure a caller can observe:
//!
//! - [`TicketError::NotFound`] — unknown ticket/milestone/label; returned,
//!   never fatal.
//! - [`TicketError::VersionConflict`] — a concurrent writer advanced the
//!   journal between read and append. Retryable.
//! - [`TicketError::BackendUnavailable`] — storage or remote-service
//!   timeout. Retryable; the journal is never left corrupted.
//! - [`TicketError::InvalidChange`] — the change was rejected before
//!   append; the journal is untouched.
//!
//! [`TicketError::CorruptJournal`] exists for the read path: a journal that
//! no longer deserializes is an operator problem, not a caller retry case.

/// Engine-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    /// The ticket, milestone, or label does not exist.
    #[error("{repository}#{number} not found")]
    NotFound { repository: String, number: u64 },

    /// The journal advanced past the caller's expected version.
    #[error("version conflict: expected journal at {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// The backend could not be reached or timed out.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The change was rejected before it reached the journal.
    #[error("invalid change: {0}")]
    InvalidChange(String),

    /// A stored journal failed to deserialize.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),
}

impl TicketError {
    /// Whether a caller may safely retry the failed operation as-is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::BackendUnavailable(_)
        )
    }

    /// Shorthand for a [`Self::NotFound`] value.
    #[must_use]
    pub fn not_found(repository: &str, number: u64) -> Self {
        Self::NotFound {
            repository: repository.to_string(),
            number,
        }
    }
}

impl From<serde_json::Error> for TicketError {
    fn from(err: serde_json::Error) -> Self {
        Self::CorruptJournal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::TicketError;

    #[test]
    fn retryable_classification() {
        assert!(TicketError::VersionConflict {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(TicketError::BackendUnavailable("timeout".into()).is_retryable());
        assert!(!TicketError::not_found("repo.git", 7).is_retryable());
        assert!(!TicketError::InvalidChange("no title".into()).is_retryable());
    }

    #[test]
    fn display_carries_versions() {
        let err = TicketError::VersionConflict {
            expected: 3,
            actual: 5,
        };
        let text = err.to_string();
        assert!(text.contains('3'));
        assert!(text.contains('5'));
    }
}
