//! The storage-backend contract.
//!
//! A backend stores, per repository: an append-only journal per ticket, a
//! monotonically increasing ticket counter, and the log-free milestone and
//! label records. The version of a journal is its length; `append` must
//! atomically reject a write whose `expected_version` no longer matches,
//! surfacing [`TicketError::VersionConflict`] instead of overwriting.

use keel_core::{Change, Label, Milestone, TicketError};

/// Common journal path scheme, shared by the branch and file backends:
/// `tickets/<nn>/<number>/journal.json`, where `<nn>` is the two-digit
/// bucket `number % 100` (the same fan-out git uses for loose objects).
#[must_use]
pub fn journal_path(number: u64) -> String {
    format!("tickets/{:02}/{number}/journal.json", number % 100)
}

/// Path of the milestone records document.
pub const MILESTONES_PATH: &str = "tickets/milestones.json";

/// Path of the label records document.
pub const LABELS_PATH: &str = "tickets/labels.json";

/// Strategy-swappable ticket storage.
///
/// Implementations must be safe to share across threads; every mutating
/// method is a compare-and-swap or an idempotent record write.
pub trait TicketStore: Send + Sync {
    /// Append a change to a ticket's journal.
    ///
    /// `expected_version` is the journal length the caller last observed
    /// (0 creates the ticket). Returns the new journal length.
    ///
    /// # Errors
    ///
    /// [`TicketError::VersionConflict`] if the journal advanced past
    /// `expected_version`; [`TicketError::BackendUnavailable`] on I/O or
    /// timeout.
    fn append(
        &self,
        repo: &str,
        number: u64,
        expected_version: u64,
        change: &Change,
    ) -> Result<u64, TicketError>;

    /// The ordered journal of a ticket. Empty for a reserved-but-unwritten
    /// ticket; [`TicketError::NotFound`] if the ticket was never assigned.
    fn journal(&self, repo: &str, number: u64) -> Result<Vec<Change>, TicketError>;

    /// Current journal version (its length).
    fn version(&self, repo: &str, number: u64) -> Result<u64, TicketError> {
        Ok(self.journal(repo, number)?.len() as u64)
    }

    /// Whether the ticket number is assigned in this repository.
    fn has_ticket(&self, repo: &str, number: u64) -> bool;

    /// All assigned ticket numbers, sorted ascending.
    fn ticket_numbers(&self, repo: &str) -> Result<Vec<u64>, TicketError>;

    /// Allocate the next ticket number, starting at 1, strictly increasing,
    /// race-free under concurrent callers.
    fn assign_number(&self, repo: &str) -> Result<u64, TicketError>;

    /// Claim an explicitly chosen ticket number: validate it is unused and
    /// advance the counter past it.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] if the number is 0 or already in use.
    fn reserve_number(&self, repo: &str, number: u64) -> Result<(), TicketError>;

    /// Remove one ticket's journal. Returns whether it existed. Backends
    /// may erase or tombstone; either way the number is never reused.
    fn delete_ticket(&self, repo: &str, number: u64) -> Result<bool, TicketError>;

    /// Remove every ticket, counter, and record for the repository.
    /// Test and teardown only.
    fn delete_all(&self, repo: &str) -> Result<(), TicketError>;

    // -- log-free records ---------------------------------------------------

    fn milestones(&self, repo: &str) -> Result<Vec<Milestone>, TicketError>;

    fn put_milestone(&self, repo: &str, milestone: &Milestone) -> Result<(), TicketError>;

    /// Returns whether the milestone existed.
    fn remove_milestone(&self, repo: &str, name: &str) -> Result<bool, TicketError>;

    fn labels(&self, repo: &str) -> Result<Vec<Label>, TicketError>;

    fn put_label(&self, repo: &str, label: &Label) -> Result<(), TicketError>;

    /// Returns whether the label existed.
    fn remove_label(&self, repo: &str, name: &str) -> Result<bool, TicketError>;
}

/// Upsert a record in a name-keyed list, preserving order.
pub(crate) fn upsert_by_name<T, F>(list: &mut Vec<T>, item: T, name_of: F)
where
    F: Fn(&T) -> &str,
{
    let name = name_of(&item).to_string();
    if let Some(existing) = list.iter_mut().find(|it| name_of(it) == name) {
        *existing = item;
    } else {
        list.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::{journal_path, upsert_by_name};

    #[test]
    fn journal_paths_bucket_by_two_digits() {
        assert_eq!(journal_path(1), "tickets/01/1/journal.json");
        assert_eq!(journal_path(26), "tickets/26/26/journal.json");
        assert_eq!(journal_path(326), "tickets/26/326/journal.json");
        assert_eq!(journal_path(100), "tickets/00/100/journal.json");
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut list = vec![("a", 1), ("b", 2)];
        upsert_by_name(&mut list, ("a", 9), |it| it.0);
        assert_eq!(list, vec![("a", 9), ("b", 2)]);
        upsert_by_name(&mut list, ("c", 3), |it| it.0);
        assert_eq!(list.len(), 3);
    }
}
