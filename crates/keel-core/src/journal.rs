//! Journal (de)serialization.
//!
//! A journal is the ordered JSON array of [`Change`] records for one
//! ticket. Every backend stores the same representation: the branch and
//! file stores keep whole-array blobs, the Redis store keeps one
//! serialized change per list entry.

use crate::change::Change;
use crate::error::TicketError;

/// Serialize a full journal to its canonical JSON array form.
///
/// # Errors
///
/// [`TicketError::CorruptJournal`] if serialization fails (only possible
/// with pathological float/map content, which the model does not carry).
pub fn serialize_journal(changes: &[Change]) -> Result<String, TicketError> {
    Ok(serde_json::to_string_pretty(changes)?)
}

/// Deserialize a journal from its JSON array form.
///
/// An empty or whitespace-only document is an empty journal: the file
/// store touches empty journal files to reserve ticket numbers.
///
/// # Errors
///
/// [`TicketError::CorruptJournal`] on malformed JSON.
pub fn deserialize_journal(json: &str) -> Result<Vec<Change>, TicketError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

/// Serialize a single change (the Redis list-entry form).
///
/// # Errors
///
/// [`TicketError::CorruptJournal`] if serialization fails.
pub fn serialize_change(change: &Change) -> Result<String, TicketError> {
    Ok(serde_json::to_string(change)?)
}

/// Deserialize a single change.
///
/// # Errors
///
/// [`TicketError::CorruptJournal`] on malformed JSON.
pub fn deserialize_change(json: &str) -> Result<Change, TicketError> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Field;
    use crate::status::Kind;

    fn sample_journal() -> Vec<Change> {
        let mut first = Change::new("alice");
        first
            .set_field(Field::Title, "Sample")
            .set_field(Field::Type, Kind::Bug);
        first.comment("created");

        let mut second = Change::new("bob");
        second.set_field(Field::Responsible, "bob");

        vec![first, second]
    }

    #[test]
    fn journal_roundtrip_preserves_order_and_content() {
        let journal = sample_journal();
        let json = serialize_journal(&journal).unwrap();
        let back = deserialize_journal(&json).unwrap();
        assert_eq!(journal, back);
    }

    #[test]
    fn empty_document_is_empty_journal() {
        assert!(deserialize_journal("").unwrap().is_empty());
        assert!(deserialize_journal("  \n").unwrap().is_empty());
        assert!(deserialize_journal("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_document_is_corrupt() {
        let err = deserialize_journal("[{not json").unwrap_err();
        assert!(matches!(err, TicketError::CorruptJournal(_)));
    }

    #[test]
    fn single_change_roundtrip() {
        let journal = sample_journal();
        let json = serialize_change(&journal[0]).unwrap();
        assert_eq!(journal[0], deserialize_change(&json).unwrap());
    }
}
