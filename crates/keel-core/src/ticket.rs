//! The materialized ticket view and the pure fold that builds it.
//!
//! A ticket is never stored as a mutable row. [`materialize`] replays the
//! ordered journal of [`Change`] records into a [`TicketModel`]: each
//! field set by a change overwrites the prior value, list fields fold
//! their `+`/`-` ops, comment edits revise the materialized comment in
//! place, and reference/patchset tombstones cancel earlier entries.
//!
//! The fold is deterministic and total over any journal, including an
//! empty one (no ticket), which is what makes storage migration and index
//! rebuilds safe: two identical journals always materialize field-equal
//! models.

use crate::change::{Attachment, Change, Field, Patchset, Reference};
use crate::status::{Kind, Priority, Severity, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Derived, read-only view of one ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketModel {
    pub repository: String,
    pub number: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub title: String,
    pub body: Option<String>,
    pub topic: Option<String>,
    pub kind: Kind,
    pub status: Status,
    pub priority: Priority,
    pub severity: Severity,
    pub responsible: Option<String>,
    pub milestone: Option<String>,
    pub merge_sha: Option<String>,
    pub merge_to: Option<String>,
    /// The effective journal: comment edits folded in, deleted comments
    /// stripped. Exposed for audit and history UIs.
    pub changes: Vec<Change>,
}

/// Replay a journal into a ticket model. An empty journal is no ticket.
#[must_use]
pub fn materialize(repository: &str, number: u64, changes: &[Change]) -> Option<TicketModel> {
    if changes.is_empty() {
        return None;
    }
    let mut ticket = TicketModel::empty(repository, number);
    for change in changes {
        ticket.apply(change);
    }
    Some(ticket)
}

impl TicketModel {
    fn empty(repository: &str, number: u64) -> Self {
        Self {
            repository: repository.to_string(),
            number,
            created_by: String::new(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: None,
            updated_by: None,
            title: String::new(),
            body: None,
            topic: None,
            kind: Kind::default(),
            status: Status::default(),
            priority: Priority::default(),
            severity: Severity::default(),
            responsible: None,
            milestone: None,
            merge_sha: None,
            merge_to: None,
            changes: Vec::new(),
        }
    }

    /// Apply one change to this model.
    ///
    /// Replaying a prefix of a journal and then the remaining suffix
    /// through this method yields the same model as replaying the whole
    /// journal at once.
    pub fn apply(&mut self, change: &Change) {
        // A change targeting an existing comment id revises the
        // materialized comment in place and is otherwise swallowed.
        if let Some(comment) = &change.comment {
            let target = self.changes.iter_mut().find(|c| {
                c.comment
                    .as_ref()
                    .is_some_and(|existing| existing.id == comment.id)
            });
            if let Some(existing) = target {
                if let Some(ec) = &mut existing.comment {
                    ec.text = comment.text.clone();
                    ec.deleted = comment.deleted;
                }
                if !existing.has_comment() {
                    existing.comment = None;
                }
                self.updated_at = Some(change.created_at);
                self.updated_by = Some(change.author.clone());
                return;
            }
        }

        if self.changes.is_empty() {
            // the first change created the ticket
            self.created_at = change.created_at;
            self.created_by = change.author.clone();
            self.status = Status::New;
        } else {
            self.updated_at = Some(change.created_at);
            self.updated_by = Some(change.author.clone());
        }

        if change.is_merge() {
            if self.responsible.as_deref().unwrap_or("").is_empty() {
                self.responsible = Some(change.author.clone());
            }
            self.status = Status::Merged;
        }

        for (field, value) in &change.fields {
            self.apply_field(*field, value);
        }

        let mut effective = change.clone();
        if effective.comment.as_ref().is_some_and(|c| c.deleted) {
            effective.comment = None;
        }
        self.changes.push(effective);
    }

    fn apply_field(&mut self, field: Field, value: &str) {
        fn non_empty(value: &str) -> Option<String> {
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }

        match field {
            Field::Title => self.title = value.to_string(),
            Field::Body => self.body = non_empty(value),
            Field::Topic => self.topic = non_empty(value),
            Field::Type => {
                if let Ok(kind) = Kind::from_str(value) {
                    self.kind = kind;
                }
            }
            Field::Status => {
                if let Ok(status) = Status::from_str(value) {
                    self.status = status;
                }
            }
            Field::Priority => {
                if let Ok(priority) = Priority::from_str(value) {
                    self.priority = priority;
                }
            }
            Field::Severity => {
                if let Ok(severity) = Severity::from_str(value) {
                    self.severity = severity;
                }
            }
            Field::Responsible => self.responsible = non_empty(value),
            Field::Milestone => self.milestone = non_empty(value),
            Field::MergeSha => self.merge_sha = non_empty(value),
            Field::MergeTo => self.merge_to = non_empty(value),
            // list fields are derived on demand from the journal
            Field::Labels | Field::Watchers | Field::Voters => {}
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        !self.status.is_closed()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.is_closed() && self.merge_sha.is_some()
    }

    #[must_use]
    pub fn is_proposal(&self) -> bool {
        self.kind == Kind::Proposal
    }

    #[must_use]
    pub fn is_bug(&self) -> bool {
        self.kind == Kind::Bug
    }

    #[must_use]
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    #[must_use]
    pub fn is_author(&self, username: &str) -> bool {
        self.created_by == username
    }

    #[must_use]
    pub fn is_responsible(&self, username: &str) -> bool {
        self.responsible.as_deref() == Some(username)
    }

    // -- list fields --------------------------------------------------------

    fn get_list(&self, field: Field) -> BTreeSet<String> {
        let mut set = BTreeSet::new();
        for change in &self.changes {
            let Some(value) = change.field(field) else {
                continue;
            };
            if value.trim().is_empty() {
                set.clear();
                continue;
            }
            for op in value.split(',') {
                if let Some(name) = op.strip_prefix('+') {
                    set.insert(name.to_string());
                } else if let Some(name) = op.strip_prefix('-') {
                    set.remove(name);
                } else {
                    set.insert(op.to_string());
                }
            }
        }
        set
    }

    #[must_use]
    pub fn labels(&self) -> BTreeSet<String> {
        self.get_list(Field::Labels)
    }

    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels().contains(label)
    }

    #[must_use]
    pub fn watchers(&self) -> BTreeSet<String> {
        self.get_list(Field::Watchers)
    }

    #[must_use]
    pub fn is_watching(&self, username: &str) -> bool {
        self.watchers().contains(username)
    }

    #[must_use]
    pub fn voters(&self) -> BTreeSet<String> {
        self.get_list(Field::Voters)
    }

    #[must_use]
    pub fn is_voter(&self, username: &str) -> bool {
        self.voters().contains(username)
    }

    // -- comments and participants -----------------------------------------

    /// The changes carrying live comments, in journal order.
    #[must_use]
    pub fn comments(&self) -> Vec<&Change> {
        self.changes.iter().filter(|c| c.has_comment()).collect()
    }

    /// Everyone who authored a change, plus the responsible user.
    #[must_use]
    pub fn participants(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for change in &self.changes {
            if !seen.contains(&change.author) {
                seen.push(change.author.clone());
            }
        }
        if let Some(responsible) = &self.responsible {
            if !responsible.is_empty() && !seen.contains(responsible) {
                seen.push(responsible.clone());
            }
        }
        seen
    }

    /// A discussion needs a commenter other than the ticket creator.
    #[must_use]
    pub fn has_discussion(&self) -> bool {
        self.comments()
            .iter()
            .any(|change| change.author != self.created_by)
    }

    // -- attachments --------------------------------------------------------

    #[must_use]
    pub fn attachments(&self) -> Vec<&Attachment> {
        self.changes
            .iter()
            .flat_map(|c| c.attachments.iter())
            .collect()
    }

    #[must_use]
    pub fn has_attachments(&self) -> bool {
        self.changes.iter().any(|c| !c.attachments.is_empty())
    }

    /// Latest attachment with the given name, case-insensitive.
    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.changes
            .iter()
            .flat_map(|c| c.attachments.iter())
            .filter(|a| a.name.eq_ignore_ascii_case(name))
            .next_back()
    }

    // -- patchsets ----------------------------------------------------------

    /// All live patchset revisions, in journal order. Revisions with a
    /// later deletion tombstone are folded out.
    #[must_use]
    pub fn patchsets(&self) -> Vec<&Patchset> {
        let deleted: BTreeSet<(u64, u64)> = self
            .changes
            .iter()
            .filter_map(|c| c.delete_patchset)
            .collect();
        self.changes
            .iter()
            .filter_map(|c| c.patchset.as_ref())
            .filter(|ps| !deleted.contains(&(ps.number, ps.rev)))
            .collect()
    }

    #[must_use]
    pub fn has_patchsets(&self) -> bool {
        !self.patchsets().is_empty()
    }

    #[must_use]
    pub fn patchset(&self, number: u64, rev: u64) -> Option<&Patchset> {
        self.patchsets()
            .into_iter()
            .find(|ps| ps.number == number && ps.rev == rev)
    }

    /// The highest `(number, rev)` revision still live.
    #[must_use]
    pub fn current_patchset(&self) -> Option<&Patchset> {
        self.patchsets()
            .into_iter()
            .max_by_key(|ps| (ps.number, ps.rev))
    }

    // -- references ---------------------------------------------------------

    /// Live backlinks in the order they were recorded. Unreference
    /// tombstones cancel every earlier reference with a matching hash.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut live: Vec<&Reference> = Vec::new();
        for change in &self.changes {
            if !change.unreference.is_empty() {
                live.retain(|r| !change.unreference.contains(&r.hash));
            }
            if let Some(reference) = &change.reference {
                live.push(reference);
            }
        }
        live
    }

    #[must_use]
    pub fn has_references(&self) -> bool {
        !self.references().is_empty()
    }

    // -- search -------------------------------------------------------------

    /// Free text fed to the search index: title, body, live comments.
    #[must_use]
    pub fn to_indexable_string(&self) -> String {
        let mut out = String::new();
        if !self.title.is_empty() {
            out.push_str(&self.title);
            out.push('\n');
        }
        if let Some(body) = &self.body {
            out.push_str(body);
            out.push('\n');
        }
        for change in self.comments() {
            if let Some(comment) = &change.comment {
                out.push_str(&comment.text);
                out.push('\n');
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
