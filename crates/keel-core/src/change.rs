//! The immutable [`Change`] record and its component parts.
//!
//! A change is one atomic edit appended to a ticket's journal: field
//! updates, an optional comment, attachments, an optional patchset
//! descriptor, and the reference bookkeeping appended by the integrity
//! engine. Changes are never mutated or removed once written — editing or
//! deleting a comment is itself a new change that targets the original
//! comment id, and the materializer folds the journal into an effective
//! view.

use crate::error::TicketError;
use crate::status::{Kind, Priority, Severity, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-process salt so two changes by the same author in the same
/// microsecond still get distinct ids.
static CHANGE_SALT: AtomicU64 = AtomicU64::new(0);

/// The recognized single-valued and list-valued ticket fields.
///
/// Serialized names match the journal format of the wire (`mergeSha`,
/// `mergeTo`). List-valued fields (`labels`, `watchers`, `voters`) carry a
/// comma-separated `+name`/`-name` op list; an empty value clears the set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Title,
    Body,
    Topic,
    Type,
    Status,
    Priority,
    Severity,
    Responsible,
    Labels,
    Milestone,
    MergeSha,
    MergeTo,
    Watchers,
    Voters,
}

impl Field {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Body => "body",
            Self::Topic => "topic",
            Self::Type => "type",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::Severity => "severity",
            Self::Responsible => "responsible",
            Self::Labels => "labels",
            Self::Milestone => "milestone",
            Self::MergeSha => "mergeSha",
            Self::MergeTo => "mergeTo",
            Self::Watchers => "watchers",
            Self::Voters => "voters",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discussion comment carried by a change.
///
/// `id` is stable across edits: a later change carrying the same id
/// revises or deletes the materialized comment without touching the
/// journal entry that introduced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// A file attached by a change. `digest` is the sha256 of the content and
/// doubles as the de-duplication key for client-side retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    pub content: Vec<u8>,
    pub digest: String,
}

impl Attachment {
    /// Build an attachment, computing size and content digest.
    #[must_use]
    pub fn new(name: &str, content: Vec<u8>) -> Self {
        let digest = hex_digest(&[&content]);
        Self {
            name: name.to_string(),
            size: content.len() as u64,
            content,
            digest,
        }
    }
}

/// How a patchset revision came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchsetKind {
    Proposal,
    FastForward,
    Rebase,
    Squash,
    RebaseSquash,
    Amend,
}

/// One physical state of a proposed set of commits.
///
/// `(number, rev)` identifies a revision: a history-rewriting push to the
/// same proposal branch produces `rev + 1` under the same `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patchset {
    pub number: u64,
    pub rev: u64,
    pub tip: String,
    pub base: String,
    #[serde(default)]
    pub insertions: u32,
    #[serde(default)]
    pub deletions: u32,
    #[serde(default)]
    pub total_commits: u32,
    #[serde(default)]
    pub added_commits: u32,
    pub kind: PatchsetKind,
}

impl fmt::Display for Patchset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ps{}r{}", self.number, self.rev)
    }
}

/// A backlink recorded on the ticket that was mentioned.
///
/// `ticket` is the mentioning ticket's number, or `None` when the mention
/// came from a plain commit. `hash` is the commenting change's comment id
/// or the mentioning commit's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub ticket: Option<u64>,
    pub hash: String,
}

/// One atomic, immutable edit in a ticket's journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Stable change id, derived from author, timestamp, and a process salt.
    pub id: String,

    /// Identity that authored the change.
    pub author: String,

    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,

    /// Field updates, last-writer-wins per field at materialization.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<Field, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<Comment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patchset: Option<Patchset>,

    /// A backlink added to this ticket by the reference integrity engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,

    /// Source hashes whose backlinks on this ticket must be dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unreference: Vec<String>,

    /// `(number, rev)` of a patchset revision this change deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_patchset: Option<(u64, u64)>,
}

impl Change {
    /// Create a change stamped with the current time.
    #[must_use]
    pub fn new(author: &str) -> Self {
        Self::at(author, Utc::now())
    }

    /// Create a change with an explicit timestamp.
    #[must_use]
    pub fn at(author: &str, created_at: DateTime<Utc>) -> Self {
        let salt = CHANGE_SALT.fetch_add(1, Ordering::Relaxed);
        let id = hex_digest(&[
            author.as_bytes(),
            created_at.timestamp_micros().to_string().as_bytes(),
            salt.to_string().as_bytes(),
        ]);
        Self {
            id,
            author: author.to_string(),
            created_at,
            fields: BTreeMap::new(),
            comment: None,
            attachments: Vec::new(),
            patchset: None,
            reference: None,
            unreference: Vec::new(),
            delete_patchset: None,
        }
    }

    /// Set (or overwrite) a field value on this change.
    pub fn set_field(&mut self, field: Field, value: impl fmt::Display) -> &mut Self {
        self.fields.insert(field, value.to_string());
        self
    }

    #[must_use]
    pub fn has_field(&self, field: Field) -> bool {
        self.fields
            .get(&field)
            .is_some_and(|value| !value.trim().is_empty())
    }

    #[must_use]
    pub fn field(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    /// Attach a comment, deriving its stable id from this change.
    pub fn comment(&mut self, text: &str) -> &Comment {
        let id = hex_digest(&[
            self.created_at.timestamp_micros().to_string().as_bytes(),
            self.author.as_bytes(),
            text.as_bytes(),
        ]);
        self.comment.insert(Comment {
            id,
            text: text.to_string(),
            deleted: false,
        })
    }

    /// Whether this change carries a live (non-deleted) comment.
    #[must_use]
    pub fn has_comment(&self) -> bool {
        self.comment.as_ref().is_some_and(|c| !c.deleted)
    }

    /// A merge records both a status and the merged commit id.
    #[must_use]
    pub fn is_merge(&self) -> bool {
        self.has_field(Field::Status) && self.has_field(Field::MergeSha)
    }

    #[must_use]
    pub fn is_status_change(&self) -> bool {
        self.has_field(Field::Status)
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn watch(&mut self, username: &str) {
        self.plus_list(Field::Watchers, username);
    }

    pub fn unwatch(&mut self, username: &str) {
        self.minus_list(Field::Watchers, username);
    }

    pub fn vote(&mut self, username: &str) {
        self.plus_list(Field::Voters, username);
    }

    pub fn unvote(&mut self, username: &str) {
        self.minus_list(Field::Voters, username);
    }

    pub fn label(&mut self, label: &str) {
        self.plus_list(Field::Labels, label);
    }

    pub fn unlabel(&mut self, label: &str) {
        self.minus_list(Field::Labels, label);
    }

    fn plus_list(&mut self, field: Field, item: &str) {
        self.mod_list(field, '+', item);
    }

    fn minus_list(&mut self, field: Field, item: &str) {
        self.mod_list(field, '-', item);
    }

    fn mod_list(&mut self, field: Field, prefix: char, item: &str) {
        let op = format!("{prefix}{item}");
        match self.fields.get_mut(&field) {
            Some(existing) if !existing.is_empty() => {
                existing.push(',');
                existing.push_str(&op);
            }
            _ => {
                self.fields.insert(field, op);
            }
        }
    }

    /// Build the reference-add change the integrity engine appends to a
    /// mentioned ticket.
    #[must_use]
    pub fn referenced_by(author: &str, source: Option<u64>, hash: &str) -> Self {
        let mut change = Self::new(author);
        change.reference = Some(Reference {
            ticket: source,
            hash: hash.to_string(),
        });
        change
    }

    /// Build the tombstone change that drops backlinks by source hash.
    #[must_use]
    pub fn unreferenced(author: &str, hashes: Vec<String>) -> Self {
        let mut change = Self::new(author);
        change.unreference = hashes;
        change
    }

    /// Validate the change before it is allowed near a journal.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for an empty author, an enum-typed
    /// field that does not parse, or a malformed patchset descriptor.
    pub fn validate(&self) -> Result<(), TicketError> {
        if self.author.trim().is_empty() {
            return Err(TicketError::InvalidChange("author must be set".into()));
        }

        for (field, value) in &self.fields {
            if value.trim().is_empty() {
                // empty is the clear sentinel for any field
                continue;
            }
            let parsed = match field {
                Field::Type => Kind::from_str(value).err().map(|e| e.to_string()),
                Field::Status => Status::from_str(value).err().map(|e| e.to_string()),
                Field::Priority => Priority::from_str(value).err().map(|e| e.to_string()),
                Field::Severity => Severity::from_str(value).err().map(|e| e.to_string()),
                _ => None,
            };
            if let Some(message) = parsed {
                return Err(TicketError::InvalidChange(message));
            }
        }

        if let Some(ps) = &self.patchset {
            if ps.number == 0 || ps.rev == 0 {
                return Err(TicketError::InvalidChange(
                    "patchset number and rev start at 1".into(),
                ));
            }
            if ps.tip.trim().is_empty() {
                return Err(TicketError::InvalidChange("patchset tip must be set".into()));
            }
        }

        if let Some((number, rev)) = self.delete_patchset {
            if number == 0 || rev == 0 {
                return Err(TicketError::InvalidChange(
                    "patchset deletion must name an existing (number, rev)".into(),
                ));
            }
        }

        Ok(())
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} by {}", self.created_at.to_rfc3339(), self.author)?;
        if let Some(comment) = &self.comment {
            if comment.deleted {
                write!(f, " (deleted comment)")?;
            } else {
                let preview: String = comment.text.chars().take(40).collect();
                write!(f, " - {preview}")?;
            }
        }
        for (field, value) in &self.fields {
            write!(f, "\n  {field}: {value}")?;
        }
        Ok(())
    }
}

fn hex_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
