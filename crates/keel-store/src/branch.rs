//! Embedded-in-VCS backend.
//!
//! Journals live as JSON blobs in a tree committed onto a dedicated,
//! non-working-tree ref (`refs/keel/tickets`) of the repository they
//! describe, so ticket data replicates with ordinary push/pull. All writes
//! funnel through one compare-and-swap on that ref: a lost CAS from an
//! unrelated ticket's write is retried, a lost CAS caused by this ticket's
//! journal advancing surfaces as a version conflict.

use crate::store::{self, TicketStore, journal_path};
use crate::vcs::RefDb;
use keel_core::{Change, Label, Milestone, TicketError, journal};
use std::collections::BTreeMap;

/// Ref name the ticket tree is committed to.
pub const TICKETS_REF: &str = "refs/keel/tickets";

const COUNTER_PATH: &str = "tickets/counter";

/// How many lost CAS rounds (from unrelated writers) to absorb before
/// giving up with a retryable error.
const CAS_ROUNDS: usize = 8;

/// Ticket storage on a dedicated ref of the repository itself.
#[derive(Debug)]
pub struct BranchStore<D> {
    db: D,
}

impl<D: RefDb> BranchStore<D> {
    #[must_use]
    pub const fn new(db: D) -> Self {
        Self { db }
    }

    fn tree(&self, repo: &str) -> Result<(Option<String>, BTreeMap<String, String>), TicketError> {
        let tip = self.db.read_ref(repo, TICKETS_REF)?;
        let tree = match &tip {
            Some(tip) => self.db.read_tree(repo, tip)?,
            None => BTreeMap::new(),
        };
        Ok((tip, tree))
    }

    fn read_journal(
        &self,
        repo: &str,
        tree: &BTreeMap<String, String>,
        number: u64,
    ) -> Result<Option<Vec<Change>>, TicketError> {
        let Some(blob_id) = tree.get(&journal_path(number)) else {
            return Ok(None);
        };
        let content = self.db.get_blob(repo, blob_id)?;
        let text = String::from_utf8(content)
            .map_err(|_| TicketError::CorruptJournal(format!("journal of #{number} is not utf-8")))?;
        Ok(Some(journal::deserialize_journal(&text)?))
    }

    fn read_counter(
        &self,
        repo: &str,
        tree: &BTreeMap<String, String>,
    ) -> Result<u64, TicketError> {
        let Some(blob_id) = tree.get(COUNTER_PATH) else {
            return Ok(0);
        };
        let content = self.db.get_blob(repo, blob_id)?;
        String::from_utf8(content)
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .ok_or_else(|| TicketError::CorruptJournal("bad ticket counter blob".into()))
    }

    /// Run one read-modify-commit round against the tickets ref, retrying
    /// lost CAS races. `modify` sees the current tree and either mutates it
    /// (returning the operation's result) or bails out with an error.
    fn with_tree<T>(
        &self,
        repo: &str,
        message: &str,
        mut modify: impl FnMut(
            &BTreeMap<String, String>,
        ) -> Result<(BTreeMap<String, String>, T), TicketError>,
    ) -> Result<T, TicketError> {
        for _ in 0..CAS_ROUNDS {
            let (tip, tree) = self.tree(repo)?;
            let (new_tree, result) = modify(&tree)?;
            if new_tree == tree {
                return Ok(result);
            }
            let new_tip = self
                .db
                .commit_tree(repo, tip.as_deref(), new_tree, message)?;
            if self
                .db
                .cas_update_ref(repo, TICKETS_REF, tip.as_deref(), &new_tip)?
            {
                return Ok(result);
            }
            tracing::debug!(repo, message, "lost tickets-ref race, retrying");
        }
        Err(TicketError::BackendUnavailable(format!(
            "tickets ref contention in {repo} persisted past {CAS_ROUNDS} rounds"
        )))
    }

    fn write_records<T: serde::Serialize>(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        records: &[T],
    ) -> Result<(), TicketError> {
        let blob = serde_json::to_string_pretty(records)?;
        let blob_id = self.db.put_blob(repo, blob.as_bytes())?;
        self.with_tree(repo, message, |tree| {
            let mut tree = tree.clone();
            tree.insert(path.to_string(), blob_id.clone());
            Ok((tree, ()))
        })
    }

    fn read_records<T: serde::de::DeserializeOwned>(
        &self,
        repo: &str,
        path: &str,
    ) -> Result<Vec<T>, TicketError> {
        let (_, tree) = self.tree(repo)?;
        let Some(blob_id) = tree.get(path) else {
            return Ok(Vec::new());
        };
        let content = self.db.get_blob(repo, blob_id)?;
        let text = String::from_utf8(content)
            .map_err(|_| TicketError::CorruptJournal(format!("records at {path} are not utf-8")))?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl<D: RefDb> TicketStore for BranchStore<D> {
    fn append(
        &self,
        repo: &str,
        number: u64,
        expected_version: u64,
        change: &Change,
    ) -> Result<u64, TicketError> {
        self.with_tree(repo, &format!("append change to #{number}"), |tree| {
            let mut changes = match self.read_journal(repo, tree, number)? {
                Some(changes) => changes,
                None if expected_version == 0 => Vec::new(),
                None => return Err(TicketError::not_found(repo, number)),
            };

            let actual = changes.len() as u64;
            if actual != expected_version {
                return Err(TicketError::VersionConflict {
                    expected: expected_version,
                    actual,
                });
            }

            changes.push(change.clone());
            let blob = journal::serialize_journal(&changes)?;
            let blob_id = self.db.put_blob(repo, blob.as_bytes())?;

            let mut tree = tree.clone();
            tree.insert(journal_path(number), blob_id);
            Ok((tree, changes.len() as u64))
        })
    }

    fn journal(&self, repo: &str, number: u64) -> Result<Vec<Change>, TicketError> {
        let (_, tree) = self.tree(repo)?;
        self.read_journal(repo, &tree, number)?
            .ok_or_else(|| TicketError::not_found(repo, number))
    }

    fn has_ticket(&self, repo: &str, number: u64) -> bool {
        self.tree(repo)
            .is_ok_and(|(_, tree)| tree.contains_key(&journal_path(number)))
    }

    fn ticket_numbers(&self, repo: &str) -> Result<Vec<u64>, TicketError> {
        let (_, tree) = self.tree(repo)?;
        let mut numbers: Vec<u64> = tree
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix("tickets/")?;
                let rest = rest.strip_suffix("/journal.json")?;
                rest.split('/').nth(1)?.parse().ok()
            })
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn assign_number(&self, repo: &str) -> Result<u64, TicketError> {
        self.with_tree(repo, "assign ticket number", |tree| {
            let next = self.read_counter(repo, tree)? + 1;
            let counter_blob = self.db.put_blob(repo, next.to_string().as_bytes())?;
            let journal_blob = self.db.put_blob(repo, b"[]")?;

            let mut tree = tree.clone();
            tree.insert(COUNTER_PATH.to_string(), counter_blob);
            tree.insert(journal_path(next), journal_blob);
            Ok((tree, next))
        })
    }

    fn reserve_number(&self, repo: &str, number: u64) -> Result<(), TicketError> {
        if number == 0 {
            return Err(TicketError::InvalidChange(
                "ticket numbers start at 1".into(),
            ));
        }
        self.with_tree(repo, &format!("reserve ticket #{number}"), |tree| {
            // numbers at or below the counter were allocated before, even
            // if their ticket has since been deleted; never resurrect one
            let current = self.read_counter(repo, tree)?;
            if number <= current || tree.contains_key(&journal_path(number)) {
                return Err(TicketError::InvalidChange(format!(
                    "ticket number {number} was already allocated"
                )));
            }
            let mut tree = tree.clone();
            let counter_blob = self.db.put_blob(repo, number.to_string().as_bytes())?;
            tree.insert(COUNTER_PATH.to_string(), counter_blob);
            let journal_blob = self.db.put_blob(repo, b"[]")?;
            tree.insert(journal_path(number), journal_blob);
            Ok((tree, ()))
        })
    }

    fn delete_ticket(&self, repo: &str, number: u64) -> Result<bool, TicketError> {
        self.with_tree(repo, &format!("delete ticket #{number}"), |tree| {
            let mut tree = tree.clone();
            let existed = tree.remove(&journal_path(number)).is_some();
            Ok((tree, existed))
        })
    }

    fn delete_all(&self, repo: &str) -> Result<(), TicketError> {
        self.with_tree(repo, "delete all tickets", |_| Ok((BTreeMap::new(), ())))
    }

    fn milestones(&self, repo: &str) -> Result<Vec<Milestone>, TicketError> {
        self.read_records(repo, store::MILESTONES_PATH)
    }

    fn put_milestone(&self, repo: &str, milestone: &Milestone) -> Result<(), TicketError> {
        let mut records = self.milestones(repo)?;
        store::upsert_by_name(&mut records, milestone.clone(), |m| &m.name);
        self.write_records(repo, store::MILESTONES_PATH, "update milestones", &records)
    }

    fn remove_milestone(&self, repo: &str, name: &str) -> Result<bool, TicketError> {
        let mut records = self.milestones(repo)?;
        let before = records.len();
        records.retain(|m| m.name != name);
        if records.len() == before {
            return Ok(false);
        }
        self.write_records(repo, store::MILESTONES_PATH, "update milestones", &records)?;
        Ok(true)
    }

    fn labels(&self, repo: &str) -> Result<Vec<Label>, TicketError> {
        self.read_records(repo, store::LABELS_PATH)
    }

    fn put_label(&self, repo: &str, label: &Label) -> Result<(), TicketError> {
        let mut records = self.labels(repo)?;
        store::upsert_by_name(&mut records, label.clone(), |l| &l.name);
        self.write_records(repo, store::LABELS_PATH, "update labels", &records)
    }

    fn remove_label(&self, repo: &str, name: &str) -> Result<bool, TicketError> {
        let mut records = self.labels(repo)?;
        let before = records.len();
        records.retain(|l| l.name != name);
        if records.len() == before {
            return Ok(false);
        }
        self.write_records(repo, store::LABELS_PATH, "update labels", &records)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
