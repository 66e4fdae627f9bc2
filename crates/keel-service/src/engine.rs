//! The reference integrity engine.
//!
//! Keeps every ticket's backlink set equal to the set of currently
//! reachable mentions of it. Comment mentions are applied as the comment
//! is written; commit mentions are reconciled against a before/after
//! reachability diff on every push, force-push, and branch deletion.
//! Reachability itself is delegated to the [`ReachabilityOracle`]; the
//! engine only decides which references to add or drop.
//!
//! A reconciliation that fails (oracle or backend unavailable) never fails
//! the triggering push: the event is parked on a retry queue and replayed
//! by [`TicketService::retry_pending`]. Every step is idempotent, so a
//! partially applied event can be replayed safely.
//!
//! [`ReachabilityOracle`]: crate::oracle::ReachabilityOracle

use crate::service::TicketService;
use keel_core::{
    Change, Comment, Field, Patchset, PatchsetKind, Status, TicketError, TicketModel,
    extract_mentions,
};
use std::collections::BTreeSet;

/// A parked reconciliation event awaiting retry.
#[derive(Debug, Clone)]
pub(crate) enum Reconciliation {
    Push {
        repo: String,
        branch: String,
        old_tip: Option<String>,
        new_tip: String,
        pusher: String,
    },
    BranchDelete {
        repo: String,
        branch: String,
        old_tip: String,
        actor: String,
    },
    CommentRefs {
        repo: String,
        source: u64,
        comment_id: String,
        text: String,
        author: String,
    },
}

impl Reconciliation {
    fn describe(&self) -> String {
        match self {
            Self::Push { repo, branch, .. } => format!("push to {repo}:{branch}"),
            Self::BranchDelete { repo, branch, .. } => {
                format!("deletion of {repo}:{branch}")
            }
            Self::CommentRefs { repo, source, .. } => {
                format!("comment on {repo}#{source}")
            }
        }
    }
}

/// The ticket number owning a `ticket/N` branch, if the name matches.
fn ticket_branch_owner(branch: &str) -> Option<u64> {
    let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
    short
        .strip_prefix("ticket/")?
        .parse::<u64>()
        .ok()
        .filter(|number| *number > 0)
}

/// Retention ref pinning one patchset revision's tip, so rewriting the
/// proposal branch does not orphan the revision's commits.
fn patchset_ref(ticket: u64, number: u64, rev: u64) -> String {
    format!("refs/keel/patchsets/{ticket}/{number}/{rev}")
}

impl TicketService {
    /// Reconcile references and the patchset lifecycle after a branch
    /// update. `old_tip` is `None` for a newly created branch. The oracle
    /// must already reflect the post-push ref state.
    ///
    /// The push itself is never failed: a reconciliation error is logged
    /// and parked for [`Self::retry_pending`].
    pub fn on_push(
        &self,
        repo: &str,
        branch: &str,
        old_tip: Option<&str>,
        new_tip: &str,
        pusher: &str,
    ) {
        self.apply_or_park(Reconciliation::Push {
            repo: repo.to_string(),
            branch: branch.to_string(),
            old_tip: old_tip.map(String::from),
            new_tip: new_tip.to_string(),
            pusher: pusher.to_string(),
        });
    }

    /// Reconcile references after a branch deletion. The oracle must
    /// already have dropped the ref; commits still retained by another
    /// ref keep their references.
    pub fn on_branch_deleted(&self, repo: &str, branch: &str, old_tip: &str, actor: &str) {
        self.apply_or_park(Reconciliation::BranchDelete {
            repo: repo.to_string(),
            branch: branch.to_string(),
            old_tip: old_tip.to_string(),
            actor: actor.to_string(),
        });
    }

    /// Record comment mentions against their target tickets.
    pub(crate) fn note_comment(&self, repo: &str, source: u64, comment: &Comment, author: &str) {
        if extract_mentions(&comment.text).is_empty() {
            return;
        }
        self.apply_or_park(Reconciliation::CommentRefs {
            repo: repo.to_string(),
            source,
            comment_id: comment.id.clone(),
            text: comment.text.clone(),
            author: author.to_string(),
        });
    }

    /// Delete one patchset revision: the revision disappears from the
    /// materialized ticket, and references sourced from commits that are
    /// no longer reachable anywhere are dropped. Returns false when the
    /// revision does not exist.
    ///
    /// # Errors
    ///
    /// Backend or oracle failures; the journal is never left corrupted.
    pub fn delete_patchset(
        &self,
        repo: &str,
        number: u64,
        ps_number: u64,
        rev: u64,
        deleted_by: &str,
    ) -> Result<bool, TicketError> {
        let Some(ticket) = self.get_ticket(repo, number)? else {
            return Ok(false);
        };
        let Some(patchset) = ticket.patchset(ps_number, rev) else {
            return Ok(false);
        };
        let tip = patchset.tip.clone();

        let retention = patchset_ref(number, ps_number, rev);
        let current = self.graph.read_ref(repo, &retention)?;
        if current.is_some() {
            self.graph
                .cas_update_ref(repo, &retention, current.as_deref(), None)?;
        }

        let mut change = Change::new(deleted_by);
        change.delete_patchset = Some((ps_number, rev));
        self.append_with_retry(repo, number, &change)?;

        let retained = self.retained_commits(repo, None)?;
        let orphaned: Vec<String> = self
            .graph
            .reachable_commits(repo, &tip)?
            .into_iter()
            .filter(|sha| !retained.contains(sha))
            .collect();
        if !orphaned.is_empty() {
            self.drop_references(repo, &orphaned, deleted_by)?;
        }

        self.refresh_index(&self.materialized(repo, number)?);
        tracing::info!(repo, number, ps_number, rev, deleted_by, "deleted patchset revision");
        Ok(true)
    }

    /// Parked reconciliations awaiting retry.
    #[must_use]
    pub fn pending_reconciliations(&self) -> usize {
        self.pending.lock().map_or(0, |pending| pending.len())
    }

    /// Replay every parked reconciliation, returning how many succeeded.
    /// Failures are parked again.
    pub fn retry_pending(&self) -> usize {
        let drained: Vec<Reconciliation> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return 0,
        };
        let mut applied = 0;
        for event in drained {
            match self.reconcile(&event) {
                Ok(()) => applied += 1,
                Err(err) => {
                    tracing::warn!(%err, event = %event.describe(), "reconciliation retry failed");
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.push(event);
                    }
                }
            }
        }
        applied
    }

    fn apply_or_park(&self, event: Reconciliation) {
        if let Err(err) = self.reconcile(&event) {
            tracing::warn!(
                %err,
                event = %event.describe(),
                "reference reconciliation failed, parked for retry"
            );
            if let Ok(mut pending) = self.pending.lock() {
                pending.push(event);
            }
        }
    }

    fn reconcile(&self, event: &Reconciliation) -> Result<(), TicketError> {
        match event {
            Reconciliation::Push {
                repo,
                branch,
                old_tip,
                new_tip,
                pusher,
            } => self.reconcile_push(repo, branch, old_tip.as_deref(), new_tip, pusher),
            Reconciliation::BranchDelete {
                repo,
                old_tip,
                actor,
                ..
            } => self.reconcile_branch_delete(repo, old_tip, actor),
            Reconciliation::CommentRefs {
                repo,
                source,
                comment_id,
                text,
                author,
            } => self.reconcile_comment(repo, *source, comment_id, text, author),
        }
    }

    fn reconcile_comment(
        &self,
        repo: &str,
        source: u64,
        comment_id: &str,
        text: &str,
        author: &str,
    ) -> Result<(), TicketError> {
        for mention in extract_mentions(text) {
            if mention == source {
                continue;
            }
            self.add_reference(repo, mention, Some(source), comment_id, author)?;
        }
        Ok(())
    }

    fn reconcile_push(
        &self,
        repo: &str,
        branch: &str,
        old_tip: Option<&str>,
        new_tip: &str,
        pusher: &str,
    ) -> Result<(), TicketError> {
        let after = self.graph.reachable_commits(repo, new_tip)?;
        let after_set: BTreeSet<&str> = after.iter().map(String::as_str).collect();
        let before = match old_tip {
            Some(tip) => self.graph.reachable_commits(repo, tip)?,
            None => Vec::new(),
        };
        let before_set: BTreeSet<&str> = before.iter().map(String::as_str).collect();
        let elsewhere = self.retained_commits(repo, Some(branch))?;

        // tip-first, so references land newest commit first
        let added: Vec<&String> = after
            .iter()
            .filter(|sha| !before_set.contains(sha.as_str()) && !elsewhere.contains(sha.as_str()))
            .collect();
        let removed: Vec<String> = before
            .iter()
            .filter(|sha| !after_set.contains(sha.as_str()) && !elsewhere.contains(sha.as_str()))
            .cloned()
            .collect();

        if !removed.is_empty() {
            self.drop_references(repo, &removed, pusher)?;
        }

        // a push to a proposal branch records a patchset revision and
        // exempts the owning ticket from referencing itself
        let mut exempt = None;
        if let Some(owner) = ticket_branch_owner(branch) {
            if self.accepts_patchsets(repo) {
                if let Some(ticket) = self.get_ticket(repo, owner)? {
                    self.record_patchset(repo, &ticket, old_tip, new_tip, &after, added.len(), pusher)?;
                    exempt = Some(owner);
                }
            }
        }

        for sha in added {
            let message = self.graph.commit_message(repo, sha)?;
            for mention in extract_mentions(&message) {
                if Some(mention) == exempt {
                    continue;
                }
                self.add_reference(repo, mention, None, sha, pusher)?;
            }
        }

        tracing::debug!(repo, branch, removed = removed.len(), "reconciled push");
        Ok(())
    }

    fn reconcile_branch_delete(
        &self,
        repo: &str,
        old_tip: &str,
        actor: &str,
    ) -> Result<(), TicketError> {
        let retained = self.retained_commits(repo, None)?;
        let removed: Vec<String> = self
            .graph
            .reachable_commits(repo, old_tip)?
            .into_iter()
            .filter(|sha| !retained.contains(sha))
            .collect();
        if !removed.is_empty() {
            self.drop_references(repo, &removed, actor)?;
        }
        Ok(())
    }

    /// Record the patchset revision implied by a push to `ticket/N`.
    /// A history rewrite yields `rev + 1` under the same sequence number;
    /// otherwise the push is a fast-forward revision. Idempotent: a tip
    /// already recorded is skipped, so a parked push can be replayed.
    #[allow(clippy::cast_possible_truncation)]
    fn record_patchset(
        &self,
        repo: &str,
        ticket: &TicketModel,
        old_tip: Option<&str>,
        new_tip: &str,
        after: &[String],
        added_commits: usize,
        pusher: &str,
    ) -> Result<(), TicketError> {
        if ticket.patchsets().iter().any(|ps| ps.tip == new_tip) {
            return Ok(());
        }

        let rewritten = old_tip.is_some_and(|tip| !after.iter().any(|sha| sha == tip));
        let default = self.graph.default_branch(repo)?;
        let default_tip = self.graph.read_ref(repo, &default)?;

        let (number, rev, kind, base) = match ticket.current_patchset() {
            None => (
                1,
                1,
                PatchsetKind::Proposal,
                default_tip.clone().unwrap_or_default(),
            ),
            Some(current) => (
                current.number,
                current.rev + 1,
                if rewritten {
                    PatchsetKind::Amend
                } else {
                    PatchsetKind::FastForward
                },
                current.base.clone(),
            ),
        };

        // the proposal is what the integration branch cannot already reach
        let on_default: BTreeSet<String> = match default_tip {
            Some(tip) => self
                .graph
                .reachable_commits(repo, &tip)?
                .into_iter()
                .collect(),
            None => BTreeSet::new(),
        };
        let proposal: Vec<&String> = after
            .iter()
            .filter(|sha| !on_default.contains(sha.as_str()))
            .collect();
        let mut insertions = 0;
        let mut deletions = 0;
        for sha in &proposal {
            let (ins, del) = self.graph.commit_stats(repo, sha)?;
            insertions += ins;
            deletions += del;
        }

        // pin the revision tip first so replaying after a partial failure
        // finds the retention ref in place
        let retention = patchset_ref(ticket.number, number, rev);
        let current = self.graph.read_ref(repo, &retention)?;
        self.graph
            .cas_update_ref(repo, &retention, current.as_deref(), Some(new_tip))?;

        let mut change = Change::new(pusher);
        change.patchset = Some(Patchset {
            number,
            rev,
            tip: new_tip.to_string(),
            base,
            insertions,
            deletions,
            total_commits: proposal.len() as u32,
            added_commits: added_commits as u32,
            kind,
        });
        if ticket.status == Status::New {
            change.set_field(Field::Status, Status::Open);
        }
        self.append_with_retry(repo, ticket.number, &change)?;
        self.refresh_index(&self.materialized(repo, ticket.number)?);
        tracing::info!(
            repo,
            ticket = ticket.number,
            number,
            rev,
            ?kind,
            "recorded patchset revision"
        );
        Ok(())
    }

    /// Add one backlink to a mentioned ticket. Unknown numbers are inert;
    /// an already-present backlink is not duplicated, so replays are safe.
    fn add_reference(
        &self,
        repo: &str,
        target: u64,
        source: Option<u64>,
        hash: &str,
        author: &str,
    ) -> Result<(), TicketError> {
        let Some(ticket) = self.get_ticket(repo, target)? else {
            return Ok(());
        };
        if ticket
            .references()
            .iter()
            .any(|r| r.hash == hash && r.ticket == source)
        {
            return Ok(());
        }
        self.append_with_retry(repo, target, &Change::referenced_by(author, source, hash))?;
        self.refresh_index(&self.materialized(repo, target)?);
        Ok(())
    }

    /// Drop every backlink whose source hash is in `hashes`, across all
    /// tickets of the repository. Scans materialized tickets through the
    /// store, not the search index.
    fn drop_references(
        &self,
        repo: &str,
        hashes: &[String],
        actor: &str,
    ) -> Result<(), TicketError> {
        for number in self.store.ticket_numbers(repo)? {
            let Some(ticket) = self.get_ticket(repo, number)? else {
                continue;
            };
            let mut stale = Vec::new();
            for reference in ticket.references() {
                if hashes.contains(&reference.hash) && !stale.contains(&reference.hash) {
                    stale.push(reference.hash.clone());
                }
            }
            if stale.is_empty() {
                continue;
            }
            self.append_with_retry(repo, number, &Change::unreferenced(actor, stale))?;
            self.refresh_index(&self.materialized(repo, number)?);
        }
        Ok(())
    }

    /// Union of commits reachable from every ref, optionally excluding
    /// one ref by name.
    fn retained_commits(
        &self,
        repo: &str,
        exclude: Option<&str>,
    ) -> Result<BTreeSet<String>, TicketError> {
        let mut retained = BTreeSet::new();
        for (name, tip) in self.graph.refs(repo)? {
            if exclude == Some(name.as_str()) {
                continue;
            }
            retained.extend(self.graph.reachable_commits(repo, &tip)?);
        }
        Ok(retained)
    }
}

#[cfg(test)]
mod tests {
    use super::{patchset_ref, ticket_branch_owner};

    #[test]
    fn ticket_branch_names_parse() {
        assert_eq!(ticket_branch_owner("ticket/7"), Some(7));
        assert_eq!(ticket_branch_owner("refs/heads/ticket/42"), Some(42));
        assert_eq!(ticket_branch_owner("refs/heads/master"), None);
        assert_eq!(ticket_branch_owner("ticket/"), None);
        assert_eq!(ticket_branch_owner("ticket/0"), None);
        assert_eq!(ticket_branch_owner("ticket/7x"), None);
        assert_eq!(ticket_branch_owner("tickets/7"), None);
    }

    #[test]
    fn retention_refs_are_scoped_per_revision() {
        assert_eq!(patchset_ref(7, 1, 2), "refs/keel/patchsets/7/1/2");
    }
}
