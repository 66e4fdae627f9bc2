//! End-to-end reference integrity behavior: comment mentions, commit
//! mentions on the default branch and on ticket branches, amends,
//! patchset revision deletion, and branch deletion, all driven through
//! the facade against the in-process commit graph.

use keel_core::{Change, Field, Kind, Status, TicketError, TicketModel};
use keel_search::TicketIndexer;
use keel_service::{MemoryGraph, ReachabilityOracle, TicketService};
use keel_store::{BranchStore, MemoryRefDb};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const REPO: &str = "gb-tickets.git";
const MASTER: &str = "refs/heads/master";

struct Harness {
    svc: TicketService,
    graph: Arc<MemoryGraph>,
}

impl Harness {
    fn new() -> Self {
        let graph = Arc::new(MemoryGraph::new());
        let svc = TicketService::new(
            Arc::new(BranchStore::new(MemoryRefDb::new())),
            Arc::clone(&graph) as Arc<dyn ReachabilityOracle>,
            TicketIndexer::in_memory().expect("index"),
        );
        let harness = Self { svc, graph };
        // seed the integration branch the way a freshly initialized
        // repository would look
        let root = harness.graph.commit(REPO, &[], "initial commit").unwrap();
        harness.graph.set_ref(REPO, MASTER, &root).unwrap();
        harness
    }

    fn create_ticket(&self, title: &str) -> TicketModel {
        let mut change = Change::new("james");
        change
            .set_field(Field::Title, title)
            .set_field(Field::Type, Kind::Bug);
        self.svc.create_ticket(REPO, change, None).unwrap()
    }

    /// Append a comment, returning the change that carries it.
    fn comment(&self, number: u64, text: &str) -> Change {
        let mut change = Change::new("james");
        change.comment(text);
        self.svc
            .update_ticket(REPO, number, change.clone())
            .unwrap();
        change
    }

    fn tip(&self, branch: &str) -> Option<String> {
        self.graph.read_ref(REPO, branch).unwrap()
    }

    /// Record a commit on top of `parent` without moving any ref.
    fn commit(&self, parent: Option<&str>, message: &str) -> String {
        let parents: Vec<&str> = parent.into_iter().collect();
        self.graph.commit(REPO, &parents, message).unwrap()
    }

    /// Move the branch to `new_tip` and reconcile, as the receive hook
    /// would after a (force-)push.
    fn push(&self, branch: &str, new_tip: &str) {
        let old = self.tip(branch);
        self.graph.set_ref(REPO, branch, new_tip).unwrap();
        self.svc
            .on_push(REPO, branch, old.as_deref(), new_tip, "james");
    }

    /// Commit on the branch (forking from master for a new branch) and
    /// push in one step. Returns the commit id.
    fn push_commit(&self, branch: &str, message: &str) -> String {
        let parent = self.tip(branch).or_else(|| self.tip(MASTER));
        let sha = self.commit(parent.as_deref(), message);
        self.push(branch, &sha);
        sha
    }

    fn delete_branch(&self, branch: &str) {
        let old = self.tip(branch).expect("branch exists");
        self.graph.delete_ref(REPO, branch).unwrap();
        self.svc.on_branch_deleted(REPO, branch, &old, "james");
    }

    fn references(&self, number: u64) -> Vec<(Option<u64>, String)> {
        self.svc
            .get_ticket(REPO, number)
            .unwrap()
            .unwrap()
            .references()
            .iter()
            .map(|r| (r.ticket, r.hash.clone()))
            .collect()
    }

    fn ticket(&self, number: u64) -> TicketModel {
        self.svc.get_ticket(REPO, number).unwrap().unwrap()
    }
}

// -- comment mentions -------------------------------------------------------

#[test]
fn no_references_on_ticket_creation() {
    let h = Harness::new();
    let a = h.create_ticket("noReferencesOnCreation");
    assert!(!a.has_references());

    let a = h.ticket(a.number);
    assert!(!a.has_references());
}

#[test]
fn comment_mentions_of_plain_and_unknown_numbers_are_inert() {
    let h = Harness::new();
    let a = h.create_ticket("inert-A");
    let b = h.create_ticket("inert-B");

    h.comment(a.number, "comment for 1 - no reference");
    h.comment(a.number, "comment for # - no reference");
    h.comment(a.number, "comment for #999 - ignores invalid reference");

    assert!(h.references(a.number).is_empty());
    assert!(h.references(b.number).is_empty());
}

#[test]
fn comment_does_not_reference_its_own_ticket() {
    let h = Harness::new();
    let a = h.create_ticket("self-A");
    h.comment(a.number, &format!("comment for #{} - no self reference", a.number));
    assert!(h.references(a.number).is_empty());
}

#[test]
fn comment_single_reference() {
    let h = Harness::new();
    let a = h.create_ticket("single-A");
    let b = h.create_ticket("single-B");

    let change = h.comment(a.number, &format!("comment for #{} - single reference", b.number));
    let comment_id = change.comment.unwrap().id;

    assert!(h.references(a.number).is_empty());
    assert_eq!(h.references(b.number), vec![(Some(a.number), comment_id)]);
}

#[test]
fn comment_self_and_other_reference() {
    let h = Harness::new();
    let a = h.create_ticket("self-other-A");
    let b = h.create_ticket("self-other-B");

    let change = h.comment(
        a.number,
        &format!("comment for #{} and #{} - self and other", a.number, b.number),
    );
    let comment_id = change.comment.unwrap().id;

    assert!(h.references(a.number).is_empty());
    assert_eq!(h.references(b.number), vec![(Some(a.number), comment_id)]);
}

#[test]
fn comment_multi_reference() {
    let h = Harness::new();
    let a = h.create_ticket("multi-A");
    let b = h.create_ticket("multi-B");
    let c = h.create_ticket("multi-C");

    let change = h.comment(
        a.number,
        &format!("comment for #{} and #{} - multi reference", b.number, c.number),
    );
    let comment_id = change.comment.unwrap().id;

    assert!(h.references(a.number).is_empty());
    assert_eq!(
        h.references(b.number),
        vec![(Some(a.number), comment_id.clone())]
    );
    assert_eq!(h.references(c.number), vec![(Some(a.number), comment_id)]);
}

// -- commit mentions on the default branch ----------------------------------

#[test]
fn commit_master_inert_mentions() {
    let h = Harness::new();
    let a = h.create_ticket("master-inert-A");

    let c1 = h.commit(h.tip(MASTER).as_deref(), "commit for 1 - no reference");
    let c2 = h.commit(Some(&c1), "commit for # - no reference");
    let c3 = h.commit(Some(&c2), "commit for #999 - ignores invalid reference");
    h.push(MASTER, &c3);

    assert!(h.references(a.number).is_empty());
}

#[test]
fn commit_master_single_reference() {
    let h = Harness::new();
    let a = h.create_ticket("master-single-A");

    let sha = h.push_commit(MASTER, &format!("commit for #{} - single reference", a.number));

    assert_eq!(h.references(a.number), vec![(None, sha)]);
}

#[test]
fn commit_master_multi_reference() {
    let h = Harness::new();
    let a = h.create_ticket("master-multi-A");
    let b = h.create_ticket("master-multi-B");

    let sha = h.push_commit(
        MASTER,
        &format!("commit for #{} and #{} - multi reference", a.number, b.number),
    );

    assert_eq!(h.references(a.number), vec![(None, sha.clone())]);
    assert_eq!(h.references(b.number), vec![(None, sha)]);
}

#[test]
fn commit_master_amend_reference() {
    let h = Harness::new();
    let a = h.create_ticket("master-amend-A");
    let b = h.create_ticket("master-amend-B");

    let base = h.tip(MASTER);
    let c1 = h.commit(
        base.as_deref(),
        &format!("commit before amend for #{} and #{}", a.number, b.number),
    );
    h.push(MASTER, &c1);

    assert_eq!(h.references(a.number), vec![(None, c1.clone())]);
    assert_eq!(h.references(b.number), vec![(None, c1.clone())]);

    // the amend rewrites history: same parent, new commit
    let c2 = h.commit(base.as_deref(), &format!("commit after amend for #{}", a.number));
    h.push(MASTER, &c2);

    assert_eq!(h.references(a.number), vec![(None, c2)]);
    assert!(h.references(b.number).is_empty());
}

// -- proposal branches (patchsets accepted) ---------------------------------

#[test]
fn patchset_branch_inert_and_self_mentions() {
    let h = Harness::new();
    let a = h.create_ticket("ps-self-A");
    let branch = format!("refs/heads/ticket/{}", a.number);

    let base = h.tip(MASTER);
    let c1 = h.commit(base.as_deref(), "commit for 1 - no reference");
    let c2 = h.commit(Some(&c1), &format!("commit for #{} - self mention", a.number));
    h.push(&branch, &c2);

    // the owning ticket gains a patchset, never a self reference
    let a = h.ticket(a.number);
    assert!(!a.has_references());
    assert!(a.has_patchsets());
    assert!(a.patchset(1, 1).is_some());
    assert_eq!(a.status, Status::Open);
}

#[test]
fn patchset_branch_single_and_multi_reference() {
    let h = Harness::new();
    let a = h.create_ticket("ps-ref-A");
    let b = h.create_ticket("ps-ref-B");
    let c = h.create_ticket("ps-ref-C");
    let branch = format!("refs/heads/ticket/{}", a.number);

    let sha = h.push_commit(
        &branch,
        &format!("commit for #{} and #{} - from a proposal", b.number, c.number),
    );

    assert!(h.references(a.number).is_empty());
    assert_eq!(h.references(b.number), vec![(None, sha.clone())]);
    assert_eq!(h.references(c.number), vec![(None, sha)]);
}

#[test]
fn patchset_amend_retains_prior_revision_references_until_deleted() {
    let h = Harness::new();
    let a = h.create_ticket("ps-amend-A");
    let b = h.create_ticket("ps-amend-B");
    let c = h.create_ticket("ps-amend-C");
    let branch = format!("refs/heads/ticket/{}", c.number);

    let base = h.tip(MASTER);
    let c1 = h.commit(
        base.as_deref(),
        &format!("commit before amend for #{} and #{}", a.number, b.number),
    );
    h.push(&branch, &c1);

    assert_eq!(h.references(a.number), vec![(None, c1.clone())]);
    assert_eq!(h.references(b.number), vec![(None, c1.clone())]);
    assert!(h.references(c.number).is_empty());
    assert!(h.ticket(c.number).patchset(1, 1).is_some());

    // the amend opens revision 2; revision 1 commits stay retained, so
    // both tickets keep their old references
    let c2 = h.commit(base.as_deref(), &format!("commit after amend for #{}", a.number));
    h.push(&branch, &c2);

    let ticket_c = h.ticket(c.number);
    assert!(ticket_c.patchset(1, 1).is_some());
    assert!(ticket_c.patchset(1, 2).is_some());
    assert_eq!(ticket_c.current_patchset().unwrap().rev, 2);

    assert_eq!(
        h.references(a.number),
        vec![(None, c1.clone()), (None, c2.clone())]
    );
    assert_eq!(h.references(b.number), vec![(None, c1.clone())]);

    // deleting revision 1 drops exactly its commit references
    assert!(h
        .svc
        .delete_patchset(REPO, c.number, 1, 1, "james")
        .unwrap());

    let ticket_c = h.ticket(c.number);
    assert!(ticket_c.patchset(1, 1).is_none());
    assert!(ticket_c.patchset(1, 2).is_some());

    assert_eq!(h.references(a.number), vec![(None, c2)]);
    assert!(h.references(b.number).is_empty());
    assert!(h.references(c.number).is_empty());

    assert!(!h
        .svc
        .delete_patchset(REPO, c.number, 1, 1, "james")
        .unwrap());
}

// -- ticket branches with patchsets disabled --------------------------------

#[test]
fn ticket_branch_self_reference_when_patchsets_disabled() {
    let h = Harness::new();
    h.svc.set_accepts_patchsets(REPO, false);
    let a = h.create_ticket("branch-self-A");
    let branch = format!("refs/heads/ticket/{}", a.number);

    let sha = h.push_commit(&branch, &format!("commit for #{} - plain branch", a.number));

    // without patchsets the branch is just a branch: the mention counts
    assert_eq!(h.references(a.number), vec![(None, sha)]);
    assert!(!h.ticket(a.number).has_patchsets());
}

#[test]
fn ticket_branch_multi_commit_push_orders_references_newest_first() {
    let h = Harness::new();
    h.svc.set_accepts_patchsets(REPO, false);
    let a = h.create_ticket("branch-multi-A");
    let b = h.create_ticket("branch-multi-B");
    let branch = format!("refs/heads/ticket/{}", a.number);

    let c1 = h.commit(
        h.tip(MASTER).as_deref(),
        &format!("commit for #{} - multi commit 1", b.number),
    );
    let c2 = h.commit(Some(&c1), &format!("commit for #{} - multi commit 2", b.number));
    h.push(&branch, &c2);

    assert!(h.references(a.number).is_empty());
    assert_eq!(h.references(b.number), vec![(None, c2), (None, c1)]);
}

#[test]
fn ticket_branch_amend_when_patchsets_disabled() {
    let h = Harness::new();
    h.svc.set_accepts_patchsets(REPO, false);
    let a = h.create_ticket("branch-amend-A");
    let b = h.create_ticket("branch-amend-B");
    let c = h.create_ticket("branch-amend-C");
    let branch = format!("refs/heads/ticket/{}", c.number);

    let base = h.tip(MASTER);
    let c1 = h.commit(
        base.as_deref(),
        &format!("commit before amend for #{} and #{}", a.number, b.number),
    );
    h.push(&branch, &c1);

    assert_eq!(h.references(a.number), vec![(None, c1.clone())]);
    assert_eq!(h.references(b.number), vec![(None, c1)]);
    assert!(!h.ticket(c.number).has_patchsets());

    let c2 = h.commit(base.as_deref(), &format!("commit after amend for #{}", a.number));
    h.push(&branch, &c2);

    assert_eq!(h.references(a.number), vec![(None, c2)]);
    assert!(h.references(b.number).is_empty());
    assert!(!h.ticket(c.number).has_patchsets());
}

#[test]
fn branch_deletion_drops_unmerged_references() {
    let h = Harness::new();
    h.svc.set_accepts_patchsets(REPO, false);
    let a = h.create_ticket("delete-unmerged-A");
    let b = h.create_ticket("delete-unmerged-B");
    let c = h.create_ticket("delete-unmerged-C");
    let branch = format!("refs/heads/ticket/{}", c.number);

    h.push_commit(
        &branch,
        &format!("commit before amend for #{} and #{}", a.number, b.number),
    );
    assert!(!h.references(a.number).is_empty());
    assert!(!h.references(b.number).is_empty());

    h.delete_branch(&branch);

    assert!(h.references(a.number).is_empty());
    assert!(h.references(b.number).is_empty());
    assert!(h.references(c.number).is_empty());
}

#[test]
fn branch_deletion_after_merge_keeps_references() {
    let h = Harness::new();
    h.svc.set_accepts_patchsets(REPO, false);
    let a = h.create_ticket("delete-merged-A");
    let b = h.create_ticket("delete-merged-B");
    let c = h.create_ticket("delete-merged-C");
    let branch = format!("refs/heads/ticket/{}", c.number);

    let c1 = h.push_commit(
        &branch,
        &format!("commit before merge for #{} and #{}", a.number, b.number),
    );

    // no-fast-forward merge into master, pushed
    let master_tip = h.tip(MASTER).unwrap();
    let merge = h
        .graph
        .commit(REPO, &[&master_tip, &c1], "merge the ticket branch")
        .unwrap();
    h.push(MASTER, &merge);

    h.delete_branch(&branch);

    assert_eq!(h.references(a.number), vec![(None, c1.clone())]);
    assert_eq!(h.references(b.number), vec![(None, c1)]);
    assert!(h.references(c.number).is_empty());
}

// -- reconciliation failure handling ----------------------------------------

/// Oracle wrapper that can be switched into a failing state.
struct FlakyOracle {
    inner: Arc<MemoryGraph>,
    fail: AtomicBool,
}

impl FlakyOracle {
    fn check(&self) -> Result<(), TicketError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TicketError::BackendUnavailable(
                "reachability service timed out".into(),
            ));
        }
        Ok(())
    }
}

impl ReachabilityOracle for FlakyOracle {
    fn refs(&self, repo: &str) -> Result<Vec<(String, String)>, TicketError> {
        self.check()?;
        self.inner.refs(repo)
    }

    fn read_ref(&self, repo: &str, name: &str) -> Result<Option<String>, TicketError> {
        self.check()?;
        self.inner.read_ref(repo, name)
    }

    fn cas_update_ref(
        &self,
        repo: &str,
        name: &str,
        expected: Option<&str>,
        new_tip: Option<&str>,
    ) -> Result<bool, TicketError> {
        self.check()?;
        self.inner.cas_update_ref(repo, name, expected, new_tip)
    }

    fn reachable_commits(&self, repo: &str, tip: &str) -> Result<Vec<String>, TicketError> {
        self.check()?;
        self.inner.reachable_commits(repo, tip)
    }

    fn commit_message(&self, repo: &str, sha: &str) -> Result<String, TicketError> {
        self.check()?;
        self.inner.commit_message(repo, sha)
    }

    fn commit_stats(&self, repo: &str, sha: &str) -> Result<(u32, u32), TicketError> {
        self.check()?;
        self.inner.commit_stats(repo, sha)
    }
}

#[test]
fn oracle_outage_parks_the_push_and_retry_converges() {
    let graph = Arc::new(MemoryGraph::new());
    let oracle = Arc::new(FlakyOracle {
        inner: Arc::clone(&graph),
        fail: AtomicBool::new(false),
    });
    let svc = TicketService::new(
        Arc::new(BranchStore::new(MemoryRefDb::new())),
        Arc::clone(&oracle) as Arc<dyn ReachabilityOracle>,
        TicketIndexer::in_memory().expect("index"),
    );

    let mut change = Change::new("james");
    change.set_field(Field::Title, "flaky-A");
    let a = svc.create_ticket(REPO, change, None).unwrap();

    let sha = graph
        .commit(REPO, &[], &format!("commit for #{}", a.number))
        .unwrap();
    graph.set_ref(REPO, MASTER, &sha).unwrap();

    // the push is accepted even though reconciliation cannot run
    oracle.fail.store(true, Ordering::SeqCst);
    svc.on_push(REPO, MASTER, None, &sha, "james");
    assert_eq!(svc.pending_reconciliations(), 1);
    assert!(!svc.get_ticket(REPO, a.number).unwrap().unwrap().has_references());

    // a failed retry keeps the event parked
    assert_eq!(svc.retry_pending(), 0);
    assert_eq!(svc.pending_reconciliations(), 1);

    oracle.fail.store(false, Ordering::SeqCst);
    assert_eq!(svc.retry_pending(), 1);
    assert_eq!(svc.pending_reconciliations(), 0);

    let ticket = svc.get_ticket(REPO, a.number).unwrap().unwrap();
    let refs = ticket.references();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].ticket, None);
    assert_eq!(refs[0].hash, sha);
}
