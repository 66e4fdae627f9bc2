//! Facade scenarios spanning backends: the proposal-to-merge lifecycle
//! with notification hand-off, and a flat-file-backed service exercising
//! the same operation set as the embedded one.

use keel_core::{Change, Field, Kind, Patchset, PatchsetKind, Status};
use keel_search::{IndexQuery, SortBy, TicketIndexer};
use keel_service::{Mailing, MemoryGraph, NotificationSink, ReachabilityOracle, TicketService};
use keel_store::{BranchStore, FileStore, MemoryRefDb};
use std::sync::{Arc, Mutex};

const REPO: &str = "gb-tickets.git";

fn embedded_service() -> TicketService {
    TicketService::new(
        Arc::new(BranchStore::new(MemoryRefDb::new())),
        Arc::new(MemoryGraph::new()) as Arc<dyn ReachabilityOracle>,
        TicketIndexer::in_memory().expect("index"),
    )
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<(u64, String)>>,
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, mailing: &Mailing) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push((mailing.ticket.number, mailing.change.author.clone()));
        }
    }
}

#[test]
fn proposal_merge_lifecycle_is_queueable_for_notification() {
    let sink = Arc::new(RecordingSink::default());
    let svc = embedded_service().with_sink(Arc::clone(&sink) as Arc<dyn NotificationSink>);

    let mut kernel = Change::new("james");
    kernel
        .set_field(Field::Title, "Sample ticket")
        .set_field(
            Field::Body,
            "this **is** my sample body\n\n- I hope\n- you really\n- *really* like it",
        )
        .set_field(Field::Status, Status::New)
        .set_field(Field::Type, Kind::Proposal);
    kernel.comment("this is a sample comment on a kernel change");
    kernel.patchset = Some(Patchset {
        number: 1,
        rev: 1,
        tip: "50f57913f816d04a16b7407134de5d8406421f37".into(),
        base: "0000000000000000000000000000000000000000".into(),
        insertions: 100,
        deletions: 10,
        total_commits: 1,
        added_commits: 1,
        kind: PatchsetKind::Proposal,
    });

    let ticket = svc.create_ticket(REPO, kernel, None).unwrap();
    assert!(ticket.is_proposal());
    assert!(ticket.is_open());
    assert_eq!(ticket.patchsets().len(), 1);

    let mut merge = Change::new("james");
    merge
        .set_field(Field::MergeSha, "50f57913f816d04a16b7407134de5d8406421f37")
        .set_field(Field::MergeTo, "master")
        .set_field(Field::Status, Status::Merged);
    let ticket = svc.update_ticket(REPO, ticket.number, merge).unwrap();

    assert!(ticket.is_closed());
    assert!(ticket.is_merged());
    assert_eq!(ticket.patchsets().len(), 1);
    assert_eq!(ticket.responsible.as_deref(), Some("james"));

    let notifier = svc.create_notifier();
    let mailing = notifier.queue_mailing(&ticket).expect("queueable");
    assert_eq!(mailing.ticket.number, ticket.number);
    assert!(mailing.change.is_merge());

    assert_eq!(notifier.send_all(), 1);
    let delivered = sink.delivered.lock().unwrap();
    assert_eq!(delivered.as_slice(), &[(ticket.number, "james".to_string())]);
}

#[test]
fn milestone_rename_notifies_open_tickets_only() {
    let sink = Arc::new(RecordingSink::default());
    let svc = embedded_service().with_sink(Arc::clone(&sink) as Arc<dyn NotificationSink>);

    let mut open = Change::new("james");
    open.set_field(Field::Title, "open one")
        .set_field(Field::Milestone, "v1.0");
    let open = svc.create_ticket(REPO, open, None).unwrap();

    let mut closed = Change::new("james");
    closed
        .set_field(Field::Title, "closed one")
        .set_field(Field::Milestone, "v1.0")
        .set_field(Field::Status, Status::Resolved);
    let closed = svc.create_ticket(REPO, closed, None).unwrap();

    svc.create_milestone(REPO, "v1.0", "james").unwrap();
    assert!(svc.rename_milestone(REPO, "v1.0", "v2.0", "james").unwrap());

    // both tickets carry the new name, only the open one was mailed
    assert_eq!(
        svc.get_ticket(REPO, open.number).unwrap().unwrap().milestone.as_deref(),
        Some("v2.0")
    );
    assert_eq!(
        svc.get_ticket(REPO, closed.number).unwrap().unwrap().milestone.as_deref(),
        Some("v2.0")
    );
    let delivered = sink.delivered.lock().unwrap();
    assert_eq!(delivered.as_slice(), &[(open.number, "james".to_string())]);
}

#[test]
fn file_backed_service_supports_the_same_operation_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStore::open(dir.path().join("store")).expect("file store");
    let svc = TicketService::new(
        Arc::new(store),
        Arc::new(MemoryGraph::new()) as Arc<dyn ReachabilityOracle>,
        TicketIndexer::open(&dir.path().join("index.db")).expect("index"),
    );

    let mut first = Change::new("alice");
    first
        .set_field(Field::Title, "Crash on login")
        .set_field(Field::Type, Kind::Bug)
        .set_field(Field::Severity, "critical");
    let a = svc.create_ticket(REPO, first, None).unwrap();

    let mut second = Change::new("alice");
    second.set_field(Field::Title, "Add dark mode");
    let b = svc.create_ticket(REPO, second, None).unwrap();
    assert_eq!(svc.get_ids(REPO).unwrap(), vec![a.number, b.number]);

    // comment mentions resolve against the same flat-file journals
    let mut note = Change::new("bob");
    note.comment(&format!("related to #{}", a.number));
    svc.update_ticket(REPO, b.number, note).unwrap();

    let a_model = svc.get_ticket(REPO, a.number).unwrap().unwrap();
    assert_eq!(a_model.references().len(), 1);
    assert_eq!(a_model.references()[0].ticket, Some(b.number));

    // the index answers structured queries after a full rebuild
    svc.reindex(REPO).unwrap();
    let bugs = svc
        .query_for(
            &IndexQuery::new().repository(REPO).kind(Kind::Bug),
            1,
            10,
            SortBy::Number,
            false,
        )
        .unwrap();
    assert_eq!(bugs.len(), 1);
    assert_eq!(bugs[0].number, a.number);

    let hits = svc.search_for(REPO, "dark", 1, 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].number, b.number);

    assert!(svc.delete_ticket(REPO, a.number, "alice").unwrap());
    assert!(svc.get_ticket(REPO, a.number).unwrap().is_none());
    assert_eq!(svc.get_ids(REPO).unwrap(), vec![b.number]);
}
