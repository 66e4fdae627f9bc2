//! The ticket service facade.
//!
//! One operation set over the storage backend, the search index, the
//! reachability oracle, and the notifier: ticket CRUD, comments,
//! milestones, labels, attachments, and search. Every ticket mutation is a
//! read-modify-append cycle retried a bounded number of times on
//! [`TicketError::VersionConflict`]; callers therefore construct changes
//! without side effects and may safely retry a surfaced failure.
//!
//! Push, branch-deletion, and patchset events are handled by the reference
//! integrity engine half of this type (see `engine`).

use crate::config::ServiceConfig;
use crate::engine::Reconciliation;
use crate::notify::{LogSink, NotificationSink, Notifier};
use crate::oracle::{MemoryGraph, ReachabilityOracle};
use anyhow::Result as AnyResult;
use keel_core::{
    Attachment, Change, Comment, Field, Label, Milestone, TicketError, TicketModel, materialize,
};
use keel_search::{IndexQuery, QueryResult, SortBy, TicketIndexer};
use keel_store::TicketStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// The ticket tracking engine behind one operation set.
pub struct TicketService {
    pub(crate) store: Arc<dyn TicketStore>,
    pub(crate) graph: Arc<dyn ReachabilityOracle>,
    pub(crate) indexer: Mutex<TicketIndexer>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) update_retries: u32,
    /// Per-repository: whether pushes to `ticket/N` branches open patchsets.
    pub(crate) patchsets: Mutex<HashMap<String, bool>>,
    pub(crate) pending: Mutex<Vec<Reconciliation>>,
}

impl TicketService {
    #[must_use]
    pub fn new(
        store: Arc<dyn TicketStore>,
        graph: Arc<dyn ReachabilityOracle>,
        indexer: TicketIndexer,
    ) -> Self {
        Self {
            store,
            graph,
            indexer: Mutex::new(indexer),
            sink: Arc::new(LogSink),
            update_retries: 3,
            patchsets: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Build a service from configuration, with the in-process commit
    /// graph as the reachability collaborator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured backend or index cannot open.
    pub fn from_config(config: &ServiceConfig) -> AnyResult<Self> {
        let store = config.build_store()?;
        let indexer = config.build_indexer()?;
        let mut service = Self::new(store, Arc::new(MemoryGraph::new()), indexer);
        service.update_retries = config.update_retries.max(1);
        Ok(service)
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_update_retries(mut self, retries: u32) -> Self {
        self.update_retries = retries.max(1);
        self
    }

    /// Whether pushes to `ticket/N` branches of the repository open
    /// patchsets. Defaults to true.
    #[must_use]
    pub fn accepts_patchsets(&self, repo: &str) -> bool {
        self.patchsets
            .lock()
            .map_or(true, |map| map.get(repo).copied().unwrap_or(true))
    }

    pub fn set_accepts_patchsets(&self, repo: &str, accept: bool) {
        if let Ok(mut map) = self.patchsets.lock() {
            map.insert(repo.to_string(), accept);
        }
    }

    /// A fresh mailing queue bound to this service's notification sink.
    #[must_use]
    pub fn create_notifier(&self) -> Notifier {
        Notifier::new(Arc::clone(&self.sink))
    }

    // -- ticket CRUD --------------------------------------------------------

    /// Create a ticket from its first change, which must set a title. The
    /// author is auto-subscribed as a watcher. `number` pre-reserves an
    /// explicit ticket number instead of allocating the next one.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for a malformed change, a missing
    /// title, or an explicit number already in use.
    pub fn create_ticket(
        &self,
        repo: &str,
        mut change: Change,
        number: Option<u64>,
    ) -> Result<TicketModel, TicketError> {
        change.validate()?;
        if !change.has_field(Field::Title) {
            return Err(TicketError::InvalidChange(
                "a ticket's first change must set a title".into(),
            ));
        }
        let author = change.author.clone();
        if !change.has_field(Field::Watchers) {
            change.watch(&author);
        }

        let number = match number {
            Some(explicit) => {
                self.store.reserve_number(repo, explicit)?;
                explicit
            }
            None => self.store.assign_number(repo)?,
        };
        self.store.append(repo, number, 0, &change)?;
        tracing::info!(repo, number, author = %author, "created ticket");

        if let Some(comment) = change.comment.as_ref().filter(|c| !c.deleted) {
            self.note_comment(repo, number, comment, &author);
        }

        let model = self.materialized(repo, number)?;
        self.refresh_index(&model);
        Ok(model)
    }

    /// Append a change to an existing ticket, retrying version conflicts
    /// up to the configured bound.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`] for an unknown ticket,
    /// [`TicketError::InvalidChange`] for a malformed change, or a
    /// retryable failure once the retry budget is exhausted.
    pub fn update_ticket(
        &self,
        repo: &str,
        number: u64,
        mut change: Change,
    ) -> Result<TicketModel, TicketError> {
        change.validate()?;
        let journal = self.store.journal(repo, number)?;
        if journal.is_empty() {
            return Err(TicketError::not_found(repo, number));
        }

        // attachments de-duplicate by content identity so a client retry
        // never stores the same bytes twice
        if !change.attachments.is_empty() {
            let current = materialize(repo, number, &journal)
                .ok_or_else(|| TicketError::not_found(repo, number))?;
            change.attachments.retain(|new| {
                !current
                    .attachments()
                    .iter()
                    .any(|old| old.name == new.name && old.digest == new.digest)
            });
        }

        let is_new_comment = change.comment.as_ref().is_some_and(|comment| {
            !comment.deleted
                && !journal
                    .iter()
                    .any(|c| c.comment.as_ref().is_some_and(|old| old.id == comment.id))
        });

        self.append_with_retry(repo, number, &change)?;

        if is_new_comment {
            if let Some(comment) = &change.comment {
                self.note_comment(repo, number, comment, &change.author);
            }
        }

        let model = self.materialized(repo, number)?;
        self.refresh_index(&model);
        Ok(model)
    }

    /// Materialize a ticket. `Ok(None)` for an unknown number or a
    /// reserved number with an empty journal.
    ///
    /// # Errors
    ///
    /// Backend failures only; absence is not an error.
    pub fn get_ticket(&self, repo: &str, number: u64) -> Result<Option<TicketModel>, TicketError> {
        match self.store.journal(repo, number) {
            Ok(journal) => Ok(materialize(repo, number, &journal)),
            Err(TicketError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The raw ordered journal of a ticket.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`] for an unknown ticket.
    pub fn get_journal(&self, repo: &str, number: u64) -> Result<Vec<Change>, TicketError> {
        self.store.journal(repo, number)
    }

    /// Every materialized ticket of the repository, ascending by number,
    /// optionally filtered.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    pub fn get_tickets(
        &self,
        repo: &str,
        filter: Option<&dyn Fn(&TicketModel) -> bool>,
    ) -> Result<Vec<TicketModel>, TicketError> {
        let mut tickets = Vec::new();
        for number in self.store.ticket_numbers(repo)? {
            let Some(ticket) = self.get_ticket(repo, number)? else {
                continue;
            };
            if filter.is_none_or(|keep| keep(&ticket)) {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }

    /// Sorted assigned ticket numbers.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    pub fn get_ids(&self, repo: &str) -> Result<Vec<u64>, TicketError> {
        self.store.ticket_numbers(repo)
    }

    #[must_use]
    pub fn has_ticket(&self, repo: &str, number: u64) -> bool {
        self.store.has_ticket(repo, number)
    }

    /// Delete a ticket from the store and the index. Returns whether it
    /// existed. The number is never reused.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    pub fn delete_ticket(
        &self,
        repo: &str,
        number: u64,
        deleted_by: &str,
    ) -> Result<bool, TicketError> {
        let existed = self.store.delete_ticket(repo, number)?;
        if existed {
            if let Err(err) = self.indexer()?.delete(repo, number) {
                tracing::warn!(repo, number, %err, "failed to drop ticket from index");
            }
            tracing::info!(repo, number, deleted_by, "deleted ticket");
        }
        Ok(existed)
    }

    // -- comments -----------------------------------------------------------

    /// Revise a comment's text. The journal entry that introduced the
    /// comment is never rewritten; the revision is itself a change.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for an unknown comment id or empty
    /// replacement text.
    pub fn update_comment(
        &self,
        repo: &str,
        number: u64,
        comment_id: &str,
        updated_by: &str,
        text: &str,
    ) -> Result<TicketModel, TicketError> {
        if text.trim().is_empty() {
            return Err(TicketError::InvalidChange(
                "comment text must not be empty".into(),
            ));
        }
        self.amend_comment(
            repo,
            number,
            comment_id,
            updated_by,
            Comment {
                id: comment_id.to_string(),
                text: text.to_string(),
                deleted: false,
            },
        )
    }

    /// Clear a comment. The change remains in the journal; the
    /// materialized comment disappears.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for an unknown comment id.
    pub fn delete_comment(
        &self,
        repo: &str,
        number: u64,
        comment_id: &str,
        deleted_by: &str,
    ) -> Result<TicketModel, TicketError> {
        self.amend_comment(
            repo,
            number,
            comment_id,
            deleted_by,
            Comment {
                id: comment_id.to_string(),
                text: String::new(),
                deleted: true,
            },
        )
    }

    fn amend_comment(
        &self,
        repo: &str,
        number: u64,
        comment_id: &str,
        author: &str,
        comment: Comment,
    ) -> Result<TicketModel, TicketError> {
        let journal = self.store.journal(repo, number)?;
        let known = journal
            .iter()
            .any(|c| c.comment.as_ref().is_some_and(|old| old.id == comment_id));
        if !known {
            return Err(TicketError::InvalidChange(format!(
                "no comment {comment_id} on {repo}#{number}"
            )));
        }

        let mut change = Change::new(author);
        change.comment = Some(comment);
        self.append_with_retry(repo, number, &change)?;

        let model = self.materialized(repo, number)?;
        self.refresh_index(&model);
        Ok(model)
    }

    // -- attachments --------------------------------------------------------

    /// Latest attachment with the given name, if any.
    ///
    /// # Errors
    ///
    /// Backend failures only; absence is not an error.
    pub fn get_attachment(
        &self,
        repo: &str,
        number: u64,
        name: &str,
    ) -> Result<Option<Attachment>, TicketError> {
        Ok(self
            .get_ticket(repo, number)?
            .and_then(|ticket| ticket.attachment(name).cloned()))
    }

    // -- milestones ---------------------------------------------------------

    /// Create a milestone.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for an empty or duplicate name.
    pub fn create_milestone(
        &self,
        repo: &str,
        name: &str,
        created_by: &str,
    ) -> Result<Milestone, TicketError> {
        if name.trim().is_empty() {
            return Err(TicketError::InvalidChange(
                "milestone name must not be empty".into(),
            ));
        }
        if self.get_milestone(repo, name)?.is_some() {
            return Err(TicketError::InvalidChange(format!(
                "milestone {name} already exists in {repo}"
            )));
        }
        let milestone = Milestone::new(name);
        self.store.put_milestone(repo, &milestone)?;
        tracing::info!(repo, name, created_by, "created milestone");
        Ok(milestone)
    }

    /// # Errors
    ///
    /// Backend failures only.
    pub fn get_milestone(&self, repo: &str, name: &str) -> Result<Option<Milestone>, TicketError> {
        Ok(self
            .store
            .milestones(repo)?
            .into_iter()
            .find(|m| m.name == name))
    }

    /// # Errors
    ///
    /// Backend failures only.
    pub fn get_milestones(&self, repo: &str) -> Result<Vec<Milestone>, TicketError> {
        self.store.milestones(repo)
    }

    /// Overwrite a milestone's status, color, or due date.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`]-free: upserts. Backend failures only.
    pub fn update_milestone(&self, repo: &str, milestone: &Milestone) -> Result<(), TicketError> {
        self.store.put_milestone(repo, milestone)
    }

    /// Rename a milestone and cascade the new name onto every ticket that
    /// carried the old one. Open affected tickets are queued for
    /// notification. Returns false for an unknown milestone.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for an empty new name; backend
    /// failures from the cascade.
    pub fn rename_milestone(
        &self,
        repo: &str,
        old_name: &str,
        new_name: &str,
        renamed_by: &str,
    ) -> Result<bool, TicketError> {
        if new_name.trim().is_empty() {
            return Err(TicketError::InvalidChange(
                "new milestone name must not be empty".into(),
            ));
        }
        let Some(old) = self.get_milestone(repo, old_name)? else {
            return Ok(false);
        };

        let renamed = Milestone {
            name: new_name.to_string(),
            status: old.status,
            color: old.color,
            due: old.due,
        };
        self.store.put_milestone(repo, &renamed)?;
        self.store.remove_milestone(repo, old_name)?;

        self.cascade_milestone(repo, old_name, new_name, renamed_by)?;
        tracing::info!(repo, old_name, new_name, renamed_by, "renamed milestone");
        Ok(true)
    }

    /// Delete a milestone and clear it from every ticket that carried it.
    /// Open affected tickets are queued for notification. Returns false
    /// for an unknown milestone.
    ///
    /// # Errors
    ///
    /// Backend failures from the cascade.
    pub fn delete_milestone(
        &self,
        repo: &str,
        name: &str,
        deleted_by: &str,
    ) -> Result<bool, TicketError> {
        if self.get_milestone(repo, name)?.is_none() {
            return Ok(false);
        }
        self.store.remove_milestone(repo, name)?;
        self.cascade_milestone(repo, name, "", deleted_by)?;
        tracing::info!(repo, name, deleted_by, "deleted milestone");
        Ok(true)
    }

    fn cascade_milestone(
        &self,
        repo: &str,
        old_name: &str,
        new_value: &str,
        author: &str,
    ) -> Result<(), TicketError> {
        let notifier = self.create_notifier();
        let affected =
            self.get_tickets(repo, Some(&|t| t.milestone.as_deref() == Some(old_name)))?;
        for ticket in affected {
            let mut change = Change::new(author);
            change.set_field(Field::Milestone, new_value);
            let updated = self.update_ticket(repo, ticket.number, change)?;
            if updated.is_open() {
                notifier.queue_mailing(&updated);
            }
        }
        notifier.send_all();
        Ok(())
    }

    // -- labels -------------------------------------------------------------

    /// Create a label.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for an empty or duplicate name.
    pub fn create_label(
        &self,
        repo: &str,
        name: &str,
        created_by: &str,
    ) -> Result<Label, TicketError> {
        if name.trim().is_empty() {
            return Err(TicketError::InvalidChange(
                "label name must not be empty".into(),
            ));
        }
        if self.get_label(repo, name)?.is_some() {
            return Err(TicketError::InvalidChange(format!(
                "label {name} already exists in {repo}"
            )));
        }
        let label = Label::new(name);
        self.store.put_label(repo, &label)?;
        tracing::info!(repo, name, created_by, "created label");
        Ok(label)
    }

    /// # Errors
    ///
    /// Backend failures only.
    pub fn get_label(&self, repo: &str, name: &str) -> Result<Option<Label>, TicketError> {
        Ok(self.store.labels(repo)?.into_iter().find(|l| l.name == name))
    }

    /// # Errors
    ///
    /// Backend failures only.
    pub fn get_labels(&self, repo: &str) -> Result<Vec<Label>, TicketError> {
        self.store.labels(repo)
    }

    /// Overwrite a label's color.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    pub fn update_label(&self, repo: &str, label: &Label) -> Result<(), TicketError> {
        self.store.put_label(repo, label)
    }

    /// Rename a label and swap it on every ticket that carried the old
    /// name. Returns false for an unknown label.
    ///
    /// # Errors
    ///
    /// [`TicketError::InvalidChange`] for an empty new name; backend
    /// failures from the cascade.
    pub fn rename_label(
        &self,
        repo: &str,
        old_name: &str,
        new_name: &str,
        renamed_by: &str,
    ) -> Result<bool, TicketError> {
        if new_name.trim().is_empty() {
            return Err(TicketError::InvalidChange(
                "new label name must not be empty".into(),
            ));
        }
        let Some(old) = self.get_label(repo, old_name)? else {
            return Ok(false);
        };

        self.store.put_label(
            repo,
            &Label {
                name: new_name.to_string(),
                color: old.color,
            },
        )?;
        self.store.remove_label(repo, old_name)?;

        let affected = self.get_tickets(repo, Some(&|t| t.has_label(old_name)))?;
        for ticket in affected {
            let mut change = Change::new(renamed_by);
            change.unlabel(old_name);
            change.label(new_name);
            self.update_ticket(repo, ticket.number, change)?;
        }
        tracing::info!(repo, old_name, new_name, renamed_by, "renamed label");
        Ok(true)
    }

    /// Delete a label record. Tickets keep any label text they carry.
    /// Returns false for an unknown label.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    pub fn delete_label(
        &self,
        repo: &str,
        name: &str,
        deleted_by: &str,
    ) -> Result<bool, TicketError> {
        let removed = self.store.remove_label(repo, name)?;
        if removed {
            tracing::info!(repo, name, deleted_by, "deleted label");
        }
        Ok(removed)
    }

    // -- search -------------------------------------------------------------

    /// Rebuild the repository's search documents from the change log.
    /// Idempotent; a concurrent writer's upsert lands after the rebuild.
    ///
    /// # Errors
    ///
    /// Backend or index failures.
    pub fn reindex(&self, repo: &str) -> Result<(), TicketError> {
        let tickets = self.get_tickets(repo, None)?;
        self.indexer()?
            .reindex(repo, &tickets)
            .map_err(index_unavailable)
    }

    /// Ranked free-text search within one repository.
    ///
    /// # Errors
    ///
    /// Index failures.
    pub fn search_for(
        &self,
        repo: &str,
        text: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<QueryResult>, TicketError> {
        self.indexer()?
            .search_for(repo, text, page, page_size)
            .map_err(index_unavailable)
    }

    /// Structured query with paging and sort, cross-repository unless the
    /// query pins one.
    ///
    /// # Errors
    ///
    /// Index failures.
    pub fn query_for(
        &self,
        query: &IndexQuery,
        page: usize,
        page_size: usize,
        sort_by: SortBy,
        descending: bool,
    ) -> Result<Vec<QueryResult>, TicketError> {
        self.indexer()?
            .query_for(query, page, page_size, sort_by, descending)
            .map_err(index_unavailable)
    }

    // -- shared internals ---------------------------------------------------

    pub(crate) fn materialized(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<TicketModel, TicketError> {
        let journal = self.store.journal(repo, number)?;
        materialize(repo, number, &journal).ok_or_else(|| TicketError::not_found(repo, number))
    }

    /// Read-modify-append with the bounded optimistic-concurrency retry.
    pub(crate) fn append_with_retry(
        &self,
        repo: &str,
        number: u64,
        change: &Change,
    ) -> Result<u64, TicketError> {
        let mut last = TicketError::VersionConflict {
            expected: 0,
            actual: 0,
        };
        for attempt in 0..self.update_retries {
            let version = self.store.version(repo, number)?;
            match self.store.append(repo, number, version, change) {
                Ok(new_version) => return Ok(new_version),
                Err(err @ TicketError::VersionConflict { .. }) => {
                    tracing::debug!(repo, number, attempt, "lost append race, retrying");
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        tracing::warn!(repo, number, retries = self.update_retries, "append retries exhausted");
        Err(last)
    }

    /// Upsert the ticket's search document, logging instead of failing:
    /// the index is a derived cache and a lagging document is recoverable
    /// via `reindex`.
    pub(crate) fn refresh_index(&self, ticket: &TicketModel) {
        let result = self
            .indexer()
            .and_then(|idx| idx.index_ticket(ticket).map_err(index_unavailable));
        if let Err(err) = result {
            tracing::warn!(
                repository = %ticket.repository,
                number = ticket.number,
                %err,
                "failed to refresh ticket search document"
            );
        }
    }

    pub(crate) fn indexer(&self) -> Result<MutexGuard<'_, TicketIndexer>, TicketError> {
        self.indexer
            .lock()
            .map_err(|_| TicketError::BackendUnavailable("ticket index mutex poisoned".into()))
    }
}

fn index_unavailable(err: anyhow::Error) -> TicketError {
    TicketError::BackendUnavailable(format!("ticket index: {err:#}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
