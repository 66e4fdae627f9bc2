//! Notification hand-off.
//!
//! The service never composes messages. A [`Notifier`] collects
//! `(ticket, latest change)` pairs and flushes them to a
//! [`NotificationSink`], the seam behind which the mail subsystem lives.

use keel_core::{Change, TicketModel};
use std::sync::{Arc, Mutex};

/// One queued outbound notification.
#[derive(Debug, Clone)]
pub struct Mailing {
    pub ticket: TicketModel,
    pub change: Change,
}

/// Consumer of queued mailings. Formatting and transport are out of scope
/// here; implementations own both.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, mailing: &Mailing);
}

/// Default sink: records the hand-off in the log and drops the mailing.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, mailing: &Mailing) {
        tracing::info!(
            repository = %mailing.ticket.repository,
            number = mailing.ticket.number,
            author = %mailing.change.author,
            "ticket notification queued for delivery"
        );
    }
}

/// Per-operation mailing queue.
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    queue: Mutex<Vec<Mailing>>,
}

impl Notifier {
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Queue a mailing for the ticket's most recent change. Returns the
    /// queued mailing, or `None` for a ticket with an empty journal.
    pub fn queue_mailing(&self, ticket: &TicketModel) -> Option<Mailing> {
        let change = ticket.changes.last()?.clone();
        let mailing = Mailing {
            ticket: ticket.clone(),
            change,
        };
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(mailing.clone());
        }
        Some(mailing)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().map_or(0, |queue| queue.len())
    }

    /// Flush every queued mailing to the sink, returning how many were
    /// delivered.
    pub fn send_all(&self) -> usize {
        let drained: Vec<Mailing> = self
            .queue
            .lock()
            .map_or_else(|_| Vec::new(), |mut queue| queue.drain(..).collect());
        for mailing in &drained {
            self.sink.deliver(mailing);
        }
        drained.len()
    }
}
