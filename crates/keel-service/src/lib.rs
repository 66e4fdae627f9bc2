//! keel-service library.
//!
//! The ticket service facade ([`TicketService`]) and the reference
//! integrity engine behind it. The facade orchestrates the storage
//! backend, the search index, the reachability oracle, and the notifier
//! into one operation set: ticket CRUD, comments, milestones, labels,
//! patchsets, attachments, search, and push/branch-deletion
//! reconciliation.
//!
//! # Conventions
//!
//! - **Errors**: the shared [`keel_core::TicketError`] taxonomy; `anyhow`
//!   only at the configuration boundary.
//! - **Logging**: `tracing` macros at operation boundaries. No subscriber
//!   is installed here; hosts own that.

pub mod config;
pub mod engine;
pub mod notify;
pub mod oracle;
pub mod service;

pub use config::{BackendKind, ServiceConfig};
pub use notify::{LogSink, Mailing, NotificationSink, Notifier};
pub use oracle::{MemoryGraph, ReachabilityOracle};
pub use service::TicketService;
