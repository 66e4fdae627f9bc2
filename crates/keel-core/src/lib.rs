//! keel-core library.
//!
//! The data model of the ticket tracking engine: immutable [`Change`]
//! records, the pure materializer that folds a journal into a
//! [`TicketModel`], ticket-number mention extraction, and the shared error
//! taxonomy.
//!
//! # Conventions
//!
//! - **Errors**: typed [`TicketError`] for the engine taxonomy; journal
//!   (de)serialization failures surface as [`TicketError::CorruptJournal`].
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod change;
pub mod error;
pub mod journal;
pub mod mention;
pub mod records;
pub mod status;
pub mod ticket;

pub use change::{Attachment, Change, Comment, Field, Patchset, PatchsetKind, Reference};
pub use error::TicketError;
pub use mention::extract_mentions;
pub use records::{Label, Milestone};
pub use status::{Kind, Priority, Severity, Status};
pub use ticket::{materialize, TicketModel};
