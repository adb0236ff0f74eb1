//! buffmgr: file lifecycle tracking and batch ingestion.
//!
//! Files arriving in a staging area are discovered by the [`finder`],
//! recorded in the event store, and attempted by the [`scheduler`] through a
//! pluggable [`backend`]. Every state change is an appended event, so the
//! store doubles as an audit log and as the recovery point after a crash.

pub mod actions;
pub mod backend;
pub mod backfill;
pub mod cancel;
pub mod check;
pub mod checksum;
pub mod cleaner;
pub mod config;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod finder;
pub mod patterns;
pub mod report;
pub mod rerun;
pub mod scheduler;
pub mod worker;

pub use backend::{BackendRegistry, IngestBackend, IngestOutcome};
pub use cancel::CancellationToken;
pub use config::Config;
pub use error::{EndpointError, Result};
pub use finder::Finder;
pub use scheduler::Ingester;

pub use buffmgr_db as db;
