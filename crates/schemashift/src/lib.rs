//! Schema-diff-driven migrations for Postgres.
//!
//! Instead of hand-written migration files, schemashift compares a declarative
//! model against the live catalog and derives the changes:
//!
//! - [`compile`] turns model text into a target [`Schema`]
//! - [`catalog::snapshot`] reads the current [`Schema`] from a database
//! - [`diff`] produces a dependency-ordered [`Changeset`]
//! - [`ChangeTracker`] filters out units the ledger already shows as applied
//! - [`Executor`] applies the rest, one transaction per unit
//!
//! [`Migrator`] strings these together under an advisory lock:
//!
//! ```ignore
//! let session = Session::connect(&config.database, &config.timeouts).await?;
//! let target = schemashift::compile(&model_text)?;
//! let tracker = ChangeTracker::new(FileLedger::new(".schemashift/ledger.jsonl"));
//! let summary = Migrator::new(&session, &config).run(&target, &tracker).await?;
//! session.close().await;
//! ```
//!
//! # Ledger semantics
//!
//! Change unit ids are content hashes of (object, operation, definition), so
//! re-running against an unchanged model finds nothing to do. A unit whose id
//! is in the ledger with a different checksum is drift and stops the run.

pub mod catalog;
mod change;
mod ddl;
mod diff;
mod error;
mod executor;
mod ledger;
mod lock;
mod migrate;
mod model;
pub mod schema;
mod session;
pub mod solver;

pub use change::{ChangeUnit, Changeset, Operation, Phase, UnitRef};
pub use diff::{ColumnChange, diff, diff_columns};
pub use error::{Error, ModelError, PartialApply, Result};
pub use executor::{CancelFlag, Executor, UnitOutcome, run_in_transaction};
pub use ledger::{
    ChangeRecord, ChangeTracker, FileLedger, LedgerStore, MemoryLedger, Outcome, TableLedger,
    filter_pending,
};
pub use lock::AdvisoryLock;
pub use migrate::{Migrator, Plan, RunSummary};
pub use model::compile;
pub use schema::{Column, ColumnType, ObjectKind, Schema, SchemaObject};
pub use session::{Session, Target};

// Re-export config types so callers need one import.
pub use schemashift_config::{Config, ConfigError, ConnectionDescriptor, LedgerConfig, Timeouts};
