//! Executor - applies a changeset one unit per transaction.
//!
//! Each unit runs as `BEGIN; <forward sql>; COMMIT` and its outcome is
//! appended to the ledger right after. The first failure stops the run:
//! the failure is recorded, committed units stay committed, and the caller
//! gets [`Error::PartialApply`]. Cancellation is checked between units only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::Instrument;

use crate::change::{ChangeUnit, Changeset, UnitRef};
use crate::error::{Error, PartialApply};
use crate::ledger::{ChangeTracker, LedgerStore, Outcome};
use crate::session::Target;

/// Shared flag that asks a running executor to stop before the next unit.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Applied { unit: UnitRef },
    Failed { unit: UnitRef, error: String },
    /// Not started because the run was cancelled or stopped at a failure.
    Skipped { unit: UnitRef },
}

impl UnitOutcome {
    pub fn unit(&self) -> &UnitRef {
        match self {
            UnitOutcome::Applied { unit }
            | UnitOutcome::Failed { unit, .. }
            | UnitOutcome::Skipped { unit } => unit,
        }
    }
}

pub struct Executor<'a, T, L> {
    target: &'a T,
    tracker: &'a ChangeTracker<L>,
    cancel: CancelFlag,
}

impl<'a, T: Target, L: LedgerStore> Executor<'a, T, L> {
    pub fn new(target: &'a T, tracker: &'a ChangeTracker<L>) -> Self {
        Self {
            target,
            tracker,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Apply every unit in order.
    ///
    /// Returns one outcome per unit when nothing failed. On the first
    /// failure, returns [`Error::PartialApply`] naming the failed unit and
    /// all units committed before it.
    pub async fn apply(&self, changeset: &Changeset) -> Result<Vec<UnitOutcome>, Error> {
        let mut outcomes = Vec::with_capacity(changeset.len());
        let mut applied: Vec<UnitRef> = Vec::new();

        for (index, unit) in changeset.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(remaining = changeset.len() - index, "cancelled, not starting remaining units");
                outcomes.extend(
                    changeset.units()[index..]
                        .iter()
                        .map(|u| UnitOutcome::Skipped { unit: u.to_ref() }),
                );
                break;
            }

            let span = tracing::info_span!("unit", unit = %unit.to_ref());
            match self.apply_unit(unit).instrument(span).await {
                Ok(()) => {
                    self.tracker.record(unit, Outcome::Applied, None).await?;
                    tracing::info!(unit = %unit.to_ref(), "applied");
                    applied.push(unit.to_ref());
                    outcomes.push(UnitOutcome::Applied { unit: unit.to_ref() });
                }
                Err(cause) => {
                    let message = cause.to_string();
                    tracing::error!(unit = %unit.to_ref(), error = %message, "unit failed");
                    // The committed units must still reach the caller.
                    let ledger_error = match self
                        .tracker
                        .record(unit, Outcome::Failed, Some(message))
                        .await
                    {
                        Ok(_) => None,
                        Err(e) => {
                            tracing::error!(unit = %unit.to_ref(), error = %e, "could not record failure");
                            Some(e.to_string())
                        }
                    };
                    return Err(Error::PartialApply(Box::new(PartialApply {
                        failed: unit.to_ref(),
                        cause,
                        applied,
                        not_attempted: changeset.units()[index + 1..]
                            .iter()
                            .map(ChangeUnit::to_ref)
                            .collect(),
                        ledger_error,
                    })));
                }
            }
        }

        Ok(outcomes)
    }

    async fn apply_unit(&self, unit: &ChangeUnit) -> Result<(), Error> {
        run_in_transaction(self.target, &unit.forward_sql).await
    }
}

/// Run `sql` between `BEGIN` and `COMMIT`, rolling back on failure.
pub async fn run_in_transaction<T: Target + ?Sized>(target: &T, sql: &str) -> Result<(), Error> {
    target.batch_execute("BEGIN").await?;
    let result = match target.batch_execute(sql).await {
        Ok(()) => target.batch_execute("COMMIT").await,
        Err(e) => Err(e),
    };
    if result.is_err()
        && let Err(rollback) = target.batch_execute("ROLLBACK").await
    {
        tracing::warn!(error = %rollback, "rollback failed");
    }
    result
}
