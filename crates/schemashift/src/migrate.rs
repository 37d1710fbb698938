//! Run orchestration.
//!
//! A run holds the advisory lock for its whole duration:
//!
//! ```text
//! lock -> before script -> snapshot -> diff -> filter through ledger
//!      -> apply -> after script -> unlock
//! ```
//!
//! Nothing is cached between runs; every run diffs against a fresh snapshot.

use std::time::Duration;

use schemashift_config::Config;
use serde::Serialize;

use crate::catalog;
use crate::change::Changeset;
use crate::diff::diff;
use crate::error::{Error, PartialApply};
use crate::executor::{CancelFlag, Executor, UnitOutcome, run_in_transaction};
use crate::ledger::{ChangeTracker, LedgerStore};
use crate::lock::AdvisoryLock;
use crate::schema::Schema;
use crate::session::Session;

/// The result of comparing a target against the live database.
#[derive(Debug, Clone)]
pub struct Plan {
    pub catalog: Schema,
    /// Everything that differs.
    pub changeset: Changeset,
    /// The part of `changeset` the ledger does not show as applied.
    pub pending: Changeset,
}

impl Plan {
    pub fn already_applied(&self) -> usize {
        self.changeset.len() - self.pending.len()
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub applied: usize,
    pub failed: usize,
    /// Units the ledger already showed as applied.
    pub skipped: usize,
    /// Units not started because of cancellation or an earlier failure.
    pub not_attempted: usize,
    pub cancelled: bool,
    pub outcomes: Vec<UnitOutcome>,
}

impl RunSummary {
    fn from_outcomes(outcomes: Vec<UnitOutcome>, skipped: usize) -> Self {
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::Applied { .. }))
            .count();
        let not_attempted = outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::Skipped { .. }))
            .count();
        Self {
            applied,
            failed: 0,
            skipped,
            not_attempted,
            cancelled: not_attempted > 0,
            outcomes,
        }
    }

    fn from_partial(partial: PartialApply, skipped: usize) -> Self {
        let mut outcomes: Vec<UnitOutcome> = partial
            .applied
            .into_iter()
            .map(|unit| UnitOutcome::Applied { unit })
            .collect();
        let applied = outcomes.len();
        outcomes.push(UnitOutcome::Failed {
            unit: partial.failed,
            error: partial.cause.to_string(),
        });
        let not_attempted = partial.not_attempted.len();
        outcomes.extend(
            partial
                .not_attempted
                .into_iter()
                .map(|unit| UnitOutcome::Skipped { unit }),
        );
        Self {
            applied,
            failed: 1,
            skipped,
            not_attempted,
            cancelled: false,
            outcomes,
        }
    }

    /// Fold an executor result into a summary. Retryable failures stay errors.
    fn from_apply(result: Result<Vec<UnitOutcome>, Error>, skipped: usize) -> Result<Self, Error> {
        match result {
            Ok(outcomes) => Ok(Self::from_outcomes(outcomes, skipped)),
            Err(Error::PartialApply(partial)) if !partial.cause.is_retryable() => {
                Ok(Self::from_partial(*partial, skipped))
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// 0 when everything ran, 2 when the database was left partly migrated,
    /// 1 when a cancelled run changed nothing.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else if self.failed > 0 || self.applied > 0 {
            2
        } else {
            1
        }
    }
}

/// Drives plans and runs against one database.
pub struct Migrator<'a> {
    session: &'a Session,
    namespace: String,
    ignored: Vec<String>,
    lock_key: i64,
    lock_timeout: Duration,
    before: Option<String>,
    after: Option<String>,
    cancel: CancelFlag,
}

impl<'a> Migrator<'a> {
    pub fn new(session: &'a Session, config: &Config) -> Self {
        Self {
            session,
            namespace: config.schema.clone(),
            ignored: config.ignored_objects(),
            lock_key: config.lock_key,
            lock_timeout: config.timeouts.lock(),
            before: None,
            after: None,
            cancel: CancelFlag::new(),
        }
    }

    /// SQL to run before the snapshot and after a fully successful apply.
    pub fn with_scripts(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Snapshot, diff and filter, without changing anything.
    pub async fn plan<L: LedgerStore>(
        &self,
        target: &Schema,
        tracker: &ChangeTracker<L>,
    ) -> Result<Plan, Error> {
        self.session.set_search_path(&self.namespace).await?;
        let catalog = catalog::snapshot(self.session, &self.namespace, &self.ignored).await?;
        let changeset = diff(target, &catalog)?;
        let pending = tracker.pending(&changeset).await?;
        tracing::info!(
            changes = changeset.len(),
            pending = pending.len(),
            "plan computed"
        );
        Ok(Plan {
            catalog,
            changeset,
            pending,
        })
    }

    /// Apply everything pending under the advisory lock.
    ///
    /// A failed unit is reported in the summary, not as an error. Errors are
    /// reserved for problems that stop the run before or between units, and
    /// for units that failed on a timeout or a lost connection; those come
    /// back as a retryable [`Error::PartialApply`].
    pub async fn run<L: LedgerStore>(
        &self,
        target: &Schema,
        tracker: &ChangeTracker<L>,
    ) -> Result<RunSummary, Error> {
        let lock = AdvisoryLock::acquire(self.session, self.lock_key, self.lock_timeout).await?;
        let result = self.run_locked(target, tracker).await;
        if let Err(e) = lock.release(self.session).await {
            tracing::warn!(error = %e, "could not release advisory lock; it goes away with the session");
        }
        result
    }

    async fn run_locked<L: LedgerStore>(
        &self,
        target: &Schema,
        tracker: &ChangeTracker<L>,
    ) -> Result<RunSummary, Error> {
        if let Some(sql) = &self.before {
            tracing::info!("running before script");
            run_in_transaction(self.session, sql).await?;
        }

        let plan = self.plan(target, tracker).await?;
        let skipped = plan.already_applied();
        if plan.pending.is_empty() {
            tracing::info!(skipped, "schema is up to date");
        }

        let executor = Executor::new(self.session, tracker).with_cancel(self.cancel.clone());
        let summary = RunSummary::from_apply(executor.apply(&plan.pending).await, skipped)?;

        if summary.is_success()
            && let Some(sql) = &self.after
        {
            tracing::info!("running after script");
            run_in_transaction(self.session, sql).await?;
        }

        tracing::info!(
            applied = summary.applied,
            failed = summary.failed,
            skipped = summary.skipped,
            not_attempted = summary.not_attempted,
            "run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Operation, UnitRef};

    fn unit(object: &str) -> UnitRef {
        UnitRef {
            id: object.to_string(),
            object: object.to_string(),
            operation: Operation::CreateTable,
        }
    }

    #[test]
    fn test_summary_of_partial_apply() {
        let summary = RunSummary::from_partial(
            PartialApply {
                failed: unit("b"),
                cause: Error::Sql("boom".into()),
                applied: vec![unit("a")],
                not_attempted: vec![unit("c")],
                ledger_error: None,
            },
            4,
        );
        assert_eq!(
            (summary.applied, summary.failed, summary.skipped, summary.not_attempted),
            (1, 1, 4, 1)
        );
        assert_eq!(summary.exit_code(), 2);
        assert!(matches!(
            &summary.outcomes[1],
            UnitOutcome::Failed { error, .. } if error == "sql error: boom"
        ));
    }

    #[test]
    fn test_timed_out_unit_is_an_error() {
        let partial = |cause: Error| -> Result<Vec<UnitOutcome>, Error> {
            Err(Error::PartialApply(Box::new(PartialApply {
                failed: unit("b"),
                cause,
                applied: vec![unit("a")],
                not_attempted: Vec::new(),
                ledger_error: None,
            })))
        };

        let timeout = Error::Timeout {
            operation: "statement",
            after: Duration::from_secs(1),
        };
        let err = RunSummary::from_apply(partial(timeout), 0).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));

        let summary = RunSummary::from_apply(partial(Error::Sql("boom".into())), 0).unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_exit_codes() {
        let clean = RunSummary::from_outcomes(vec![UnitOutcome::Applied { unit: unit("a") }], 0);
        assert_eq!(clean.exit_code(), 0);

        let cancelled_early =
            RunSummary::from_outcomes(vec![UnitOutcome::Skipped { unit: unit("a") }], 0);
        assert!(cancelled_early.cancelled);
        assert_eq!(cancelled_early.exit_code(), 1);

        let cancelled_midway = RunSummary::from_outcomes(
            vec![
                UnitOutcome::Applied { unit: unit("a") },
                UnitOutcome::Skipped { unit: unit("b") },
            ],
            0,
        );
        assert_eq!(cancelled_midway.exit_code(), 2);
    }
}
