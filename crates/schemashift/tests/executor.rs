mod common;

use common::FakeTarget;
use schemashift::{
    CancelFlag, ChangeRecord, ChangeTracker, ChangeUnit, Changeset, Error, Executor, LedgerStore,
    MemoryLedger, Operation, Outcome, PartialApply, UnitOutcome,
};

fn changeset(names: &[&str]) -> Changeset {
    Changeset::from_ordered(
        names
            .iter()
            .map(|n| {
                let sql = format!("CREATE TABLE {} ();", n);
                ChangeUnit::new(Operation::CreateTable, *n, &sql, sql.clone(), None)
            })
            .collect(),
    )
}

fn partial(err: Error) -> Box<PartialApply> {
    match err {
        Error::PartialApply(partial) => partial,
        other => panic!("expected a partial apply, got {:?}", other),
    }
}

/// Accepts applied records and refuses to store failures.
#[derive(Default)]
struct RefusingFailures {
    inner: MemoryLedger,
}

impl LedgerStore for RefusingFailures {
    async fn append_record(&self, record: &ChangeRecord) -> Result<(), Error> {
        if record.outcome == Outcome::Failed {
            return Err(Error::Ledger("connection closed".into()));
        }
        self.inner.append_record(record).await
    }

    async fn scan_records(&self) -> Result<Vec<ChangeRecord>, Error> {
        self.inner.scan_records().await
    }
}

#[tokio::test]
async fn each_unit_runs_in_its_own_transaction() {
    let db = FakeTarget::new();
    let tracker = ChangeTracker::new(MemoryLedger::new());
    let outcomes = Executor::new(&db, &tracker)
        .apply(&changeset(&["a", "b"]))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        db.statements(),
        [
            "BEGIN",
            "CREATE TABLE a ();",
            "COMMIT",
            "BEGIN",
            "CREATE TABLE b ();",
            "COMMIT"
        ]
    );
    assert_eq!(tracker.records().await.unwrap().len(), 2);
}

#[tokio::test]
async fn failure_stops_and_rolls_back() {
    let db = FakeTarget::new();
    db.fail_on(Some("TABLE b"));
    let tracker = ChangeTracker::new(MemoryLedger::new());
    let err = Executor::new(&db, &tracker)
        .apply(&changeset(&["a", "b", "c"]))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());

    let partial = partial(err);
    assert_eq!(partial.failed.object, "b");
    assert_eq!(partial.applied.len(), 1);
    assert_eq!(partial.not_attempted[0].object, "c");
    assert!(matches!(partial.cause, Error::Sql(_)));
    assert_eq!(partial.ledger_error, None);

    let statements = db.statements();
    assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    assert!(!statements.iter().any(|s| s.contains("TABLE c")));

    let records = tracker.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].outcome, Outcome::Applied);
    assert_eq!(records[1].outcome, Outcome::Failed);
    assert!(records[1].error.as_deref().unwrap().contains("cannot run"));
}

#[tokio::test]
async fn timed_out_unit_stays_retryable() {
    let db = FakeTarget::new();
    db.time_out_on("TABLE b");
    let tracker = ChangeTracker::new(MemoryLedger::new());
    let err = Executor::new(&db, &tracker)
        .apply(&changeset(&["a", "b"]))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let partial = partial(err);
    assert!(matches!(partial.cause, Error::Timeout { .. }));
    assert_eq!(partial.applied[0].object, "a");

    let records = tracker.records().await.unwrap();
    assert_eq!(records[1].outcome, Outcome::Failed);
    assert!(records[1].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn unrecorded_failure_still_reports_committed_units() {
    let db = FakeTarget::new();
    db.fail_on(Some("TABLE b"));
    let tracker = ChangeTracker::new(RefusingFailures::default());
    let err = Executor::new(&db, &tracker)
        .apply(&changeset(&["a", "b", "c"]))
        .await
        .unwrap_err();

    let partial = partial(err);
    assert_eq!(partial.failed.object, "b");
    assert_eq!(partial.applied.len(), 1);
    assert_eq!(partial.applied[0].object, "a");
    assert!(partial.ledger_error.as_deref().unwrap().contains("connection closed"));
    assert_eq!(tracker.records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_run_skips_everything() {
    let db = FakeTarget::new();
    let tracker = ChangeTracker::new(MemoryLedger::new());
    let cancel = CancelFlag::new();
    cancel.cancel();
    let outcomes = Executor::new(&db, &tracker)
        .with_cancel(cancel)
        .apply(&changeset(&["a", "b"]))
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| matches!(o, UnitOutcome::Skipped { .. })));
    assert!(db.statements().is_empty());
    assert!(tracker.records().await.unwrap().is_empty());
}
