//! Change tracking - the append-only ledger of applied units.
//!
//! The tracker decides which units of a freshly computed changeset still
//! need to run. A unit is done when the ledger holds an `applied` record
//! with its id, no later `applied` record touches the same object, and no
//! earlier pending unit of the same changeset touches it either. A matching
//! id with a different checksum is drift.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::change::{ChangeUnit, Changeset};
use crate::error::Error;
use crate::session::Session;

/// Result of executing a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Failed => "failed",
        }
    }

    fn from_name(name: &str) -> Option<Outcome> {
        match name {
            "applied" => Some(Outcome::Applied),
            "failed" => Some(Outcome::Failed),
            _ => None,
        }
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub unit_id: String,
    pub object: String,
    pub operation: String,
    pub applied_at: DateTime<Utc>,
    /// Checksum of the forward SQL that ran.
    pub checksum: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChangeRecord {
    pub fn new(unit: &ChangeUnit, outcome: Outcome, error: Option<String>) -> Self {
        Self {
            unit_id: unit.id.clone(),
            object: unit.object.clone(),
            operation: unit.operation.to_string(),
            applied_at: Utc::now(),
            checksum: unit.checksum(),
            outcome,
            error,
        }
    }
}

/// Durable, append-only storage for change records.
pub trait LedgerStore: Send + Sync {
    /// Append one record. Must be durable when the future resolves.
    fn append_record(&self, record: &ChangeRecord) -> impl Future<Output = Result<(), Error>> + Send;

    /// All records, oldest first.
    fn scan_records(&self) -> impl Future<Output = Result<Vec<ChangeRecord>, Error>> + Send;
}

/// Filter `changeset` down to the units the ledger does not show as done.
pub fn filter_pending(changeset: &Changeset, records: &[ChangeRecord]) -> Result<Changeset, Error> {
    let mut latest_by_unit: HashMap<&str, usize> = HashMap::new();
    let mut latest_by_object: HashMap<&str, usize> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        if record.outcome == Outcome::Applied {
            latest_by_unit.insert(record.unit_id.as_str(), i);
            latest_by_object.insert(record.object.as_str(), i);
        }
    }

    // A recreate after a pending drop of the same object must run even when
    // its id was recorded for an earlier create.
    let mut touched: HashSet<&str> = HashSet::new();
    let mut keep = Vec::with_capacity(changeset.len());
    for unit in changeset {
        let done = match latest_by_unit.get(unit.id.as_str()) {
            _ if touched.contains(unit.object.as_str()) => false,
            Some(&i) => {
                let superseded = latest_by_object
                    .get(unit.object.as_str())
                    .is_some_and(|&j| j > i);
                if superseded {
                    false
                } else {
                    let record = &records[i];
                    let computed = unit.checksum();
                    if record.checksum != computed {
                        return Err(Error::Drift {
                            unit_id: unit.id.clone(),
                            object: unit.object.clone(),
                            operation: unit.operation.to_string(),
                            recorded: record.checksum.clone(),
                            computed,
                        });
                    }
                    true
                }
            }
            None => false,
        };
        if !done {
            touched.insert(unit.object.as_str());
        }
        keep.push(!done);
    }

    let mut flags = keep.into_iter();
    Ok(changeset.retain(|_| flags.next().unwrap_or(true)))
}

/// Ledger-backed view of which units are still pending.
pub struct ChangeTracker<L> {
    store: L,
}

impl<L: LedgerStore> ChangeTracker<L> {
    pub fn new(store: L) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &L {
        &self.store
    }

    /// Units of `changeset` that have not been applied yet.
    pub async fn pending(&self, changeset: &Changeset) -> Result<Changeset, Error> {
        let records = self.store.scan_records().await?;
        filter_pending(changeset, &records)
    }

    /// Append the outcome of a unit to the ledger.
    pub async fn record(
        &self,
        unit: &ChangeUnit,
        outcome: Outcome,
        error: Option<String>,
    ) -> Result<ChangeRecord, Error> {
        let record = ChangeRecord::new(unit, outcome, error);
        self.store.append_record(&record).await?;
        tracing::debug!(unit = %unit.to_ref(), outcome = outcome.as_str(), "recorded");
        Ok(record)
    }

    pub async fn records(&self) -> Result<Vec<ChangeRecord>, Error> {
        self.store.scan_records().await
    }
}

/// In-process ledger for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<ChangeRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ChangeRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ChangeRecord>>, Error> {
        self.records
            .lock()
            .map_err(|_| Error::Ledger("memory ledger lock poisoned".to_string()))
    }
}

impl LedgerStore for MemoryLedger {
    async fn append_record(&self, record: &ChangeRecord) -> Result<(), Error> {
        self.lock()?.push(record.clone());
        Ok(())
    }

    async fn scan_records(&self) -> Result<Vec<ChangeRecord>, Error> {
        Ok(self.lock()?.clone())
    }
}

/// Ledger kept as a JSON-lines file, synced after every append.
#[derive(Debug, Clone)]
pub struct FileLedger {
    path: Utf8PathBuf,
}

impl FileLedger {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LedgerStore for FileLedger {
    async fn append_record(&self, record: &ChangeRecord) -> Result<(), Error> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| Error::Ledger(format!("cannot encode record: {e}")))?;
        line.push('\n');

        if let Some(parent) = self.path.parent()
            && !parent.as_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn scan_records(&self) -> Result<Vec<ChangeRecord>, Error> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .map_err(|e| Error::Ledger(format!("{}:{}: {}", self.path, n + 1, e)))
            })
            .collect()
    }
}

/// Ledger kept in a table of the target database.
pub struct TableLedger<'a> {
    session: &'a Session,
    table: String,
}

impl<'a> TableLedger<'a> {
    pub fn new(session: &'a Session, table: impl Into<String>) -> Self {
        Self {
            session,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether the ledger table exists on the current `search_path`.
    pub async fn exists(&self) -> Result<bool, Error> {
        let row = self
            .session
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL",
                &[&schemashift_sql::quote_ident(&self.table)],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Create the ledger table if it does not exist yet.
    pub async fn ensure(&self) -> Result<(), Error> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                seq bigserial PRIMARY KEY,\n    \
                unit_id text NOT NULL,\n    \
                object text NOT NULL,\n    \
                operation text NOT NULL,\n    \
                applied_at timestamptz NOT NULL,\n    \
                checksum text NOT NULL,\n    \
                outcome text NOT NULL CHECK (outcome IN ('applied', 'failed')),\n    \
                error text\n\
            )",
            schemashift_sql::quote_ident(&self.table)
        );
        self.session.batch_execute(&sql).await
    }
}

impl LedgerStore for TableLedger<'_> {
    async fn append_record(&self, record: &ChangeRecord) -> Result<(), Error> {
        let sql = format!(
            "INSERT INTO {} (unit_id, object, operation, applied_at, checksum, outcome, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            schemashift_sql::quote_ident(&self.table)
        );
        self.session
            .execute(
                &sql,
                &[
                    &record.unit_id,
                    &record.object,
                    &record.operation,
                    &record.applied_at,
                    &record.checksum,
                    &record.outcome.as_str(),
                    &record.error,
                ],
            )
            .await
            .map_err(|e| Error::Ledger(format!("cannot append to {}: {}", self.table, e)))?;
        Ok(())
    }

    async fn scan_records(&self) -> Result<Vec<ChangeRecord>, Error> {
        let sql = format!(
            "SELECT unit_id, object, operation, applied_at, checksum, outcome, error \
             FROM {} ORDER BY seq",
            schemashift_sql::quote_ident(&self.table)
        );
        let rows = self.session.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                let outcome: String = row.get(5);
                Ok(ChangeRecord {
                    unit_id: row.get(0),
                    object: row.get(1),
                    operation: row.get(2),
                    applied_at: row.get(3),
                    checksum: row.get(4),
                    outcome: Outcome::from_name(&outcome).ok_or_else(|| {
                        Error::Ledger(format!("unknown outcome `{}` in {}", outcome, self.table))
                    })?,
                    error: row.get(6),
                })
            })
            .collect()
    }
}
