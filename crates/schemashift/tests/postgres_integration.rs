//! End-to-end runs against a real Postgres.
//!
//! Uses `POSTGRES_HOST` / `POSTGRES_PORT` when set, otherwise starts a
//! container through testcontainers.

#![cfg(feature = "test-postgres")]

use schemashift::{
    ChangeTracker, Config, ConnectionDescriptor, FileLedger, LedgerConfig, MemoryLedger,
    Migrator, ObjectKind, Session, TableLedger, compile,
};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::ContainerAsync;
use testcontainers_modules::testcontainers::runners::AsyncRunner;

const MODEL_V1: &str = r#"
[[table]]
name = "orders"
columns = [
  { name = "id", type = "int", nullable = false },
  { name = "total", type = "numeric" },
]

[[view]]
name = "large_orders"
references = ["orders"]
query = "SELECT id, total FROM orders WHERE total > 100"

[[procedure]]
name = "purge_orders"
references = ["orders"]
arguments = [{ name = "min_total", type = "numeric" }]
language = "sql"
body = "DELETE FROM orders WHERE total < min_total"
"#;

const MODEL_V2: &str = r#"
[[table]]
name = "orders"
columns = [
  { name = "id", type = "bigint", nullable = false },
  { name = "total", type = "numeric(12,2)", nullable = false },
  { name = "placed_at", type = "timestamptz" },
]

[[view]]
name = "large_orders"
references = ["orders"]
query = "SELECT id, total, placed_at FROM orders WHERE total > 100"
"#;

struct Database {
    config: Config,
    _container: Option<ContainerAsync<Postgres>>,
}

async fn database(ledger: LedgerConfig) -> Database {
    let (host, port, container) = match std::env::var("POSTGRES_HOST") {
        Ok(host) => {
            let port = std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432);
            (host, port, None)
        }
        Err(_) => {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap().to_string();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            (host, port, Some(container))
        }
    };

    let mut database = ConnectionDescriptor::new(host, port, "postgres", "postgres");
    database.password = Some("postgres".into());
    let mut config = Config::new(database, "model.toml");
    config.ledger = ledger;
    Database {
        config,
        _container: container,
    }
}

async fn reset(session: &Session) {
    session
        .batch_execute("DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;")
        .await
        .unwrap();
}

#[tokio::test]
async fn migrate_is_idempotent_and_follows_model_changes() {
    let db = database(LedgerConfig::default()).await;
    let session = Session::connect(&db.config.database, &db.config.timeouts)
        .await
        .unwrap();
    reset(&session).await;

    let ledger = TableLedger::new(&session, "schemashift_ledger");
    ledger.ensure().await.unwrap();
    let tracker = ChangeTracker::new(ledger);
    let migrator = Migrator::new(&session, &db.config);

    let v1 = compile(MODEL_V1).unwrap();
    let summary = migrator.run(&v1, &tracker).await.unwrap();
    assert_eq!((summary.applied, summary.failed), (3, 0));

    // The catalog now matches the model, including view and procedure
    // fingerprints.
    let plan = migrator.plan(&v1, &tracker).await.unwrap();
    assert!(plan.changeset.is_empty(), "{}", plan.changeset.preview_sql());
    assert_eq!(
        plan.catalog.get("large_orders").unwrap().kind,
        ObjectKind::View
    );
    assert!(plan.catalog.get("schemashift_ledger").is_none());

    let v2 = compile(MODEL_V2).unwrap();
    let summary = migrator.run(&v2, &tracker).await.unwrap();
    assert_eq!(summary.failed, 0);
    let plan = migrator.plan(&v2, &tracker).await.unwrap();
    assert!(plan.changeset.is_empty(), "{}", plan.changeset.preview_sql());

    let orders = plan.catalog.get("orders").unwrap();
    let columns: Vec<_> = orders.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, ["id", "total", "placed_at"]);
    assert!(plan.catalog.get("purge_orders").is_none());

    session.close().await;
}

#[tokio::test]
async fn failed_unit_is_reported_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("ledger.jsonl")).unwrap();
    let db = database(LedgerConfig::File { path: path.clone() }).await;
    let session = Session::connect(&db.config.database, &db.config.timeouts)
        .await
        .unwrap();
    reset(&session).await;

    // Occupy a name the model wants for a table with an incompatible view.
    session
        .batch_execute("CREATE TABLE blocker (id int); CREATE VIEW uses_blocker AS SELECT id FROM blocker;")
        .await
        .unwrap();
    let model = r#"
[[table]]
name = "alpha"
columns = [{ name = "id", type = "int" }]

[[table]]
name = "blocker"
columns = [{ name = "id", type = "uuid" }]

[[view]]
name = "uses_blocker"
references = ["blocker"]
query = "SELECT id FROM blocker WHERE id IS NOT NULL"

[[table]]
name = "zulu"
columns = [{ name = "id", type = "int" }]
"#;
    let target = compile(model).unwrap();
    let tracker = ChangeTracker::new(FileLedger::new(path));
    let migrator = Migrator::new(&session, &db.config);

    // int -> uuid has no cast, so the alter fails.
    let summary = migrator.run(&target, &tracker).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exit_code(), 2);

    // The view was dropped before the failure. Remove the old table by hand
    // and retry: only what is left runs.
    session
        .batch_execute("DROP TABLE blocker;")
        .await
        .unwrap();
    let summary = migrator.run(&target, &tracker).await.unwrap();
    assert_eq!(summary.failed, 0);
    assert!(migrator.plan(&target, &tracker).await.unwrap().pending.is_empty());

    session.close().await;
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let db = database(LedgerConfig::default()).await;
    let session = Session::connect(&db.config.database, &db.config.timeouts)
        .await
        .unwrap();
    reset(&session).await;

    let tracker = ChangeTracker::new(MemoryLedger::new());
    let migrator = Migrator::new(&session, &db.config);
    let target = compile(MODEL_V1).unwrap();

    let first = migrator.plan(&target, &tracker).await.unwrap();
    let second = migrator.plan(&target, &tracker).await.unwrap();
    assert_eq!(first.pending.len(), 3);
    assert_eq!(first.pending, second.pending);

    session.close().await;
}
