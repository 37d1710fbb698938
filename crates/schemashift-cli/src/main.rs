//! schemashift - schema-diff-driven migrations for Postgres.
//!
//! ```bash
//! schemashift schema              # show the compiled model
//! schemashift diff                # show pending changes
//! schemashift diff --reverse      # show the rollback script
//! schemashift migrate             # apply pending changes
//! schemashift status              # show the ledger
//! ```
//!
//! Exit codes: 0 on success, 1 on errors, 2 when a run stopped part way.

mod config;
mod output;

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use schemashift::{
    CancelFlag, ChangeTracker, Config, Error, FileLedger, LedgerConfig, LedgerStore,
    MemoryLedger, Migrator, Schema, Session, TableLedger,
};

#[derive(Parser)]
#[command(name = "schemashift", version, about = "Schema-diff-driven migrations for Postgres")]
struct Cli {
    /// Configuration file (default: search for .config/schemashift.toml)
    #[arg(long, global = true, env = "SCHEMASHIFT_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the compiled model
    Schema {
        /// Print JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
    /// Show changes that a migration would apply
    Diff {
        /// Print the rollback script instead of the forward changes
        #[arg(long)]
        reverse: bool,
        /// Print a plain SQL script
        #[arg(long, conflicts_with = "json")]
        script: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply pending changes
    Migrate {
        /// Compute and print the plan without applying it
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the ledger and how many changes are pending
    Status {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    /// Whether the command may write to the database.
    fn writes(&self) -> bool {
        matches!(self, Command::Migrate { dry_run: false, .. })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if e.is_retryable() {
                eprintln!("{} the run can be retried from a fresh snapshot", "hint:".yellow());
            }
            match &e {
                Error::PartialApply(partial) if !partial.applied.is_empty() => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "schemashift=info",
        1 => "schemashift=debug",
        _ => "schemashift=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<u8, Error> {
    let (config, config_path) = config::load(cli.config.as_deref())?;
    tracing::debug!(config = %config_path, "configuration loaded");

    let model = read_file(&config.model)?;
    let target = schemashift::compile(&model)?;

    if let Command::Schema { json } = &cli.command {
        output::print_schema(&target, *json);
        return Ok(0);
    }

    let session = Session::connect(&config.database, &config.timeouts).await?;
    session.set_search_path(&config.schema).await?;

    let result = match &config.ledger {
        LedgerConfig::Table { name } => {
            let store = TableLedger::new(&session, name.clone());
            if cli.command.writes() {
                store.ensure().await?;
                dispatch(&cli.command, &session, &config, &target, ChangeTracker::new(store)).await
            } else if store.exists().await? {
                dispatch(&cli.command, &session, &config, &target, ChangeTracker::new(store)).await
            } else {
                // Nothing recorded yet; avoid creating the table for a read.
                let tracker = ChangeTracker::new(MemoryLedger::new());
                dispatch(&cli.command, &session, &config, &target, tracker).await
            }
        }
        LedgerConfig::File { path } => {
            let tracker = ChangeTracker::new(FileLedger::new(path.clone()));
            dispatch(&cli.command, &session, &config, &target, tracker).await
        }
    };

    session.close().await;
    result
}

async fn dispatch<L: LedgerStore>(
    command: &Command,
    session: &Session,
    config: &Config,
    target: &Schema,
    tracker: ChangeTracker<L>,
) -> Result<u8, Error> {
    match *command {
        Command::Schema { .. } => Ok(0),
        Command::Diff {
            reverse,
            script,
            json,
        } => {
            let plan = Migrator::new(session, config).plan(target, &tracker).await?;
            if json {
                output::print_json(&plan.pending);
            } else if reverse {
                print!("{}", plan.pending.rollback_sql());
            } else if script {
                print!("{}", plan.pending.preview_sql());
            } else {
                output::print_plan(&plan);
            }
            Ok(0)
        }
        Command::Migrate { dry_run: true, json } => {
            let plan = Migrator::new(session, config).plan(target, &tracker).await?;
            if json {
                output::print_json(&plan.pending);
            } else {
                output::print_plan(&plan);
                println!("{}", "dry run: nothing was applied".dimmed());
            }
            Ok(0)
        }
        Command::Migrate {
            dry_run: false,
            json,
        } => {
            let cancel = CancelFlag::new();
            let flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted; stopping after the current unit");
                    flag.cancel();
                }
            });

            let migrator = Migrator::new(session, config)
                .with_scripts(
                    read_optional(config.scripts.before.as_ref())?,
                    read_optional(config.scripts.after.as_ref())?,
                )
                .with_cancel(cancel);
            let summary = migrator.run(target, &tracker).await?;
            if json {
                output::print_json(&summary);
            } else {
                output::print_summary(&summary);
            }
            Ok(summary.exit_code() as u8)
        }
        Command::Status { json } => {
            let records = tracker.records().await?;
            let plan = Migrator::new(session, config).plan(target, &tracker).await?;
            if json {
                output::print_json(&serde_json::json!({
                    "records": records,
                    "pending": plan.pending.len(),
                }));
            } else {
                output::print_status(&records, &plan);
            }
            Ok(0)
        }
    }
}

fn read_file(path: &camino::Utf8Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::Config(schemashift::ConfigError::Io {
            path: path.to_string(),
            message: e.to_string(),
        })
    })
}

fn read_optional(path: Option<&Utf8PathBuf>) -> Result<Option<String>, Error> {
    path.map(|p| read_file(p)).transpose()
}
