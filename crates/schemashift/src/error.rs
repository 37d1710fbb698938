use std::error::Error as _;
use std::fmt;
use std::time::Duration;

use schemashift_config::ConfigError;
use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::change::UnitRef;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot reach database: {0}")]
    Connectivity(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid model: {0}")]
    Model(#[from] ModelError),

    #[error("dependency cycle between {}", .objects.join(", "))]
    DependencyCycle { objects: Vec<String> },

    #[error(
        "drift on {object} ({operation}, unit {unit_id}): ledger has checksum {recorded}, model produces {computed}"
    )]
    Drift {
        unit_id: String,
        object: String,
        operation: String,
        recorded: String,
        computed: String,
    },

    #[error("{0}")]
    PartialApply(Box<PartialApply>),

    #[error("{operation} timed out after {}s", .after.as_secs_f64())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("sql error: {0}")]
    Sql(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the whole run from a fresh snapshot may succeed.
    ///
    /// A partial apply is retryable when the unit that stopped it was.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connectivity(_) | Error::Timeout { .. } => true,
            Error::PartialApply(partial) => partial.cause.is_retryable(),
            _ => false,
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            let code = db.code();
            let message = db.message().to_string();
            if *code == SqlState::INSUFFICIENT_PRIVILEGE
                || *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
            {
                return Error::Permission(message);
            }
            // Class 08 is "connection exception".
            if code.code().starts_with("08")
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
                || *code == SqlState::TOO_MANY_CONNECTIONS
            {
                return Error::Connectivity(message);
            }
            return Error::Sql(format!("{} ({})", message, code.code()));
        }

        if err.is_closed()
            || err
                .source()
                .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some())
        {
            return Error::Connectivity(err.to_string());
        }

        Error::Sql(err.to_string())
    }
}

/// Problems found while compiling a logical model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("cannot parse model: {0}")]
    Parse(String),

    #[error("{kind} has an empty name")]
    EmptyName { kind: &'static str },

    #[error("object `{0}` is declared more than once")]
    DuplicateObject(String),

    #[error("`{object}` declares `{field}` more than once")]
    DuplicateField { object: String, field: String },

    #[error("`{object}` references `{reference}`, which is not declared")]
    UnresolvedReference { object: String, reference: String },

    #[error("`{object}` references procedure `{reference}`; only tables and views can be referenced")]
    ReferencesProcedure { object: String, reference: String },

    #[error("`{0}` references itself")]
    SelfReference(String),

    #[error("`{object}`: {reason}")]
    InvalidDefinition { object: String, reason: String },

    #[error("`{object}`.`{column}`: type `{ty}` is not supported")]
    UnsupportedType {
        object: String,
        column: String,
        ty: String,
    },
}

/// A run that stopped at a failed unit after committing earlier ones.
#[derive(Debug)]
pub struct PartialApply {
    pub failed: UnitRef,
    pub cause: Error,
    pub applied: Vec<UnitRef>,
    pub not_attempted: Vec<UnitRef>,
    /// Set when the failure itself could not be written to the ledger.
    pub ledger_error: Option<String>,
}

impl fmt::Display for PartialApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed: {} ({} unit(s) applied before it",
            self.failed, self.cause, self.applied.len()
        )?;
        if !self.not_attempted.is_empty() {
            write!(f, ", {} not attempted", self.not_attempted.len())?;
        }
        write!(f, ")")?;
        if let Some(ledger_error) = &self.ledger_error {
            write!(f, "; failure not recorded: {}", ledger_error)?;
        }
        Ok(())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
