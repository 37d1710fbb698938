//! Configuration types for schemashift.
//!
//! The configuration is read once at startup from `.config/schemashift.toml`,
//! merged with `PG*` environment overrides, and validated. Everything
//! downstream receives these typed values; nothing inspects the raw file.
//!
//! ```toml
//! model = "model.toml"
//! schema = "public"
//!
//! [database]
//! host = "localhost"
//! port = 5432
//! database = "shop"
//! user = "shop"
//! password = "secret"
//!
//! [ledger]
//! kind = "table"
//! name = "schemashift_ledger"
//!
//! [timeouts]
//! statement_secs = 30
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No configuration file was found.
    #[error("no .config/schemashift.toml found in current directory or any parent")]
    NotFound,

    /// The file could not be read.
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    /// The file is not valid TOML or has the wrong shape.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A field has an invalid value.
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Target database.
    pub database: ConnectionDescriptor,

    /// Path of the logical model file.
    pub model: Utf8PathBuf,

    /// Namespace that is introspected and migrated.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Where applied changes are recorded.
    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Key passed to `pg_advisory_lock` for the duration of a run.
    #[serde(default = "default_lock_key")]
    pub lock_key: i64,

    /// Catalog objects that are never diffed (neither dropped nor altered).
    #[serde(default)]
    pub ignore: Vec<String>,

    #[serde(default)]
    pub scripts: Scripts,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_lock_key() -> i64 {
    // "schemash" as big-endian bytes
    0x7363_6865_6d61_7368
}

impl Config {
    /// A configuration with every optional setting at its default.
    pub fn new(database: ConnectionDescriptor, model: impl Into<Utf8PathBuf>) -> Self {
        Self {
            database,
            model: model.into(),
            schema: default_schema(),
            ledger: LedgerConfig::default(),
            timeouts: Timeouts::default(),
            lock_key: default_lock_key(),
            ignore: Vec::new(),
            scripts: Scripts::default(),
        }
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field for values that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;

        if self.model.as_str().trim().is_empty() {
            return Err(ConfigError::invalid("model", "path must not be empty"));
        }
        if self.schema.trim().is_empty() {
            return Err(ConfigError::invalid("schema", "must not be empty"));
        }
        match &self.ledger {
            LedgerConfig::Table { name } if name.trim().is_empty() => {
                return Err(ConfigError::invalid("ledger.name", "must not be empty"));
            }
            LedgerConfig::File { path } if path.as_str().trim().is_empty() => {
                return Err(ConfigError::invalid("ledger.path", "must not be empty"));
            }
            _ => {}
        }
        self.timeouts.validate()?;
        Ok(())
    }

    /// Make relative paths relative to `base` (usually the project root).
    pub fn resolve_paths(&mut self, base: &Utf8Path) {
        resolve(&mut self.model, base);
        if let LedgerConfig::File { path } = &mut self.ledger {
            resolve(path, base);
        }
        if let Some(before) = &mut self.scripts.before {
            resolve(before, base);
        }
        if let Some(after) = &mut self.scripts.after {
            resolve(after, base);
        }
        for path in [
            &mut self.database.root_cert,
            &mut self.database.client_cert,
            &mut self.database.client_key,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path, base);
        }
    }

    /// Names excluded from introspection: the configured list plus the ledger table.
    pub fn ignored_objects(&self) -> Vec<String> {
        let mut names = self.ignore.clone();
        if let LedgerConfig::Table { name } = &self.ledger {
            names.push(name.clone());
        }
        names.sort();
        names.dedup();
        names
    }
}

fn resolve(path: &mut Utf8PathBuf, base: &Utf8Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// How to reach the target database.
///
/// Accepts the credential spellings used by common service bindings
/// (`hostname`, `dbname`, `username`, `sslrootcert`, ...).
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionDescriptor {
    #[serde(alias = "hostname", default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(alias = "dbname")]
    pub database: String,

    #[serde(alias = "username")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// CA certificate used to verify the server. Enables TLS.
    #[serde(default, alias = "sslrootcert")]
    pub root_cert: Option<Utf8PathBuf>,

    /// Client certificate for mutual TLS.
    #[serde(default, alias = "sslcert")]
    pub client_cert: Option<Utf8PathBuf>,

    /// Private key matching `client_cert`.
    #[serde(default, alias = "sslkey")]
    pub client_key: Option<Utf8PathBuf>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

impl ConnectionDescriptor {
    /// A plain-TCP descriptor without a password.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: None,
            root_cert: None,
            client_cert: None,
            client_key: None,
        }
    }

    /// Apply `PGHOST`, `PGPORT`, `PGDATABASE`, `PGUSER` and `PGPASSWORD` overrides.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("PGHOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PGPORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("PGPORT", format!("not a port: {port}")))?;
        }
        if let Some(database) = lookup("PGDATABASE") {
            self.database = database;
        }
        if let Some(user) = lookup("PGUSER") {
            self.user = user;
        }
        if let Some(password) = lookup("PGPASSWORD") {
            self.password = Some(password);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("database.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("database.port", "must not be 0"));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::invalid("database.database", "must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::invalid("database.user", "must not be empty"));
        }
        match (&self.client_cert, &self.client_key) {
            (Some(_), None) => Err(ConfigError::invalid(
                "database.client_key",
                "required when client_cert is set",
            )),
            (None, Some(_)) => Err(ConfigError::invalid(
                "database.client_cert",
                "required when client_key is set",
            )),
            (Some(_), Some(_)) if self.root_cert.is_none() => Err(ConfigError::invalid(
                "database.root_cert",
                "required when a client certificate is configured",
            )),
            _ => Ok(()),
        }
    }

    /// Whether connections use TLS.
    pub fn uses_tls(&self) -> bool {
        self.root_cert.is_some()
    }

    /// Connection URL with the password masked, for display.
    pub fn display_masked(&self) -> String {
        let password = if self.password.is_some() { ":***" } else { "" };
        format!(
            "postgres://{}{}@{}:{}/{}",
            self.user, password, self.host, self.port, self.database
        )
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("root_cert", &self.root_cert)
            .field("client_cert", &self.client_cert)
            .field("client_key", &self.client_key)
            .finish()
    }
}

/// Where the change ledger lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerConfig {
    /// A table inside the target database.
    Table {
        #[serde(default = "default_ledger_table")]
        name: String,
    },
    /// A JSON-lines file on disk.
    File { path: Utf8PathBuf },
}

fn default_ledger_table() -> String {
    "schemashift_ledger".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig::Table {
            name: default_ledger_table(),
        }
    }
}

/// Timeouts applied to database calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Upper bound for any single statement.
    #[serde(default = "default_statement_secs")]
    pub statement_secs: u64,

    /// How long to wait for the advisory lock.
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,
}

fn default_connect_secs() -> u64 {
    10
}

fn default_statement_secs() -> u64 {
    30
}

fn default_lock_secs() -> u64 {
    60
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            statement_secs: default_statement_secs(),
            lock_secs: default_lock_secs(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn statement(&self) -> Duration {
        Duration::from_secs(self.statement_secs)
    }

    pub fn lock(&self) -> Duration {
        Duration::from_secs(self.lock_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_secs == 0 {
            return Err(ConfigError::invalid("timeouts.connect_secs", "must be > 0"));
        }
        if self.statement_secs == 0 {
            return Err(ConfigError::invalid("timeouts.statement_secs", "must be > 0"));
        }
        if self.lock_secs == 0 {
            return Err(ConfigError::invalid("timeouts.lock_secs", "must be > 0"));
        }
        Ok(())
    }
}

/// SQL hooks run under the migration lock.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scripts {
    /// Executed before the changeset.
    pub before: Option<Utf8PathBuf>,
    /// Executed after the changeset, only if every unit applied.
    pub after: Option<Utf8PathBuf>,
}
