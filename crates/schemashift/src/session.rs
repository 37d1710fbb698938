//! Traced database session.
//!
//! A [`Session`] owns one tokio-postgres client and the task driving its
//! connection. Every call is wrapped in a `tracing::debug_span!` and bounded
//! by the statement timeout. Closing the session (or dropping it) drops the
//! client, which ends the connection and releases session-scoped locks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use schemashift_config::{ConnectionDescriptor, Timeouts};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::Instrument;

use crate::error::Error;

/// Anything that can run a batch of SQL statements.
///
/// Implemented by [`Session`]; the executor only needs this, which keeps it
/// testable without a server.
pub trait Target: Send + Sync {
    fn batch_execute<'a>(
        &'a self,
        sql: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;
}

/// A connected, traced session.
pub struct Session {
    client: Client,
    connection: JoinHandle<()>,
    statement_timeout: Duration,
}

impl Session {
    /// Connect using a validated descriptor.
    pub async fn connect(descriptor: &ConnectionDescriptor, timeouts: &Timeouts) -> Result<Self, Error> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&descriptor.host)
            .port(descriptor.port)
            .dbname(&descriptor.database)
            .user(&descriptor.user)
            .application_name("schemashift")
            .connect_timeout(timeouts.connect());
        if let Some(password) = &descriptor.password {
            config.password(password);
        }

        let span = tracing::debug_span!(
            "db.connect",
            db = %descriptor.display_masked(),
            tls = descriptor.uses_tls(),
        );

        let connect = async {
            if descriptor.uses_tls() {
                config.ssl_mode(SslMode::Require);
                let (client, connection) = config.connect(make_tls(descriptor)?).await?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::warn!(error = %e, "database connection ended with an error");
                    }
                });
                Ok::<_, Error>((client, task))
            } else {
                let (client, connection) = config.connect(NoTls).await?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::warn!(error = %e, "database connection ended with an error");
                    }
                });
                Ok((client, task))
            }
        };

        let (client, connection) = match tokio::time::timeout(timeouts.connect(), connect.instrument(span)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "connect",
                    after: timeouts.connect(),
                });
            }
        };

        tracing::info!(db = %descriptor.display_masked(), "connected");
        Ok(Self {
            client,
            connection,
            statement_timeout: timeouts.statement(),
        })
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T, tokio_postgres::Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.statement_timeout, future).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout {
                operation,
                after: self.statement_timeout,
            }),
        }
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
        let span = tracing::debug_span!(
            "db.execute",
            sql = %sql,
            params = params.len(),
            affected = tracing::field::Empty,
        );
        let affected = self
            .bounded("statement", self.client.execute(sql, params))
            .instrument(span.clone())
            .await?;
        span.record("affected", affected);
        Ok(affected)
    }

    /// Execute a query, returning all rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = tracing::field::Empty,
        );
        let rows = self
            .bounded("query", self.client.query(sql, params))
            .instrument(span.clone())
            .await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    /// Execute a query, returning exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = 1u64,
        );
        self.bounded("query", self.client.query_one(sql, params))
            .instrument(span)
            .await
    }

    /// Run one or more statements without parameters.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let span = tracing::debug_span!("db.batch", sql = %sql);
        self.bounded("statement", self.client.batch_execute(sql))
            .instrument(span)
            .await
    }

    /// Point unqualified names at `schema`.
    pub async fn set_search_path(&self, schema: &str) -> Result<(), Error> {
        self.batch_execute(&format!(
            "SET search_path TO {}",
            schemashift_sql::quote_ident(schema)
        ))
        .await
    }

    /// Close the connection and wait for its task to finish.
    pub async fn close(self) {
        let Session {
            client, connection, ..
        } = self;
        drop(client);
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "connection task did not finish cleanly");
        }
    }
}

impl Target for Session {
    fn batch_execute<'a>(
        &'a self,
        sql: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(Session::batch_execute(self, sql))
    }
}

fn make_tls(descriptor: &ConnectionDescriptor) -> Result<MakeRustlsConnect, Error> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(path) = &descriptor.root_cert {
        for cert in read_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("bad root certificate in {}: {}", path, e)))?;
        }
    }

    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(e.to_string()))?
    .with_root_certificates(roots);

    let config = match (&descriptor.client_cert, &descriptor.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
            .map_err(|e| Error::Tls(format!("bad client certificate: {}", e)))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(MakeRustlsConnect::new(config))
}

fn read_certs(path: &Utf8Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path)));
    }
    Ok(certs)
}

fn read_key(path: &Utf8Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path)))
}
