//! Session-scoped advisory lock that keeps concurrent runs apart.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;
use crate::session::Session;

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// A held `pg_advisory_lock`. Released explicitly, or when the session closes.
#[derive(Debug)]
#[must_use = "the lock is held until released or the session closes"]
pub struct AdvisoryLock {
    key: i64,
}

impl AdvisoryLock {
    /// Wait up to `timeout` for the lock on `key`.
    ///
    /// Polls `pg_try_advisory_lock` so an expired wait never leaves a lock
    /// request queued on the server.
    pub async fn acquire(session: &Session, key: i64, timeout: Duration) -> Result<Self, Error> {
        let deadline = Instant::now() + timeout;
        let mut announced = false;
        loop {
            let row = session
                .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
                .await?;
            if row.get::<_, bool>(0) {
                tracing::debug!(key, "advisory lock acquired");
                return Ok(Self { key });
            }
            if !announced {
                tracing::info!(key, "waiting for another run to release the lock");
                announced = true;
            }
            if Instant::now() + RETRY_INTERVAL > deadline {
                return Err(Error::Timeout {
                    operation: "lock",
                    after: timeout,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn release(self, session: &Session) -> Result<(), Error> {
        session
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.key])
            .await?;
        tracing::debug!(key = self.key, "advisory lock released");
        Ok(())
    }
}
