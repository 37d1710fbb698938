#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use schemashift::{Error, Target};

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Sql,
    Timeout,
}

/// A target that records every batch and fails the ones containing a marker.
#[derive(Default)]
pub struct FakeTarget {
    statements: Mutex<Vec<String>>,
    fail_on: Mutex<Option<(String, Failure)>>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, marker: Option<&str>) {
        *self.fail_on.lock().unwrap() = marker.map(|m| (m.to_string(), Failure::Sql));
    }

    pub fn time_out_on(&self, marker: &str) {
        *self.fail_on.lock().unwrap() = Some((marker.to_string(), Failure::Timeout));
    }

    /// Every batch, transaction control included.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    /// Statements other than transaction control.
    pub fn executed(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !matches!(s.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK"))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.statements.lock().unwrap().clear();
    }
}

impl Target for FakeTarget {
    fn batch_execute<'a>(
        &'a self,
        sql: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        let failure = self
            .fail_on
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(marker, _)| sql.contains(marker.as_str()))
            .map(|(_, failure)| *failure);
        self.statements.lock().unwrap().push(sql.to_string());
        Box::pin(async move {
            match failure {
                None => Ok(()),
                Some(Failure::Sql) => Err(Error::Sql(format!("cannot run: {}", sql))),
                Some(Failure::Timeout) => Err(Error::Timeout {
                    operation: "statement",
                    after: Duration::from_secs(1),
                }),
            }
        })
    }
}

pub const ORDERS_MODEL: &str = r#"
[[table]]
name = "orders"
columns = [
  { name = "id", type = "int", nullable = false },
  { name = "total", type = "numeric" },
]
"#;
