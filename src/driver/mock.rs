//! Scripted in-memory driver.
//!
//! Plays back a fixed column set and row script with optional per-row
//! latency, injected failures and probe-validity toggles. Every engine
//! and health-checker test runs against this driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::db::connection::ConnAttrs;
use crate::driver::{ColumnMeta, Cursor, Driver, DriverConnection, SqlValue};
use crate::error::{DeskError, Result};

pub struct MockDriver {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Sleep before serving each row; lets tests hold a query in-flight.
    pub row_delay: Option<Duration>,
    /// Fail with a driver error when asked for row index N.
    pub fail_after: Option<usize>,
    pub connect_fails: bool,
    /// Sleep before answering a validity probe; lets tests exercise the
    /// probe timeout path.
    pub probe_delay: Option<Duration>,
    valid: Arc<AtomicBool>,
}

impl MockDriver {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns,
            rows,
            row_delay: None,
            fail_after: None,
            connect_fails: false,
            probe_delay: None,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Flip the probe answer for every connection handed out by this
    /// driver, past and future.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, attrs: &ConnAttrs) -> Result<Arc<dyn DriverConnection>> {
        if self.connect_fails {
            return Err(DeskError::Connection(format!(
                "connection refused: {}",
                attrs.uri()
            )));
        }
        Ok(Arc::new(MockConnection {
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            row_delay: self.row_delay,
            fail_after: self.fail_after,
            probe_delay: self.probe_delay,
            valid: self.valid.clone(),
        }))
    }
}

pub struct MockConnection {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<SqlValue>>,
    row_delay: Option<Duration>,
    fail_after: Option<usize>,
    probe_delay: Option<Duration>,
    valid: Arc<AtomicBool>,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(&self, _sql: &str) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MockCursor {
            script_columns: self.columns.clone(),
            rows: self.rows.clone(),
            row_delay: self.row_delay,
            fail_after: self.fail_after,
            pos: 0,
            columns: Vec::new(),
        }))
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        if let Some(delay) = self.probe_delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return false;
            }
        }
        self.valid.load(Ordering::Acquire)
    }

    async fn close(&self) {}
}

pub struct MockCursor {
    script_columns: Vec<ColumnMeta>,
    rows: Vec<Vec<SqlValue>>,
    row_delay: Option<Duration>,
    fail_after: Option<usize>,
    pos: usize,
    columns: Vec<ColumnMeta>,
}

#[async_trait]
impl Cursor for MockCursor {
    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        if let Some(delay) = self.row_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_after == Some(self.pos) {
            return Err(DeskError::Driver("injected driver failure".to_string()));
        }
        match self.rows.get(self.pos) {
            Some(row) => {
                if self.pos == 0 {
                    self.columns = self.script_columns.clone();
                }
                self.pos += 1;
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }
}
