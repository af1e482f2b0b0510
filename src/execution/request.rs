//! The executor's unit of work and its progressive outcomes.
//!
//! Each request comes from a source, carries a SQL statement, and is
//! identified by a unique id. Execution outcomes arrive as a series of
//! responses; they are delta snapshots over a single `ResultTable`
//! instance that the executor keeps appending to, not separate result
//! sets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::connection::Conn;
use crate::error::DeskError;
use crate::execution::table::ResultTable;

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    source_id: String,
    id: Uuid,
    conn: Arc<Conn>,
    sql: String,
    created_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(source_id: impl Into<String>, conn: Arc<Conn>, sql: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            id: Uuid::new_v4(),
            conn,
            sql: sql.into(),
            created_at: Utc::now(),
        }
    }

    /// Identity of the logical requester (e.g. one editor tab). Keys the
    /// at-most-one-in-flight tracking.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Identity of this specific submission.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// One snapshot in an execution's life cycle. All responses of one
/// execution share the same table reference; the table keeps mutating
/// after a response is delivered, until the execution reaches a terminal
/// state.
#[derive(Debug)]
pub struct ExecutionResponse {
    request: ExecutionRequest,
    table: Arc<ResultTable>,
    total_millis: u64,
    exec_millis: u64,
    fetch_millis: u64,
    error: Option<DeskError>,
}

impl ExecutionResponse {
    pub(crate) fn progress(
        request: &ExecutionRequest,
        table: Arc<ResultTable>,
        total_millis: u64,
        exec_millis: u64,
        fetch_millis: u64,
    ) -> Self {
        Self {
            request: request.clone(),
            table,
            total_millis,
            exec_millis,
            fetch_millis,
            error: None,
        }
    }

    pub(crate) fn failure(
        request: &ExecutionRequest,
        table: Arc<ResultTable>,
        total_millis: u64,
        error: DeskError,
    ) -> Self {
        Self {
            request: request.clone(),
            table,
            total_millis,
            exec_millis: 0,
            fetch_millis: 0,
            error: Some(error),
        }
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    pub fn source_id(&self) -> &str {
        self.request.source_id()
    }

    pub fn request_id(&self) -> Uuid {
        self.request.id()
    }

    pub fn sql(&self) -> &str {
        self.request.sql()
    }

    pub fn table(&self) -> &Arc<ResultTable> {
        &self.table
    }

    pub fn total_millis(&self) -> u64 {
        self.total_millis
    }

    /// Time to the first driver response, not to the last row.
    pub fn exec_millis(&self) -> u64 {
        self.exec_millis
    }

    pub fn fetch_millis(&self) -> u64 {
        self.fetch_millis
    }

    pub fn error(&self) -> Option<&DeskError> {
        self.error.as_ref()
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}
