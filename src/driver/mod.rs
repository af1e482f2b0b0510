//! Database driver boundary.
//!
//! The execution core treats SQL text as opaque and hands it to a driver:
//! execute a statement, obtain a forward-only cursor, fetch rows with
//! column name/type metadata. Drivers are pluggable behind these traits;
//! `postgres` is the real implementation, `mock` the scripted one used by
//! tests.

pub mod mock;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::connection::ConnAttrs;
use crate::error::Result;

/// Cell values cross the driver boundary as plain JSON values.
pub type SqlValue = serde_json::Value;

/// Column type tags, resolved from driver-reported type metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    RowId,
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Char,
    Varchar,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Array,
    Binary,
    Other,
}

impl SqlType {
    /// Display name used in column headers. The synthetic row-id column
    /// renders without a type suffix.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RowId => "",
            Self::Boolean => "BOOLEAN",
            Self::TinyInt => "TINYINT",
            Self::SmallInt => "SMALLINT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Real => "REAL",
            Self::Double => "DOUBLE",
            Self::Char => "CHAR",
            Self::Varchar => "VARCHAR",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Timestamp => "TIMESTAMP",
            Self::TimestampTz => "TIMESTAMPTZ",
            Self::Uuid => "UUID",
            Self::Json => "JSON",
            Self::Array => "ARRAY",
            Self::Binary => "BINARY",
            Self::Other => "OBJECT",
        }
    }

    /// Whether values of this type can be read on a numeric axis
    /// (integers, floats and time-like types).
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::TinyInt
                | Self::SmallInt
                | Self::Integer
                | Self::BigInt
                | Self::Real
                | Self::Double
                | Self::Date
                | Self::Time
                | Self::Timestamp
                | Self::TimestampTz
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// Opens driver connections from connection attributes.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, attrs: &ConnAttrs) -> Result<Arc<dyn DriverConnection>>;
}

/// One open connection to a database. Exclusive use during a query
/// execution is assumed by the executor; validity probes are the only
/// concurrent callers.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Execute a statement and return its forward-only cursor. Statements
    /// that produce no rows return a cursor that is immediately
    /// exhausted.
    async fn execute(&self, sql: &str) -> Result<Box<dyn Cursor>>;

    /// Bounded-time liveness probe. Errors and timeouts both read as
    /// `false`.
    async fn is_valid(&self, timeout: Duration) -> bool;

    async fn close(&self);
}

/// Forward-only row iterator over one executed statement.
#[async_trait]
pub trait Cursor: Send {
    /// Fetch the next row, or `None` on exhaustion.
    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>>;

    /// Column metadata. Empty until the first row has been fetched.
    fn columns(&self) -> &[ColumnMeta];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(SqlType::Varchar.name(), "VARCHAR");
        assert_eq!(SqlType::TimestampTz.name(), "TIMESTAMPTZ");
        assert_eq!(SqlType::RowId.name(), "");
    }

    #[test]
    fn test_numeric_classification() {
        assert!(SqlType::BigInt.is_numeric());
        assert!(SqlType::Timestamp.is_numeric());
        assert!(!SqlType::Varchar.is_numeric());
        assert!(!SqlType::Boolean.is_numeric());
    }
}
