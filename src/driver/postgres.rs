//! PostgreSQL driver backed by sqlx.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::mpsc;

use crate::db::connection::ConnAttrs;
use crate::driver::{ColumnMeta, Cursor, Driver, DriverConnection, SqlType, SqlValue};
use crate::error::{DeskError, Result};

/// Rows buffered between the fetch task and the cursor.
const FETCH_BUFFER: usize = 64;

pub struct PgDriver {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgDriver {
    pub fn new() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for PgDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for PgDriver {
    async fn connect(&self, attrs: &ConnAttrs) -> Result<Arc<dyn DriverConnection>> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&attrs.uri())
            .await
            .map_err(|e| DeskError::Connection(format!("{}: {}", attrs.name, e)))?;
        Ok(Arc::new(PgConnection { pool }))
    }
}

pub struct PgConnection {
    pool: PgPool,
}

#[async_trait]
impl DriverConnection for PgConnection {
    async fn execute(&self, sql: &str) -> Result<Box<dyn Cursor>> {
        // The sqlx fetch stream borrows the statement text, so a bridge
        // task owns both and hands rows over a bounded channel. Dropping
        // the cursor hangs up the channel and ends the fetch.
        let (tx, rx) = mpsc::channel::<std::result::Result<PgRow, sqlx::Error>>(FETCH_BUFFER);
        let pool = self.pool.clone();
        let sql = sql.to_string();
        tokio::spawn(async move {
            let mut stream = sqlx::query(&sql).fetch(&pool);
            while let Some(item) = stream.next().await {
                let stop = item.is_err();
                if tx.send(item).await.is_err() {
                    break;
                }
                if stop {
                    break;
                }
            }
        });
        Ok(Box::new(PgCursor {
            rx,
            columns: Vec::new(),
        }))
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool)).await,
            Ok(Ok(_))
        )
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgCursor {
    rx: mpsc::Receiver<std::result::Result<PgRow, sqlx::Error>>,
    columns: Vec<ColumnMeta>,
}

#[async_trait]
impl Cursor for PgCursor {
    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(Err(e)) => Err(DeskError::Driver(e.to_string())),
            Some(Ok(row)) => {
                if self.columns.is_empty() {
                    self.columns = column_meta(&row);
                }
                Ok(Some(decode_row(&row)))
            }
        }
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }
}

fn column_meta(row: &PgRow) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|col| ColumnMeta::new(col.name(), resolve_type(col.type_info().name())))
        .collect()
}

fn resolve_type(pg_name: &str) -> SqlType {
    match pg_name {
        "BOOL" => SqlType::Boolean,
        "INT2" => SqlType::SmallInt,
        "INT4" => SqlType::Integer,
        "INT8" => SqlType::BigInt,
        "FLOAT4" => SqlType::Real,
        "FLOAT8" => SqlType::Double,
        "CHAR" | "BPCHAR" => SqlType::Char,
        "TEXT" | "VARCHAR" | "NAME" => SqlType::Varchar,
        "DATE" => SqlType::Date,
        "TIME" | "TIMETZ" => SqlType::Time,
        "TIMESTAMP" => SqlType::Timestamp,
        "TIMESTAMPTZ" => SqlType::TimestampTz,
        "UUID" => SqlType::Uuid,
        "JSON" | "JSONB" => SqlType::Json,
        "BYTEA" => SqlType::Binary,
        name if name.ends_with("[]") => SqlType::Array,
        _ => SqlType::Other,
    }
}

fn decode_row(row: &PgRow) -> Vec<SqlValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| decode_value(row, i, col.type_info().name()))
        .collect()
}

fn decode_value(row: &PgRow, i: usize, pg_name: &str) -> SqlValue {
    match pg_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(i)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<Option<i16>, _>(i)
            .ok()
            .flatten()
            .map(|v| Value::from(v as i64))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(i)
            .ok()
            .flatten()
            .map(|v| Value::from(v as i64))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(i)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(i)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(i)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(i)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(i)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(i)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(i)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(i)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        // Everything else renders as text when the driver can read it
        // that way, otherwise as NULL.
        _ => row
            .try_get::<Option<String>, _>(i)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_type() {
        assert_eq!(resolve_type("INT8"), SqlType::BigInt);
        assert_eq!(resolve_type("VARCHAR"), SqlType::Varchar);
        assert_eq!(resolve_type("TIMESTAMPTZ"), SqlType::TimestampTz);
        assert_eq!(resolve_type("INT4[]"), SqlType::Array);
        assert_eq!(resolve_type("GEOMETRY"), SqlType::Other);
    }
}
