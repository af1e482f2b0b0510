//! Database connection attributes and the shared connection handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::driver::{Driver, DriverConnection};
use crate::error::Result;

/// Attributes needed to reach a database. Loaded and saved by the
/// (external) profile store; this core only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnAttrs {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl ConnAttrs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
        }
    }

    pub fn uri(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

/// A shared handle to one database connection.
///
/// `is_open` reflects the last known open/closed state: it is flipped by
/// explicit `open()`/`close()` calls and by validity probes. The handle
/// never owns query execution; the executor borrows the driver connection
/// for the duration of one statement.
pub struct Conn {
    attrs: ConnAttrs,
    is_open: AtomicBool,
    inner: Mutex<Option<Arc<dyn DriverConnection>>>,
}

impl Conn {
    pub fn new(attrs: ConnAttrs) -> Self {
        Self {
            attrs,
            is_open: AtomicBool::new(false),
            inner: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.attrs.name
    }

    pub fn attrs(&self) -> &ConnAttrs {
        &self.attrs
    }

    /// True if `open()` succeeded and no probe or `close()` has flipped
    /// the state since. No validity check is applied.
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// Open the connection through the driver. No-op when already open.
    pub async fn open(&self, driver: &dyn Driver) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() && self.is_open() {
            return Ok(());
        }
        info!(conn = %self.attrs.name, "connecting");
        let connection = driver.connect(&self.attrs).await?;
        *guard = Some(connection);
        self.is_open.store(true, Ordering::Release);
        info!(conn = %self.attrs.name, "connected");
        Ok(())
    }

    /// Close the underlying driver connection. Tolerated no-op when
    /// already closed.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(connection) = guard.take() {
            info!(conn = %self.attrs.name, "closing");
            connection.close().await;
        }
        self.is_open.store(false, Ordering::Release);
    }

    /// Bounded-time probe of the live connection. A probe that fails or
    /// times out closes the handle so `is_open` and validity never
    /// disagree for long. Never errors; returns `false` instead.
    pub async fn is_valid(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock().await;
        let valid = match guard.as_ref() {
            // outer timeout bounds the probe even when a driver ignores
            // the limit it was handed
            Some(connection) => tokio::time::timeout(timeout, connection.is_valid(timeout))
                .await
                .unwrap_or(false),
            None => false,
        };
        if valid {
            self.is_open.store(true, Ordering::Release);
        } else {
            if let Some(connection) = guard.take() {
                connection.close().await;
            }
            self.is_open.store(false, Ordering::Release);
        }
        valid
    }

    /// Clone of the live driver connection, if any.
    pub async fn connection(&self) -> Option<Arc<dyn DriverConnection>> {
        self.inner.lock().await.clone()
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("name", &self.attrs.name)
            .field("uri", &self.attrs.uri())
            .field("is_open", &self.is_open())
            .finish()
    }
}
