//! querydesk — the execution core of a desktop SQL client.
//!
//! Takes SQL statements bound to database connections, runs them off the
//! interactive thread, streams partial results back as they are fetched,
//! supports cancellation and replacement of in-flight work, and exposes
//! the accumulating result set through a paged, concurrency-safe view
//! while a background checker keeps an eye on open connections.

pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod execution;
pub mod logging;

pub use config::Config;
pub use db::{Conn, ConnAttrs, ConnChecker};
pub use error::{DeskError, Result};
pub use execution::{
    ExecutionEvent, ExecutionRequest, ExecutionResponse, PagedView, ResultTable, SqlExecutor,
};
