//! Asynchronous SQL execution engine.
//!
//! One worker task executes queries serially across all sources; a
//! concurrent registry keyed by source id enforces at most one in-flight
//! execution per source, preempting the previous one on resubmission.
//! Progress is delivered as `ExecutionEvent`s over a caller-supplied
//! channel while rows accumulate in a shared `ResultTable`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::driver::{Cursor, SqlValue};
use crate::error::{DeskError, Result};
use crate::execution::request::{ExecutionRequest, ExecutionResponse};
use crate::execution::table::ResultTable;

/// Events emitted over the life of one execution.
///
/// Ordering for a single execution: `Started`, then optionally
/// `FirstRowAvailable` and any number of `RowsAvailable`, then exactly one
/// of `Completed`/`Failure`. A cancelled execution goes silent instead:
/// the executor never emits `Cancelled` itself, the variant exists for the
/// cancelling caller's own state transition.
#[derive(Debug)]
pub enum ExecutionEvent {
    Started(ExecutionResponse),
    FirstRowAvailable(ExecutionResponse),
    RowsAvailable(ExecutionResponse),
    Completed(ExecutionResponse),
    Cancelled(ExecutionResponse),
    Failure(ExecutionResponse),
}

impl ExecutionEvent {
    pub fn response(&self) -> &ExecutionResponse {
        match self {
            Self::Started(r)
            | Self::FirstRowAvailable(r)
            | Self::RowsAvailable(r)
            | Self::Completed(r)
            | Self::Cancelled(r)
            | Self::Failure(r) => r,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Cancelled(_) | Self::Failure(_))
    }
}

pub type EventSender = UnboundedSender<ExecutionEvent>;

struct Job {
    request: ExecutionRequest,
    events: EventSender,
    cancel: CancellationToken,
}

struct RunningQuery {
    request_id: Uuid,
    cancel: CancellationToken,
}

struct Worker {
    queue: UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

pub struct SqlExecutor {
    config: Arc<Config>,
    running: Arc<DashMap<String, RunningQuery>>,
    worker: Mutex<Option<Worker>>,
}

impl SqlExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            running: Arc::new(DashMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker task. No-op when already started. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return;
        }
        self.running.clear();
        let (queue, jobs) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker_loop(
            jobs,
            Arc::clone(&self.running),
            Arc::clone(&self.config),
        ));
        *guard = Some(Worker { queue, handle });
        info!("executor is running");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Cancel all outstanding work, close the queue and wait for the
    /// worker, giving up after two short grace periods.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };
        for entry in self.running.iter() {
            entry.value().cancel.cancel();
        }
        self.running.clear();
        drop(worker.queue);

        let grace = self.config.shutdown_grace;
        let mut handle = worker.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            handle.abort();
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("executor worker did not stop within the grace period");
            }
        }
        info!("executor has finished");
    }

    /// Queue a request for execution. Any tracked execution for the same
    /// source is cancelled first; all outcomes arrive through `events`.
    pub fn submit(&self, request: ExecutionRequest, events: EventSender) -> Result<()> {
        let guard = self.worker.lock();
        let Some(worker) = guard.as_ref() else {
            return Err(DeskError::Execution("executor not started".to_string()));
        };
        self.cancel_existing(&request);
        let cancel = CancellationToken::new();
        self.running.insert(
            request.source_id().to_string(),
            RunningQuery {
                request_id: request.id(),
                cancel: cancel.clone(),
            },
        );
        info!(
            request_id = %request.id(),
            source_id = %request.source_id(),
            "execution submitted"
        );
        worker
            .queue
            .send(Job {
                request,
                events,
                cancel,
            })
            .map_err(|_| DeskError::Execution("executor queue is closed".to_string()))
    }

    /// Remove and cancel the tracked execution for the request's source,
    /// if any. Cancelling an already-finished execution is a no-op.
    pub fn cancel_existing(&self, request: &ExecutionRequest) {
        if let Some((_, running)) = self.running.remove(request.source_id()) {
            running.cancel.cancel();
            info!(
                request_id = %request.id(),
                source_id = %request.source_id(),
                "cancelling in-flight execution"
            );
        }
    }
}

async fn worker_loop(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    running: Arc<DashMap<String, RunningQuery>>,
    config: Arc<Config>,
) {
    while let Some(job) = jobs.recv().await {
        // preempted while still queued
        if job.cancel.is_cancelled() {
            continue;
        }
        execute_request(job, &running, &config).await;
    }
}

enum Fetch {
    Row(Vec<SqlValue>),
    Done,
    Failed(DeskError),
    Cancelled,
}

async fn fetch_next(cursor: &mut dyn Cursor, cancel: &CancellationToken, limit: Duration) -> Fetch {
    tokio::select! {
        _ = cancel.cancelled() => Fetch::Cancelled,
        fetched = tokio::time::timeout(limit, cursor.next_row()) => match fetched {
            Err(_) => Fetch::Failed(DeskError::Driver(format!(
                "row fetch timed out after {}s",
                limit.as_secs()
            ))),
            Ok(Err(e)) => Fetch::Failed(e),
            Ok(Ok(Some(values))) => Fetch::Row(values),
            Ok(Ok(None)) => Fetch::Done,
        },
    }
}

fn untrack(running: &DashMap<String, RunningQuery>, request: &ExecutionRequest) {
    // compare ids so a finished execution never evicts its successor
    running.remove_if(request.source_id(), |_, rq| rq.request_id == request.id());
}

fn elapsed_millis(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

async fn execute_request(job: Job, running: &DashMap<String, RunningQuery>, config: &Config) {
    let Job {
        request,
        events,
        cancel,
    } = job;
    let started_at = Instant::now();
    let table = Arc::new(ResultTable::new(request.id()));

    let valid = tokio::select! {
        _ = cancel.cancelled() => {
            untrack(running, &request);
            return;
        }
        valid = request.conn().is_valid(config.probe_timeout) => valid,
    };
    if !valid {
        untrack(running, &request);
        let err = DeskError::Connection(format!(
            "connection [{}] is not valid",
            request.conn().name()
        ));
        error!(
            request_id = %request.id(),
            source_id = %request.source_id(),
            %err,
            "execution failed"
        );
        let _ = events.send(ExecutionEvent::Failure(ExecutionResponse::failure(
            &request,
            table,
            elapsed_millis(started_at),
            err,
        )));
        return;
    }

    info!(
        request_id = %request.id(),
        source_id = %request.source_id(),
        conn = %request.conn().name(),
        sql = %request.sql(),
        "executing"
    );
    let _ = events.send(ExecutionEvent::Started(ExecutionResponse::progress(
        &request,
        Arc::clone(&table),
        elapsed_millis(started_at),
        0,
        0,
    )));

    let Some(driver_conn) = request.conn().connection().await else {
        untrack(running, &request);
        let err = DeskError::Connection(format!(
            "connection [{}] closed before execution",
            request.conn().name()
        ));
        let _ = events.send(ExecutionEvent::Failure(ExecutionResponse::failure(
            &request,
            table,
            elapsed_millis(started_at),
            err,
        )));
        return;
    };

    let mut cursor = tokio::select! {
        _ = cancel.cancelled() => {
            untrack(running, &request);
            return;
        }
        executed = tokio::time::timeout(config.query_timeout, driver_conn.execute(request.sql())) => {
            match executed {
                Err(_) => {
                    untrack(running, &request);
                    let err = DeskError::Driver(format!(
                        "statement timed out after {}s",
                        config.query_timeout.as_secs()
                    ));
                    error!(request_id = %request.id(), %err, "execution failed");
                    let _ = events.send(ExecutionEvent::Failure(ExecutionResponse::failure(
                        &request,
                        table,
                        elapsed_millis(started_at),
                        err,
                    )));
                    return;
                }
                Ok(Err(err)) => {
                    untrack(running, &request);
                    error!(request_id = %request.id(), %err, "execution failed");
                    let _ = events.send(ExecutionEvent::Failure(ExecutionResponse::failure(
                        &request,
                        table,
                        elapsed_millis(started_at),
                        err,
                    )));
                    return;
                }
                Ok(Ok(cursor)) => cursor,
            }
        }
    };

    let fetch_start = Instant::now();
    let exec_millis = elapsed_millis(started_at);
    let mut seq: u64 = 0;
    let mut batch = config.start_batch_size;

    match fetch_next(cursor.as_mut(), &cancel, config.query_timeout).await {
        Fetch::Cancelled => {
            untrack(running, &request);
            return;
        }
        Fetch::Failed(err) => {
            untrack(running, &request);
            error!(request_id = %request.id(), %err, "execution failed");
            let _ = events.send(ExecutionEvent::Failure(ExecutionResponse::failure(
                &request,
                table,
                elapsed_millis(started_at),
                err,
            )));
            return;
        }
        Fetch::Done => {
            // statement produced no rows; completed below with an empty table
        }
        Fetch::Row(values) => {
            let columns = cursor.columns().to_vec();
            if let Err(err) = table
                .set_columns(columns)
                .and_then(|_| table.append_row(seq, values))
            {
                untrack(running, &request);
                error!(request_id = %request.id(), %err, "execution failed");
                let _ = events.send(ExecutionEvent::Failure(ExecutionResponse::failure(
                    &request,
                    table,
                    elapsed_millis(started_at),
                    err,
                )));
                return;
            }
            seq += 1;
            let _ = events.send(ExecutionEvent::FirstRowAvailable(ExecutionResponse::progress(
                &request,
                Arc::clone(&table),
                elapsed_millis(started_at),
                exec_millis,
                elapsed_millis(fetch_start),
            )));

            loop {
                match fetch_next(cursor.as_mut(), &cancel, config.query_timeout).await {
                    Fetch::Cancelled => {
                        untrack(running, &request);
                        return;
                    }
                    Fetch::Failed(err) => {
                        untrack(running, &request);
                        error!(request_id = %request.id(), %err, "execution failed");
                        let _ = events.send(ExecutionEvent::Failure(ExecutionResponse::failure(
                            &request,
                            table,
                            elapsed_millis(started_at),
                            err,
                        )));
                        return;
                    }
                    Fetch::Done => break,
                    Fetch::Row(values) => {
                        if let Err(err) = table.append_row(seq, values) {
                            untrack(running, &request);
                            error!(request_id = %request.id(), %err, "execution failed");
                            let _ = events.send(ExecutionEvent::Failure(
                                ExecutionResponse::failure(
                                    &request,
                                    table,
                                    elapsed_millis(started_at),
                                    err,
                                ),
                            ));
                            return;
                        }
                        seq += 1;
                        // notify every batch-size rows, doubling the batch
                        // up to the ceiling so huge results emit rarely
                        if seq % batch == 0 {
                            batch = (batch * 2).min(config.max_batch_size);
                            let _ = events.send(ExecutionEvent::RowsAvailable(
                                ExecutionResponse::progress(
                                    &request,
                                    Arc::clone(&table),
                                    elapsed_millis(started_at),
                                    exec_millis,
                                    elapsed_millis(fetch_start),
                                ),
                            ));
                        }
                    }
                }
            }
        }
    }

    untrack(running, &request);
    let total_millis = elapsed_millis(started_at);
    let fetch_millis = elapsed_millis(fetch_start);
    info!(
        request_id = %request.id(),
        table_size = table.row_count(),
        total_millis,
        exec_millis,
        fetch_millis,
        "completed"
    );
    let _ = events.send(ExecutionEvent::Completed(ExecutionResponse::progress(
        &request,
        table,
        total_millis,
        exec_millis,
        fetch_millis,
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::{Conn, ConnAttrs};

    #[tokio::test]
    async fn test_submit_requires_start() {
        let executor = SqlExecutor::new(Arc::new(Config::default()));
        let conn = Arc::new(Conn::new(ConnAttrs::new("local")));
        let request = ExecutionRequest::new("tab-1", conn, "SELECT 1");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(executor.submit(request, tx).is_err());
        assert!(!executor.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let executor = SqlExecutor::new(Arc::new(Config::default()));
        executor.start();
        executor.start();
        assert!(executor.is_running());
        executor.stop().await;
        assert!(!executor.is_running());
        // stop again is a tolerated no-op
        executor.stop().await;
    }
}
