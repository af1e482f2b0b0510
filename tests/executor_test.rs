//! End-to-end engine scenarios over the scripted mock driver.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use querydesk::config::Config;
use querydesk::db::connection::{Conn, ConnAttrs};
use querydesk::driver::mock::MockDriver;
use querydesk::driver::{ColumnMeta, SqlType};
use querydesk::error::DeskError;
use querydesk::execution::{ExecutionEvent, ExecutionRequest, SqlExecutor};

fn int_varchar_driver(rows: usize) -> MockDriver {
    MockDriver::new(
        vec![
            ColumnMeta::new("id", SqlType::Integer),
            ColumnMeta::new("name", SqlType::Varchar),
        ],
        (0..rows)
            .map(|i| vec![json!(i as i64), json!(format!("name-{i}"))])
            .collect(),
    )
}

async fn open_conn(name: &str, driver: &MockDriver) -> Arc<Conn> {
    querydesk::logging::init();
    let conn = Arc::new(Conn::new(ConnAttrs::new(name)));
    conn.open(driver).await.unwrap();
    conn
}

fn kind(event: &ExecutionEvent) -> &'static str {
    match event {
        ExecutionEvent::Started(_) => "STARTED",
        ExecutionEvent::FirstRowAvailable(_) => "FIRST_ROW_AVAILABLE",
        ExecutionEvent::RowsAvailable(_) => "ROWS_AVAILABLE",
        ExecutionEvent::Completed(_) => "COMPLETED",
        ExecutionEvent::Cancelled(_) => "CANCELLED",
        ExecutionEvent::Failure(_) => "FAILURE",
    }
}

/// Receive events until a terminal one arrives or the channel closes.
async fn drain(rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    loop {
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for events");
        match received {
            Some(event) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            None => break,
        }
    }
    events
}

#[tokio::test]
async fn test_three_row_select_happy_path() {
    let driver = int_varchar_driver(3);
    let conn = open_conn("local", &driver).await;
    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let request = ExecutionRequest::new("tab-1", conn, "SELECT * FROM t");
    executor.submit(request, tx).unwrap();

    let events = drain(&mut rx).await;
    let kinds: Vec<_> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["STARTED", "FIRST_ROW_AVAILABLE", "COMPLETED"]);

    let completed = events.last().unwrap().response();
    assert_eq!(completed.table().row_count(), 3);
    assert_eq!(completed.table().column_count(), 3); // includes the synthetic #
    assert_eq!(completed.table().column_name(0).unwrap(), "#");
    assert_eq!(completed.table().value_at(1, 2), Some(json!("name-1")));
    assert!(completed.exec_millis() <= completed.total_millis());
    assert!(!completed.is_failure());

    executor.stop().await;
}

#[tokio::test]
async fn test_all_responses_share_one_table() {
    let driver = int_varchar_driver(5);
    let conn = open_conn("local", &driver).await;
    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    executor
        .submit(ExecutionRequest::new("tab-1", conn, "SELECT * FROM t"), tx)
        .unwrap();

    let events = drain(&mut rx).await;
    let table_id = events[0].response().table().id();
    for event in &events {
        assert_eq!(event.response().table().id(), table_id);
    }

    executor.stop().await;
}

#[tokio::test]
async fn test_statement_with_no_rows_completes_with_empty_table() {
    let driver = MockDriver::empty();
    let conn = open_conn("local", &driver).await;
    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    executor
        .submit(ExecutionRequest::new("tab-1", conn, "CREATE TABLE t (n INT)"), tx)
        .unwrap();

    let events = drain(&mut rx).await;
    let kinds: Vec<_> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["STARTED", "COMPLETED"]);
    let completed = events.last().unwrap().response();
    assert_eq!(completed.table().row_count(), 0);
    assert_eq!(completed.table().column_count(), 0);

    executor.stop().await;
}

#[tokio::test]
async fn test_invalid_connection_fails_without_starting() {
    // never opened: the validity probe fails before any fetch is attempted
    let conn = Arc::new(Conn::new(ConnAttrs::new("dead")));
    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    executor
        .submit(ExecutionRequest::new("tab-1", conn, "SELECT 1"), tx)
        .unwrap();

    let events = drain(&mut rx).await;
    let kinds: Vec<_> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["FAILURE"]);
    let failure = events[0].response();
    assert!(matches!(failure.error(), Some(DeskError::Connection(_))));
    assert_eq!(failure.table().row_count(), 0);

    executor.stop().await;
}

#[tokio::test]
async fn test_driver_failure_preserves_partial_rows() {
    let mut driver = int_varchar_driver(10);
    driver.fail_after = Some(2);
    let conn = open_conn("local", &driver).await;
    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    executor
        .submit(ExecutionRequest::new("tab-1", conn, "SELECT * FROM t"), tx)
        .unwrap();

    let events = drain(&mut rx).await;
    let kinds: Vec<_> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["STARTED", "FIRST_ROW_AVAILABLE", "FAILURE"]);
    let failure = events.last().unwrap().response();
    assert!(matches!(failure.error(), Some(DeskError::Driver(_))));
    assert_eq!(failure.table().row_count(), 2);

    executor.stop().await;
}

#[tokio::test]
async fn test_resubmission_preempts_the_running_execution() {
    let mut slow = int_varchar_driver(200);
    slow.row_delay = Some(Duration::from_millis(20));
    let slow_conn = open_conn("slow", &slow).await;

    let fast = int_varchar_driver(3);
    let fast_conn = open_conn("fast", &fast).await;

    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    executor
        .submit(
            ExecutionRequest::new("tab-1", slow_conn, "SELECT * FROM big"),
            tx_a,
        )
        .unwrap();

    // wait until A is demonstrably mid-fetch
    let started = tokio::time::timeout(Duration::from_secs(5), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kind(&started), "STARTED");

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    executor
        .submit(
            ExecutionRequest::new("tab-1", fast_conn, "SELECT * FROM small"),
            tx_b,
        )
        .unwrap();

    // B runs to completion
    let events_b = drain(&mut rx_b).await;
    assert_eq!(kind(events_b.last().unwrap()), "COMPLETED");

    // A goes silent: its channel closes without ever reaching a terminal
    // event
    let events_a = drain(&mut rx_a).await;
    assert!(
        events_a.iter().all(|e| !e.is_terminal()),
        "preempted execution must not emit a terminal event"
    );

    executor.stop().await;
}

#[tokio::test]
async fn test_cancel_mid_fetch_goes_silent_then_resubmission_works() {
    let mut slow = int_varchar_driver(100);
    slow.row_delay = Some(Duration::from_millis(10));
    let slow_conn = open_conn("slow", &slow).await;

    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let request = ExecutionRequest::new("tab-1", slow_conn, "SELECT * FROM big");
    let handle = request.clone();
    executor.submit(request, tx).unwrap();

    assert_eq!(kind(&rx.recv().await.unwrap()), "STARTED");
    assert_eq!(kind(&rx.recv().await.unwrap()), "FIRST_ROW_AVAILABLE");

    executor.cancel_existing(&handle);

    // no further events for the cancelled request; the channel just closes
    let trailing = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("cancelled execution should wind down promptly");
    assert!(trailing.is_none() || !trailing.as_ref().unwrap().is_terminal());

    // the same source can run again immediately
    let fast = int_varchar_driver(3);
    let fast_conn = open_conn("fast", &fast).await;
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    executor
        .submit(ExecutionRequest::new("tab-1", fast_conn, "SELECT * FROM t"), tx2)
        .unwrap();
    let events = drain(&mut rx2).await;
    assert_eq!(kind(events.last().unwrap()), "COMPLETED");

    executor.stop().await;
}

#[tokio::test]
async fn test_notification_count_grows_with_log_of_rows() {
    let config = Config {
        start_batch_size: 10,
        max_batch_size: 80,
        ..Config::default()
    };
    let driver = int_varchar_driver(1000);
    let conn = open_conn("local", &driver).await;
    let executor = SqlExecutor::new(Arc::new(config));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    executor
        .submit(ExecutionRequest::new("tab-1", conn, "SELECT * FROM big"), tx)
        .unwrap();

    let events = drain(&mut rx).await;
    let rows_available = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::RowsAvailable(_)))
        .count();
    // doubling from 10 up to the 80 ceiling over 1000 rows:
    // 10, 20, 40, 80, then every 80 rows up to 960
    assert_eq!(rows_available, 15);
    assert_eq!(
        events.last().unwrap().response().table().row_count(),
        1000
    );

    executor.stop().await;
}

#[tokio::test]
async fn test_sequential_executions_for_one_source() {
    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    for run in 0..2 {
        let driver = int_varchar_driver(3);
        let conn = open_conn("local", &driver).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        executor
            .submit(ExecutionRequest::new("tab-1", conn, "SELECT * FROM t"), tx)
            .unwrap();
        let events = drain(&mut rx).await;
        assert_eq!(kind(events.last().unwrap()), "COMPLETED", "run {run}");
    }

    executor.stop().await;
}

#[tokio::test]
async fn test_queued_request_cancelled_before_running_stays_silent() {
    let mut slow = int_varchar_driver(100);
    slow.row_delay = Some(Duration::from_millis(10));
    let slow_conn = open_conn("slow", &slow).await;
    let other_conn = open_conn("other", &int_varchar_driver(3)).await;

    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    // occupy the single worker
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    executor
        .submit(
            ExecutionRequest::new("tab-1", slow_conn, "SELECT * FROM big"),
            tx_a,
        )
        .unwrap();
    assert_eq!(kind(&rx_a.recv().await.unwrap()), "STARTED");

    // queue work for another source, then cancel it before it can start
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let queued = ExecutionRequest::new("tab-2", other_conn, "SELECT * FROM t");
    let handle = queued.clone();
    executor.submit(queued, tx_b).unwrap();
    executor.cancel_existing(&handle);

    let events_b = drain(&mut rx_b).await;
    assert!(events_b.is_empty(), "cancelled-in-queue emits nothing");

    executor.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_outstanding_work() {
    let mut slow = int_varchar_driver(500);
    slow.row_delay = Some(Duration::from_millis(10));
    let conn = open_conn("slow", &slow).await;

    let executor = SqlExecutor::new(Arc::new(Config::default()));
    executor.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    executor
        .submit(ExecutionRequest::new("tab-1", conn, "SELECT * FROM big"), tx)
        .unwrap();
    assert_eq!(kind(&rx.recv().await.unwrap()), "STARTED");

    executor.stop().await;
    assert!(!executor.is_running());

    let events = drain(&mut rx).await;
    assert!(events.iter().all(|e| !e.is_terminal()));

    // submissions after stop are rejected
    let conn = open_conn("local", &int_varchar_driver(1)).await;
    let (tx2, _rx2) = mpsc::unbounded_channel();
    assert!(executor
        .submit(ExecutionRequest::new("tab-1", conn, "SELECT 1"), tx2)
        .is_err());
}
