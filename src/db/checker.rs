//! Periodic connection validity checking.
//!
//! A connection stops being valid when it was previously open and then
//! became unresponsive, e.g. after a server-side failure. Connections are
//! obtained through a supplier on every cycle — the checker never owns
//! their lifetime. Only open connections are probed; probes run
//! concurrently up to the configured worker count since any of them may
//! block for the full probe timeout. Connections found invalid are closed
//! on the spot and handed to the consumer as one batch per cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::connection::Conn;

pub type ConnSupplier = Arc<dyn Fn() -> Vec<Arc<Conn>> + Send + Sync>;
pub type LostConnConsumer = Arc<dyn Fn(Vec<Arc<Conn>>) + Send + Sync>;

pub struct ConnChecker {
    config: Arc<Config>,
    supplier: ConnSupplier,
    on_lost: LostConnConsumer,
    checking: Arc<AtomicBool>,
    worker: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl ConnChecker {
    pub fn new(config: Arc<Config>, supplier: ConnSupplier, on_lost: LostConnConsumer) -> Self {
        Self {
            config,
            supplier,
            on_lost,
            checking: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Begin the fixed-period check cycle. No-op when already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let supplier = Arc::clone(&self.supplier);
        let on_lost = Arc::clone(&self.on_lost);
        let checking = Arc::clone(&self.checking);
        let config = Arc::clone(&self.config);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let period = config.check_period;
            let mut ticks =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticks.tick() => {
                        tokio::select! {
                            _ = loop_token.cancelled() => break,
                            _ = validity_cycle(&supplier, &on_lost, &checking, &config, &loop_token) => {}
                        }
                    }
                }
            }
        });
        *guard = Some((handle, token));
        info!(
            period_secs = self.config.check_period.as_secs(),
            "connectivity check scheduled"
        );
    }

    /// Run one validity cycle immediately. A no-op while another cycle is
    /// still collecting its probes.
    pub async fn check_now(&self) {
        let token = match &*self.worker.lock() {
            Some((_, token)) => token.clone(),
            None => CancellationToken::new(),
        };
        validity_cycle(
            &self.supplier,
            &self.on_lost,
            &self.checking,
            &self.config,
            &token,
        )
        .await;
    }

    /// Cancel the schedule and any in-flight probes, then wait a bounded
    /// grace period for the worker.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some((handle, token)) = worker else {
            return;
        };
        token.cancel();
        let grace = self.config.shutdown_grace;
        let mut handle = handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            handle.abort();
            let _ = tokio::time::timeout(grace, &mut handle).await;
        }
        self.checking.store(false, Ordering::Release);
        info!("connectivity check stopped");
    }
}

async fn validity_cycle(
    supplier: &ConnSupplier,
    on_lost: &LostConnConsumer,
    checking: &AtomicBool,
    config: &Config,
    cancel: &CancellationToken,
) {
    // a cycle that is still collecting probes makes a new trigger a no-op
    if checking
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let semaphore = Arc::new(Semaphore::new(config.probe_workers.max(1)));
    let mut probes = Vec::new();
    for conn in (supplier)().into_iter().filter(|c| c.is_open()) {
        let semaphore = Arc::clone(&semaphore);
        let probe_timeout = config.probe_timeout;
        let cancel = cancel.clone();
        probes.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return None;
            };
            let valid = tokio::select! {
                _ = cancel.cancelled() => return None,
                // a failed probe closes the handle as a side effect, so
                // "invalid" and "open" never disagree for long
                valid = conn.is_valid(probe_timeout) => valid,
            };
            if valid {
                None
            } else {
                Some(conn)
            }
        }));
    }

    let mut lost: Vec<Arc<Conn>> = Vec::new();
    for probe in probes {
        match probe.await {
            Ok(Some(conn)) => lost.push(conn),
            Ok(None) => {}
            Err(e) => error!("validity probe task failed: {e}"),
        }
    }
    if !lost.is_empty() {
        warn!(count = lost.len(), "connections lost");
        (on_lost)(lost);
    }
    checking.store(false, Ordering::Release);
}
