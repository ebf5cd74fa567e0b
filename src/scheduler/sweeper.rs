//! Periodic maintenance of the shared queue.
//!
//! On every tick the sweeper re-queues envelopes whose lease expired, fails
//! jobs older than the maximum lifetime and refreshes the queue-depth gauge.
//! Running more than one sweeper against the same broker is safe.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::coordinator::Coordinator;
use super::job::JobKind;
use super::worker_pool::PoolError;
use crate::metrics::MetricsCollector;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub expired: usize,
}

/// Background task running [`sweep_once`] on an interval.
pub struct Sweeper {
    coordinator: Coordinator,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn new(coordinator: Coordinator, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            coordinator,
            interval,
            shutdown_tx,
            handle: None,
        }
    }

    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.handle.is_some() {
            return Err(PoolError::AlreadyRunning);
        }

        let coordinator = self.coordinator.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.handle = Some(tokio::spawn(async move {
            let metrics = MetricsCollector::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let report = sweep_once(&coordinator, &metrics).await;
                        if report != SweepReport::default() {
                            info!(
                                reclaimed = report.reclaimed,
                                expired = report.expired,
                                "Sweep finished"
                            );
                        }
                    }
                }
            }
            debug!("Sweeper stopped");
        }));

        info!(interval_secs = self.interval.as_secs(), "Sweeper started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        let handle = self.handle.take().ok_or(PoolError::NotRunning)?;
        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "Sweeper task panicked during shutdown");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

/// Runs one maintenance pass. Errors are logged and the pass continues.
pub async fn sweep_once(coordinator: &Coordinator, metrics: &MetricsCollector) -> SweepReport {
    let mut report = SweepReport::default();
    let broker = coordinator.broker();

    for kind in JobKind::ALL {
        match broker.reclaim_expired(kind).await {
            Ok(n) => {
                if n > 0 {
                    warn!(kind = %kind, reclaimed = n, "Re-queued envelopes with expired leases");
                }
                report.reclaimed += n;
            }
            Err(e) => error!(kind = %kind, error = %e, "Failed to reclaim expired leases"),
        }
    }

    match coordinator.sweep_expired().await {
        Ok(n) => report.expired = n,
        Err(e) => error!(error = %e, "Failed to sweep expired jobs"),
    }

    for kind in JobKind::ALL {
        match broker.queue_depth(kind).await {
            Ok(depth) => metrics.update_queue_depth(kind, depth.ready),
            Err(e) => debug!(kind = %kind, error = %e, "Failed to read queue depth"),
        }
    }

    report
}
