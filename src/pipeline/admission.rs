//! Admission Controller — bounds how much detection/provisioning work runs
//! at once when many cells become available simultaneously.
//!
//! Strategy: a bounded mpsc queue (excess submissions are shed — safe,
//! because a shed cell is never marked processed and recurs on its next
//! availability signal) drained by a dispatcher that re-checks the dedup
//! cache at dequeue time, then acquires a semaphore permit bounding the
//! number of in-flight operations before spawning the worker.
//!
//! Shutdown semantics (documented contract): once cancelled, the dispatcher
//! stops and queued-but-unstarted cells are discarded; in-flight workers are
//! awaited up to the caller's timeout, then abandoned. Nothing is lost —
//! discarded cells were never marked processed.

use crate::dedup::DedupCache;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// One unit of admitted work: a cell awaiting detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellTask {
    pub world: String,
    pub cell_x: i32,
    pub cell_z: i32,
}

/// Decrements the in-flight counter even when a worker panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded-queue, bounded-concurrency admission of cell work.
pub struct AdmissionController {
    tx: mpsc::Sender<CellTask>,
    in_flight: Arc<AtomicUsize>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl AdmissionController {
    /// Start the controller with its dispatcher task.
    ///
    /// `handler` runs once per admitted cell, at most `max_in_flight`
    /// concurrently. A handler failure or panic affects only its own cell.
    pub fn start<F, Fut>(
        queue_capacity: usize,
        max_in_flight: usize,
        dedup: Arc<DedupCache>,
        handler: F,
    ) -> Self
    where
        F: Fn(CellTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tokio::spawn(dispatch(
            rx,
            max_in_flight.max(1),
            dedup,
            Arc::new(handler),
            Arc::clone(&in_flight),
            cancel.clone(),
            tracker.clone(),
        ));

        Self {
            tx,
            in_flight,
            accepting: AtomicBool::new(true),
            cancel,
            tracker,
        }
    }

    /// Non-blocking submission. Returns false when the cell was shed
    /// (queue full) or the controller is shutting down.
    pub fn submit(&self, task: CellTask) -> bool {
        if !self.accepting.load(Ordering::Relaxed) {
            return false;
        }
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                debug!(
                    world = %task.world,
                    cell_x = task.cell_x,
                    cell_z = task.cell_z,
                    "Cell queue full, shedding (recurs on next availability)"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Cells admitted but not yet dequeued.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Cells currently in detection/provisioning.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Stop accepting new work. Submissions after this return false.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Graceful shutdown: stop the dispatcher (queued entries are
    /// discarded), then wait up to `timeout` for in-flight work. Returns
    /// true when everything finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop_accepting();
        self.cancel.cancel();
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            info!("Abandoning in-flight cell work after shutdown timeout");
        }
        drained
    }
}

async fn dispatch<F, Fut>(
    mut rx: mpsc::Receiver<CellTask>,
    max_in_flight: usize,
    dedup: Arc<DedupCache>,
    handler: Arc<F>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) where
    F: Fn(CellTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_in_flight));
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(task) => task,
                None => break,
            },
        };

        // State may have changed between submit and dequeue; re-check so a
        // cell queued twice in a burst costs one detection, not two.
        if dedup.is_processed(&task.world, task.cell_x, task.cell_z) {
            debug!(
                world = %task.world,
                cell_x = task.cell_x,
                cell_z = task.cell_z,
                "Cell processed while queued, skipping"
            );
            continue;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            acquired = Arc::clone(&semaphore).acquire_owned() => match acquired {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        in_flight.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard(Arc::clone(&in_flight));
        let handler = Arc::clone(&handler);
        tracker.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            handler(task).await;
        });
    }
    tracker.close();
    debug!("Cell dispatcher stopped");
}
