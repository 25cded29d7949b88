//! Batched scanned-cell writes.
//!
//! Workers append completions to an in-memory per-world buffer; the buffer
//! is flushed to the ledger either when it reaches the configured batch size
//! or when the periodic timer elapses. The time-based flush is what keeps
//! low-traffic worlds from leaving processed-cell state unpersisted
//! indefinitely.
//!
//! Flushing happens on a dedicated background task, never on the worker
//! path: `push` only buffers and nudges the flusher.

use super::{Ledger, LedgerError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive flush failures before escalating the log level.
const FLUSH_FAILURE_ALERT_THRESHOLD: u64 = 3;

/// Durable write target for a flushed batch. [`Ledger`] is the production
/// sink; the seam exists so flush-failure handling stays testable.
pub trait ScanSink: Send + Sync {
    fn write_scanned(&self, world: &str, cells: &[(i32, i32)]) -> Result<(), LedgerError>;
}

impl ScanSink for Ledger {
    fn write_scanned(&self, world: &str, cells: &[(i32, i32)]) -> Result<(), LedgerError> {
        self.mark_cells_scanned(world, cells)
    }
}

impl<S: ScanSink + ?Sized> ScanSink for Arc<S> {
    fn write_scanned(&self, world: &str, cells: &[(i32, i32)]) -> Result<(), LedgerError> {
        (**self).write_scanned(world, cells)
    }
}

/// Per-world write buffer for scanned-cell marks.
pub struct ScanBatcher<S = Ledger> {
    sink: S,
    buffers: Mutex<HashMap<String, Vec<(i32, i32)>>>,
    batch_size: usize,
    wakeup: Notify,
    /// Consecutive failed flush attempts; resets to zero on success.
    failed_flushes: AtomicU64,
}

impl<S: ScanSink> ScanBatcher<S> {
    pub fn new(sink: S, batch_size: usize) -> Self {
        Self {
            sink,
            buffers: Mutex::new(HashMap::new()),
            batch_size: batch_size.max(1),
            wakeup: Notify::new(),
            failed_flushes: AtomicU64::new(0),
        }
    }

    /// Buffer one completed cell. In-memory only; wakes the flusher task
    /// when this world's buffer reaches the batch size.
    pub fn push(&self, world: &str, cell_x: i32, cell_z: i32) {
        let full = {
            let mut buffers = lock(&self.buffers);
            let buffer = buffers.entry(world.to_string()).or_default();
            buffer.push((cell_x, cell_z));
            buffer.len() >= self.batch_size
        };
        if full {
            self.wakeup.notify_one();
        }
    }

    /// Cells currently buffered across all worlds (not yet durable).
    pub fn buffered(&self) -> usize {
        lock(&self.buffers).values().map(Vec::len).sum()
    }

    /// Consecutive flush failures, surfaced through pipeline status.
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    /// Flush every non-empty world buffer. Entries that fail to write are
    /// re-buffered and retried on the next trigger.
    pub fn flush_all(&self) {
        let worlds: Vec<String> = lock(&self.buffers)
            .iter()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(world, _)| world.clone())
            .collect();
        for world in worlds {
            self.flush_world(&world);
        }
    }

    /// Flush one world's buffer. Returns whether the write succeeded.
    pub fn flush_world(&self, world: &str) -> bool {
        let pending = {
            let mut buffers = lock(&self.buffers);
            match buffers.get_mut(world) {
                Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
                _ => return true,
            }
        };

        match self.sink.write_scanned(world, &pending) {
            Ok(()) => {
                self.failed_flushes.store(0, Ordering::Relaxed);
                debug!(world, cells = pending.len(), "Flushed scanned-cell batch");
                true
            }
            Err(err) => {
                let failures = self.failed_flushes.fetch_add(1, Ordering::Relaxed) + 1;
                // Put the entries back so the next trigger retries them.
                let mut buffers = lock(&self.buffers);
                let buffer = buffers.entry(world.to_string()).or_default();
                let mut restored = pending;
                restored.extend(buffer.drain(..));
                *buffer = restored;
                if failures >= FLUSH_FAILURE_ALERT_THRESHOLD {
                    warn!(
                        world,
                        failures, "Scanned-cell flush failing repeatedly: {err}"
                    );
                } else {
                    warn!(world, "Scanned-cell flush failed, will retry: {err}");
                }
                false
            }
        }
    }

    /// Background flush loop: runs until cancelled, flushing on the interval
    /// timer or when a buffer fills. Performs a final flush on shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            batch_size = self.batch_size,
            "Scanned-cell flusher started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.flush_all(),
                _ = self.wakeup.notified() => self.flush_all(),
            }
        }
        self.flush_all();
        info!("Scanned-cell flusher stopped");
    }
}

fn lock<'a>(
    buffers: &'a Mutex<HashMap<String, Vec<(i32, i32)>>>,
) -> std::sync::MutexGuard<'a, HashMap<String, Vec<(i32, i32)>>> {
    match buffers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Sink that fails while the flag is set, recording successful writes.
    struct FlakySink {
        failing: AtomicBool,
        written: Mutex<Vec<(String, Vec<(i32, i32)>)>>,
    }

    impl FlakySink {
        fn new(failing: bool) -> Self {
            Self {
                failing: AtomicBool::new(failing),
                written: Mutex::new(Vec::new()),
            }
        }

        fn written_cells(&self) -> usize {
            self.written
                .lock()
                .expect("lock")
                .iter()
                .map(|(_, cells)| cells.len())
                .sum()
        }
    }

    impl ScanSink for FlakySink {
        fn write_scanned(&self, world: &str, cells: &[(i32, i32)]) -> Result<(), LedgerError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LedgerError::Storage(sled::Error::Unsupported(
                    "sink offline".to_string(),
                )));
            }
            self.written
                .lock()
                .expect("lock")
                .push((world.to_string(), cells.to_vec()));
            Ok(())
        }
    }

    fn temp_batcher(batch_size: usize) -> (tempfile::TempDir, Ledger, Arc<ScanBatcher>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::open(dir.path()).expect("open ledger");
        let batcher = Arc::new(ScanBatcher::new(ledger.clone(), batch_size));
        (dir, ledger, batcher)
    }

    #[test]
    fn forced_flush_persists_partial_batch() {
        let (_dir, ledger, batcher) = temp_batcher(50);
        batcher.push("w", 1, 1);
        batcher.push("w", 2, 2);
        batcher.push("w", 3, 3);
        assert_eq!(batcher.buffered(), 3);
        assert!(!ledger.is_cell_scanned("w", 1, 1).expect("check"));

        batcher.flush_all();
        assert_eq!(batcher.buffered(), 0);
        for &(x, z) in &[(1, 1), (2, 2), (3, 3)] {
            assert!(ledger.is_cell_scanned("w", x, z).expect("check"));
        }
    }

    #[tokio::test]
    async fn full_buffer_triggers_automatic_flush() {
        let (_dir, ledger, batcher) = temp_batcher(2);
        let cancel = CancellationToken::new();
        let flusher = tokio::spawn(
            Arc::clone(&batcher).run(Duration::from_secs(3600), cancel.clone()),
        );

        batcher.push("w", 0, 0);
        batcher.push("w", 0, 1);

        // Wait for the wakeup-driven flush to land.
        for _ in 0..100 {
            if batcher.buffered() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(batcher.buffered(), 0);
        assert!(ledger.is_cell_scanned("w", 0, 1).expect("check"));

        cancel.cancel();
        flusher.await.expect("flusher join");
    }

    #[test]
    fn failed_flush_rebuffers_entries_and_counts_failures() {
        let sink = Arc::new(FlakySink::new(true));
        let batcher = ScanBatcher::new(Arc::clone(&sink), 50);

        batcher.push("w", 1, 1);
        batcher.push("w", 2, 2);

        // Sink down: nothing written, nothing lost.
        assert!(!batcher.flush_world("w"));
        assert_eq!(batcher.buffered(), 2);
        assert_eq!(batcher.failed_flushes(), 1);
        assert_eq!(sink.written_cells(), 0);

        // Entries pushed while the flush was failing are retried too.
        batcher.push("w", 3, 3);
        assert!(!batcher.flush_world("w"));
        assert_eq!(batcher.buffered(), 3);
        assert_eq!(batcher.failed_flushes(), 2);

        // Sink recovers: the next trigger drains everything and the failure
        // counter resets.
        sink.failing.store(false, Ordering::SeqCst);
        assert!(batcher.flush_world("w"));
        assert_eq!(batcher.buffered(), 0);
        assert_eq!(batcher.failed_flushes(), 0);
        assert_eq!(sink.written_cells(), 3);
    }

    #[tokio::test]
    async fn shutdown_flushes_remainder() {
        let (_dir, ledger, batcher) = temp_batcher(100);
        let cancel = CancellationToken::new();
        let flusher = tokio::spawn(
            Arc::clone(&batcher).run(Duration::from_secs(3600), cancel.clone()),
        );

        batcher.push("w", 7, 7);
        cancel.cancel();
        flusher.await.expect("flusher join");
        assert!(ledger.is_cell_scanned("w", 7, 7).expect("check"));
    }
}
