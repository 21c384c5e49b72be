//! Thread-safe counters, in-flight transfer accounting and the reporter

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Sender};
use humansize::{format_size, BINARY};
use tracing::info;

/// Progress record for one in-flight transfer
pub struct TransferProgress {
    /// Remote path being transferred
    pub remote: String,
    /// Expected size, -1 if unknown
    pub total: i64,
    bytes: AtomicU64,
    started: Instant,
    last_activity: Mutex<Instant>,
}

impl TransferProgress {
    fn new(remote: String, total: i64) -> Self {
        Self {
            remote,
            total,
            bytes: AtomicU64::new(0),
            started: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Bytes moved so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Instantaneous average rate in bytes/s
    pub fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes() as f64 / elapsed
        } else {
            0.0
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

/// Aggregated run statistics
pub struct Stats {
    started: Instant,
    bytes: AtomicU64,
    checks: AtomicU64,
    transfers: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    total_bytes: AtomicU64,
    in_flight: Mutex<Vec<Arc<TransferProgress>>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    /// Create a fresh aggregator
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Record transferred bytes
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a completed equality check
    pub fn check_done(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed transfer
    pub fn transfer_done(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed deletion
    pub fn delete_done(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error
    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Error count so far
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Transfer count so far
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Deletion count so far
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Check count so far
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Bytes moved so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Add to the expected byte total as transfers are scheduled
    ///
    /// Checkers announce each transfer's size here so the reporter can
    /// compute an ETA once a total is known.
    pub fn add_total_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Clear the error counter before a whole-run retry attempt
    pub fn reset_errors(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }

    /// Register an in-flight transfer
    pub fn start_transfer(&self, remote: &str, total: i64) -> Arc<TransferProgress> {
        let progress = Arc::new(TransferProgress::new(remote.to_string(), total));
        self.in_flight.lock().unwrap().push(Arc::clone(&progress));
        progress
    }

    /// Unregister a finished transfer
    pub fn finish_transfer(&self, progress: &Arc<TransferProgress>) {
        self.in_flight
            .lock()
            .unwrap()
            .retain(|p| !Arc::ptr_eq(p, progress));
    }

    /// Average rate since the run started, bytes/s
    pub fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// ETA based on the announced total, if known and rate is nonzero
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let rate = self.rate();
        if rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes());
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// Render a human-readable snapshot
    pub fn snapshot(&self) -> String {
        let mut out = format!(
            "Transferred: {} ({}/s), Checks: {}, Transferred files: {}, Deleted: {}, Errors: {}, Elapsed: {:.1?}",
            format_size(self.bytes(), BINARY),
            format_size(self.rate() as u64, BINARY),
            self.checks(),
            self.transfers(),
            self.deletes(),
            self.errors(),
            self.started.elapsed(),
        );
        if let Some(eta) = self.eta() {
            out.push_str(&format!(", ETA: {:.0?}", eta));
        }

        let in_flight = self.in_flight.lock().unwrap();
        if !in_flight.is_empty() {
            out.push_str("\nTransferring:");
            for progress in in_flight.iter() {
                let total = if progress.total >= 0 {
                    format_size(progress.total as u64, BINARY)
                } else {
                    "?".to_string()
                };
                out.push_str(&format!(
                    "\n * {}: {}/{} ({}/s)",
                    progress.remote,
                    format_size(progress.bytes(), BINARY),
                    total,
                    format_size(progress.rate() as u64, BINARY),
                ));
            }
        }
        out
    }
}

/// Reader wrapper that feeds the aggregator and enforces the inactivity
/// watchdog on the in-flight byte stream
pub struct AccountedReader<R> {
    inner: R,
    stats: Arc<Stats>,
    progress: Arc<TransferProgress>,
    idle_timeout: Option<Duration>,
}

impl<R: Read> AccountedReader<R> {
    /// Wrap `reader`, attributing bytes to `progress`
    pub fn new(
        inner: R,
        stats: Arc<Stats>,
        progress: Arc<TransferProgress>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            stats,
            progress,
            idle_timeout,
        }
    }
}

impl<R: Read> Read for AccountedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(timeout) = self.idle_timeout {
            if self.progress.idle_for() > timeout {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no data for {:?}", timeout),
                ));
            }
        }

        let n = self.inner.read(buf)?;
        if n > 0 {
            self.progress.bytes.fetch_add(n as u64, Ordering::Relaxed);
            self.stats.add_bytes(n as u64);
            self.progress.touch();
        }
        Ok(n)
    }
}

/// Periodic reporter printing stats snapshots on an interval
pub struct Reporter {
    stop: Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Reporter {
    /// Spawn a reporter waking every `interval`
    pub fn start(stats: Arc<Stats>, interval: Duration) -> Self {
        let (stop, stopped) = bounded::<()>(0);
        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    info!("{}", stats.snapshot());
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the reporter thread
    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        // The thread exits on its own once the stop sender disconnects;
        // joining here could block for a full interval
        let _ = self.stop.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.add_bytes(100);
        stats.check_done();
        stats.transfer_done();
        stats.error();
        stats.error();

        assert_eq!(stats.bytes(), 100);
        assert_eq!(stats.checks(), 1);
        assert_eq!(stats.transfers(), 1);
        assert_eq!(stats.errors(), 2);

        stats.reset_errors();
        assert_eq!(stats.errors(), 0);
        // Cumulative counters survive the reset
        assert_eq!(stats.transfers(), 1);
    }

    #[test]
    fn test_accounted_reader_attributes_bytes() {
        let stats = Arc::new(Stats::new());
        let progress = stats.start_transfer("a.txt", 11);
        let data = b"hello world".to_vec();

        let mut reader = AccountedReader::new(&data[..], Arc::clone(&stats), Arc::clone(&progress), None);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(progress.bytes(), 11);
        assert_eq!(stats.bytes(), 11);

        stats.finish_transfer(&progress);
        assert!(stats.snapshot().starts_with("Transferred:"));
    }

    #[test]
    fn test_snapshot_lists_in_flight() {
        let stats = Stats::new();
        let progress = stats.start_transfer("big.bin", 1024);
        let snapshot = stats.snapshot();
        assert!(snapshot.contains("big.bin"));
        stats.finish_transfer(&progress);
        assert!(!stats.snapshot().contains("big.bin"));
    }

    #[test]
    fn test_eta_requires_total() {
        let stats = Stats::new();
        assert!(stats.eta().is_none());
        stats.add_total_bytes(1024 * 1024);
        stats.add_bytes(512 * 1024);
        // Rate is nonzero once bytes have been recorded
        assert!(stats.eta().is_some());
    }

    #[test]
    fn test_idle_watchdog_trips() {
        struct SlowReader;
        impl Read for SlowReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                std::thread::sleep(Duration::from_millis(30));
                Ok(0)
            }
        }

        let stats = Arc::new(Stats::new());
        let progress = stats.start_transfer("slow", -1);
        let mut reader = AccountedReader::new(
            SlowReader,
            Arc::clone(&stats),
            progress,
            Some(Duration::from_millis(10)),
        );

        let mut buf = [0u8; 16];
        // First read returns EOF after sleeping past the deadline; the next
        // read observes the idle gap and trips the watchdog
        let _ = reader.read(&mut buf);
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
