//! Bandwidth throttling for controlled transfer rates
//!
//! Implements rate limiting using the Governor crate for smooth,
//! token-bucket based bandwidth control. One limiter is shared by every
//! transfer worker in the process, and it sits on the *read* side of the
//! uploader so bytes leaving the source are throttled uniformly
//! regardless of destination buffering.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Token granularity; 1 KiB tokens keep the bucket smooth at low rates
const BYTES_PER_TOKEN: usize = 1024;

/// Process-wide bandwidth limiter
#[derive(Clone)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl BandwidthLimiter {
    /// Create a limiter capped at `bytes_per_second`
    pub fn new(bytes_per_second: u64) -> Self {
        let tokens_per_second = (bytes_per_second as usize / BYTES_PER_TOKEN).max(1);
        let capped = tokens_per_second.min(u32::MAX as usize) as u32;
        let quota = Quota::per_second(NonZeroU32::new(capped).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: Some(Arc::new(RateLimiter::direct(quota))),
        }
    }

    /// Create a limiter that never throttles
    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    /// Build from the parsed `--bwlimit` value
    pub fn from_option(bwlimit: Option<u64>) -> Self {
        match bwlimit {
            Some(rate) if rate > 0 => Self::new(rate),
            _ => Self::unlimited(),
        }
    }

    /// Whether a rate cap is active
    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Block until `bytes` may be transferred
    pub fn wait_for_capacity(&self, bytes: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let tokens_needed = (bytes / BYTES_PER_TOKEN).max(1);
        for _ in 0..tokens_needed {
            while limiter.check().is_err() {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
    }

    /// Try to acquire capacity without blocking
    pub fn try_acquire(&self, bytes: usize) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };

        let tokens_needed = (bytes / BYTES_PER_TOKEN).max(1);
        for _ in 0..tokens_needed {
            if limiter.check().is_err() {
                return false;
            }
        }
        true
    }
}

/// Reader wrapper that limits read bandwidth
pub struct ThrottledReader<R> {
    inner: R,
    limiter: BandwidthLimiter,
}

impl<R: std::io::Read> ThrottledReader<R> {
    /// Wrap `reader` behind the shared limiter
    pub fn new(reader: R, limiter: BandwidthLimiter) -> Self {
        Self {
            inner: reader,
            limiter,
        }
    }
}

impl<R: std::io::Read> std::io::Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.limiter.wait_for_capacity(buf.len());
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_unlimited_never_blocks() {
        let limiter = BandwidthLimiter::unlimited();
        assert!(!limiter.is_limited());
        assert!(limiter.try_acquire(usize::MAX));
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = BandwidthLimiter::new(100 * 1024 * 1024);
        assert!(limiter.is_limited());
        assert!(limiter.try_acquire(1024));
    }

    #[test]
    fn test_from_option() {
        assert!(!BandwidthLimiter::from_option(None).is_limited());
        assert!(!BandwidthLimiter::from_option(Some(0)).is_limited());
        assert!(BandwidthLimiter::from_option(Some(1024)).is_limited());
    }

    #[test]
    fn test_throttled_reader_passes_data() {
        let data = vec![0xABu8; 4096];
        let mut reader = ThrottledReader::new(&data[..], BandwidthLimiter::unlimited());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_bucket_enforces_rate() {
        // 8 KiB/s bucket; an initial burst is allowed, after which a large
        // grab must be refused until tokens refill
        let limiter = BandwidthLimiter::new(8 * 1024);
        while limiter.try_acquire(1024) {}
        assert!(!limiter.try_acquire(64 * 1024));
    }
}
