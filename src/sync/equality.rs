//! The equality oracle
//!
//! Given a source and destination object, decides whether a transfer is
//! needed. The decision order is: `--ignore-existing`, `--size-only`,
//! `--checksum` (falling back to mod times when the backends share no
//! hash algorithm), then mod times within the modify window. When sizes
//! match but mod times differ, a matching hash upgrades the verdict to
//! "equal, but fix the destination's mod time"; that repair is suppressed
//! under `--checksum` and `--size-only`.

use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::backend::{Backend, Object, MOD_TIME_NOT_SUPPORTED};
use crate::config::SyncOptions;
use crate::hash::{hashes_equal, HashTypeSet};

/// Oracle verdict for one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Equality {
    /// Identical; skip the transfer
    Equal,
    /// Identical content but destination mod time needs repair
    EqualRepairModTime,
    /// A transfer is needed
    Differ,
}

/// The effective mod-time comparison window for a backend pair
///
/// The larger of source precision, destination precision and the
/// configured window.
pub fn modify_window(
    src_backend: &dyn Backend,
    dst_backend: &dyn Backend,
    opts: &SyncOptions,
) -> Duration {
    opts.modify_window
        .max(src_backend.precision())
        .max(dst_backend.precision())
}

fn abs_diff(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b).unwrap_or_else(|e| e.duration())
}

/// Compare objects by any common hash
///
/// `Some(true)` when a shared kind matches, `Some(false)` on a definite
/// mismatch, `None` when no comparison was possible. A missing hash on
/// either side is unknown, never unequal, and hash *fetch* failures are
/// logged and treated the same way.
pub fn compare_hashes(
    src: &dyn Object,
    dst: &dyn Object,
    common: HashTypeSet,
) -> Option<bool> {
    for kind in common.kinds() {
        let src_hash = match src.hash(kind) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("{}: failed to read {} hash: {}", src.remote(), kind, err);
                None
            }
        };
        let dst_hash = match dst.hash(kind) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("{}: failed to read {} hash: {}", dst.remote(), kind, err);
                None
            }
        };
        if let (Some(s), Some(d)) = (src_hash, dst_hash) {
            return Some(hashes_equal(&s, &d));
        }
    }
    None
}

/// Decide whether `src` and `dst` are identical
pub fn check_equal(
    src: &dyn Object,
    dst: &dyn Object,
    src_backend: &dyn Backend,
    dst_backend: &dyn Backend,
    opts: &SyncOptions,
) -> Equality {
    if opts.ignore_existing {
        debug!("{}: exists on destination, skipping", src.remote());
        return Equality::Equal;
    }

    if src.size() != dst.size() {
        debug!(
            "{}: sizes differ ({} vs {})",
            src.remote(),
            src.size(),
            dst.size()
        );
        return Equality::Differ;
    }

    if opts.size_only {
        return Equality::Equal;
    }

    let common = src_backend.hashes().overlap(dst_backend.hashes());

    if opts.checksum && !common.is_empty() {
        return match compare_hashes(src, dst, common) {
            Some(false) => {
                debug!("{}: hashes differ", src.remote());
                Equality::Differ
            }
            // A match, or unknown: never unequal on a missing hash
            _ => Equality::Equal,
        };
    }

    let window = modify_window(src_backend, dst_backend, opts);
    if window >= MOD_TIME_NOT_SUPPORTED {
        // No usable mod times on this pair; sizes matching is all we have
        return Equality::Equal;
    }

    let dt = abs_diff(src.mod_time(), dst.mod_time());
    if dt <= window {
        return Equality::Equal;
    }

    // Sizes equal, mod times differ: a matching hash proves content is
    // identical and only the destination mod time needs repair
    match compare_hashes(src, dst, common) {
        Some(true) => {
            debug!(
                "{}: mod times differ but hashes match, repairing mod time",
                src.remote()
            );
            Equality::EqualRepairModTime
        }
        Some(false) => Equality::Differ,
        None => {
            debug!(
                "{}: mod times differ by {:?} (window {:?})",
                src.remote(),
                dt,
                window
            );
            Equality::Differ
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::Backend;
    use std::io::Read;

    struct FakeObject {
        remote: String,
        size: i64,
        mod_time: SystemTime,
        md5: Option<String>,
    }

    impl Object for FakeObject {
        fn remote(&self) -> &str {
            &self.remote
        }
        fn size(&self) -> i64 {
            self.size
        }
        fn mod_time(&self) -> SystemTime {
            self.mod_time
        }
        fn set_mod_time(&self, _t: SystemTime) -> crate::error::Result<()> {
            Ok(())
        }
        fn hash(&self, kind: crate::hash::HashKind) -> crate::error::Result<Option<String>> {
            Ok(match kind {
                crate::hash::HashKind::Md5 => self.md5.clone(),
                crate::hash::HashKind::Sha1 => None,
            })
        }
        fn open(&self) -> crate::error::Result<Box<dyn Read + Send>> {
            unimplemented!("not needed for equality tests")
        }
        fn update(
            &self,
            _reader: &mut dyn Read,
            _mod_time: SystemTime,
            _size: i64,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        fn remove(&self) -> crate::error::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn obj(size: i64, secs_ago: u64, md5: Option<&str>) -> FakeObject {
        FakeObject {
            remote: "test.txt".to_string(),
            size,
            mod_time: SystemTime::now() - Duration::from_secs(secs_ago),
            md5: md5.map(str::to_string),
        }
    }

    fn backends() -> (MemoryBackend, MemoryBackend) {
        (
            MemoryBackend::new("eq-src", ""),
            MemoryBackend::new("eq-dst", ""),
        )
    }

    #[test]
    fn test_size_mismatch_differs() {
        let (src_b, dst_b) = backends();
        let verdict = check_equal(
            &obj(10, 100, None),
            &obj(20, 100, None),
            &src_b,
            &dst_b,
            &SyncOptions::default(),
        );
        assert_eq!(verdict, Equality::Differ);
    }

    #[test]
    fn test_equal_within_window() {
        let (src_b, dst_b) = backends();
        let t = SystemTime::now();
        let src = FakeObject {
            mod_time: t,
            ..obj(10, 0, None)
        };
        let dst = FakeObject {
            mod_time: t,
            ..obj(10, 0, None)
        };
        let verdict = check_equal(&src, &dst, &src_b, &dst_b, &SyncOptions::default());
        assert_eq!(verdict, Equality::Equal);
    }

    #[test]
    fn test_size_only_ignores_mtime() {
        let (src_b, dst_b) = backends();
        let opts = SyncOptions {
            size_only: true,
            ..Default::default()
        };
        let verdict = check_equal(&obj(10, 0, None), &obj(10, 9999, None), &src_b, &dst_b, &opts);
        assert_eq!(verdict, Equality::Equal);
    }

    #[test]
    fn test_ignore_existing_always_equal() {
        let (src_b, dst_b) = backends();
        let opts = SyncOptions {
            ignore_existing: true,
            ..Default::default()
        };
        let verdict = check_equal(&obj(10, 0, None), &obj(99, 9999, None), &src_b, &dst_b, &opts);
        assert_eq!(verdict, Equality::Equal);
    }

    #[test]
    fn test_checksum_mode() {
        let (src_b, dst_b) = backends();
        let opts = SyncOptions {
            checksum: true,
            ..Default::default()
        };

        // Matching hashes, wildly different mtimes: equal, no repair
        let verdict = check_equal(
            &obj(10, 0, Some("aa")),
            &obj(10, 9999, Some("AA")),
            &src_b,
            &dst_b,
            &opts,
        );
        assert_eq!(verdict, Equality::Equal);

        // Mismatched hashes differ
        let verdict = check_equal(
            &obj(10, 0, Some("aa")),
            &obj(10, 0, Some("bb")),
            &src_b,
            &dst_b,
            &opts,
        );
        assert_eq!(verdict, Equality::Differ);

        // Unknown hash is never unequal
        let verdict = check_equal(
            &obj(10, 0, Some("aa")),
            &obj(10, 9999, None),
            &src_b,
            &dst_b,
            &opts,
        );
        assert_eq!(verdict, Equality::Equal);
    }

    #[test]
    fn test_mtime_drift_with_matching_hash_repairs() {
        let (src_b, dst_b) = backends();
        let verdict = check_equal(
            &obj(10, 0, Some("aa")),
            &obj(10, 3600, Some("aa")),
            &src_b,
            &dst_b,
            &SyncOptions::default(),
        );
        assert_eq!(verdict, Equality::EqualRepairModTime);
    }

    #[test]
    fn test_mtime_drift_without_hash_transfers() {
        let (src_b, dst_b) = backends();
        let verdict = check_equal(
            &obj(10, 0, None),
            &obj(10, 3600, None),
            &src_b,
            &dst_b,
            &SyncOptions::default(),
        );
        assert_eq!(verdict, Equality::Differ);
    }

    #[test]
    fn test_modify_window_takes_coarsest() {
        let (src_b, dst_b) = backends();
        let opts = SyncOptions {
            modify_window: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(
            modify_window(&src_b, &dst_b, &opts),
            Duration::from_secs(10)
        );

        let opts = SyncOptions::default();
        // Memory backends have 1ns precision
        assert_eq!(modify_window(&src_b, &dst_b, &opts), Duration::from_nanos(1));
    }

    #[test]
    fn test_mtime_drift_within_configured_window() {
        let (src_b, dst_b) = backends();
        let opts = SyncOptions {
            modify_window: Duration::from_secs(10),
            ..Default::default()
        };
        let verdict = check_equal(
            &obj(10, 0, None),
            &obj(10, 5, None),
            &src_b,
            &dst_b,
            &opts,
        );
        assert_eq!(verdict, Equality::Equal);
    }
}
