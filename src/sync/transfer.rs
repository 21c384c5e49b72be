//! Checker and transferrer worker pools
//!
//! Checkers evaluate the equality oracle; transferrers execute copies and
//! deletions. Both are bounded pools fed by channels so network-heavy
//! decision making overlaps with data movement. Server-side copy is used
//! when both endpoints share a backend that implements it; otherwise the
//! source is streamed through the shared bandwidth limiter into the
//! destination and the written object is verified by size and common
//! hash, with a corrupted destination removed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Object, MOD_TIME_NOT_SUPPORTED};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::progress::{AccountedReader, Stats};
use crate::sync::equality::{check_equal, compare_hashes, Equality};
use crate::throttle::{BandwidthLimiter, ThrottledReader};

/// Work item for the checker pool
pub enum CheckTask {
    /// Pair present on both sides; decide equality
    Pair {
        /// Source object
        src: Box<dyn Object>,
        /// Destination object
        dst: Box<dyn Object>,
    },
    /// Source-only entry; upload unconditionally
    Upload {
        /// Source object
        src: Box<dyn Object>,
        /// Target remote name
        remote: String,
    },
}

/// Work item for the transferrer pool
pub enum TransferJob {
    /// Copy source content to the destination remote
    Copy {
        /// Source object
        src: Box<dyn Object>,
        /// Existing destination object to update in place, if any
        dst: Option<Box<dyn Object>>,
        /// Target remote name
        remote: String,
        /// Remove the source after a successful copy (move semantics)
        move_src: bool,
    },
    /// Delete the destination object
    Delete {
        /// Destination object
        dst: Box<dyn Object>,
    },
}

/// Shared state for one reconciliation run
pub struct TransferContext {
    /// Source backend
    pub src_backend: Arc<dyn Backend>,
    /// Destination backend
    pub dst_backend: Arc<dyn Backend>,
    /// Runtime options
    pub opts: SyncOptions,
    /// Stats aggregator
    pub stats: Arc<Stats>,
    /// Process-wide bandwidth limiter
    pub limiter: BandwidthLimiter,
    /// Equality-only mode: report differences, never mutate
    pub check_only: bool,
    /// Remove sources after successful transfers (move semantics)
    pub move_src: bool,
}

/// Spawn the checker pool
///
/// Checkers forward pairs needing data movement to `transfer_tx`; equal
/// pairs are counted and, when only the destination mod time is stale,
/// repaired in place.
pub fn spawn_checkers(
    ctx: Arc<TransferContext>,
    check_rx: Receiver<CheckTask>,
    transfer_tx: Sender<TransferJob>,
) -> Vec<JoinHandle<()>> {
    (0..ctx.opts.checkers)
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            let check_rx = check_rx.clone();
            let transfer_tx = transfer_tx.clone();
            std::thread::spawn(move || {
                for task in check_rx.iter() {
                    check_one(&ctx, task, &transfer_tx);
                }
                debug!("checker {} finished", worker);
            })
        })
        .collect()
}

fn check_one(ctx: &TransferContext, task: CheckTask, transfer_tx: &Sender<TransferJob>) {
    match task {
        CheckTask::Upload { src, remote } => {
            ctx.stats.check_done();
            if ctx.check_only {
                error!("{}: missing on destination", remote);
                ctx.stats.error();
                return;
            }
            announce_transfer_size(ctx, src.as_ref());
            let _ = transfer_tx.send(TransferJob::Copy {
                src,
                dst: None,
                remote,
                move_src: ctx.move_src,
            });
        }
        CheckTask::Pair { src, dst } => {
            let verdict = check_equal(
                src.as_ref(),
                dst.as_ref(),
                ctx.src_backend.as_ref(),
                ctx.dst_backend.as_ref(),
                &ctx.opts,
            );
            ctx.stats.check_done();
            match verdict {
                Equality::Equal => {
                    debug!("{}: unchanged, skipping", src.remote());
                    if ctx.move_src && !ctx.check_only {
                        remove_source(ctx, src.as_ref());
                    }
                }
                Equality::EqualRepairModTime => {
                    if !ctx.check_only {
                        repair_mod_time(ctx, src.as_ref(), dst.as_ref());
                        if ctx.move_src {
                            remove_source(ctx, src.as_ref());
                        }
                    }
                }
                Equality::Differ => {
                    if ctx.check_only {
                        error!("{}: differs", src.remote());
                        ctx.stats.error();
                        return;
                    }
                    announce_transfer_size(ctx, src.as_ref());
                    let remote = dst.remote().to_string();
                    let _ = transfer_tx.send(TransferJob::Copy {
                        src,
                        dst: Some(dst),
                        remote,
                        move_src: ctx.move_src,
                    });
                }
            }
        }
    }
}

fn announce_transfer_size(ctx: &TransferContext, src: &dyn Object) {
    if src.size() > 0 {
        ctx.stats.add_total_bytes(src.size() as u64);
    }
}

fn repair_mod_time(ctx: &TransferContext, src: &dyn Object, dst: &dyn Object) {
    if ctx.dst_backend.precision() >= MOD_TIME_NOT_SUPPORTED {
        return;
    }
    if ctx.opts.dry_run {
        info!("{}: not updating mod time (--dry-run)", dst.remote());
        return;
    }
    if let Err(err) = dst.set_mod_time(src.mod_time()) {
        warn!("{}: failed to update mod time: {}", dst.remote(), err);
        ctx.stats.error();
    }
}

fn remove_source(ctx: &TransferContext, src: &dyn Object) {
    if ctx.opts.dry_run {
        info!("{}: not removing source (--dry-run)", src.remote());
        return;
    }
    if let Err(err) = src.remove() {
        error!("{}: failed to remove source: {}", src.remote(), err);
        ctx.stats.error();
    }
}

/// Spawn the transferrer pool
pub fn spawn_transferrers(
    ctx: Arc<TransferContext>,
    transfer_rx: Receiver<TransferJob>,
) -> Vec<JoinHandle<()>> {
    (0..ctx.opts.transfers)
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            let transfer_rx = transfer_rx.clone();
            std::thread::spawn(move || {
                for job in transfer_rx.iter() {
                    run_job(&ctx, job);
                }
                debug!("transferrer {} finished", worker);
            })
        })
        .collect()
}

fn run_job(ctx: &TransferContext, job: TransferJob) {
    match job {
        TransferJob::Copy {
            src,
            dst,
            remote,
            move_src,
        } => {
            match copy_object(ctx, src.as_ref(), dst.as_deref(), &remote) {
                Ok(()) => {
                    if move_src {
                        remove_source(ctx, src.as_ref());
                    }
                }
                Err(err) => {
                    error!("{}: {}", remote, err);
                    ctx.stats.error();
                }
            }
        }
        TransferJob::Delete { dst } => {
            if let Err(err) = delete_object(ctx, dst.as_ref()) {
                error!("{}: {}", dst.remote(), err);
                ctx.stats.error();
            }
        }
    }
}

/// Copy one object to the destination, server-side when possible
pub fn copy_object(
    ctx: &TransferContext,
    src: &dyn Object,
    dst: Option<&dyn Object>,
    remote: &str,
) -> Result<()> {
    if ctx.dst_backend.ignores(remote) {
        warn!("{}: destination refuses this name, skipping", remote);
        return Ok(());
    }

    if ctx.opts.dry_run {
        info!("{}: not copying (--dry-run)", remote);
        ctx.stats.transfer_done();
        return Ok(());
    }

    // Server-side copy avoids transit entirely when both endpoints are
    // the same backend and it advertises the capability
    if ctx.src_backend.name() == ctx.dst_backend.name() {
        if let Some(copier) = ctx.dst_backend.as_copier() {
            match copier.copy(src, remote) {
                Ok(_) => {
                    debug!("{}: server-side copied", remote);
                    ctx.stats.transfer_done();
                    return Ok(());
                }
                Err(err) if err.is_capability_miss() => {
                    debug!("{}: server-side copy refused, streaming", remote);
                }
                Err(err) => return Err(err),
            }
        }
    }

    let progress = ctx.stats.start_transfer(remote, src.size());
    let result = stream_copy(ctx, src, dst, remote, &progress);
    ctx.stats.finish_transfer(&progress);
    result?;

    ctx.stats.transfer_done();
    debug!("{}: copied", remote);
    Ok(())
}

fn stream_copy(
    ctx: &TransferContext,
    src: &dyn Object,
    dst: Option<&dyn Object>,
    remote: &str,
    progress: &Arc<crate::progress::TransferProgress>,
) -> Result<()> {
    let reader = src.open()?;
    let throttled = ThrottledReader::new(reader, ctx.limiter.clone());
    let mut accounted = AccountedReader::new(
        throttled,
        Arc::clone(&ctx.stats),
        Arc::clone(progress),
        Some(ctx.opts.timeout),
    );

    let written: Box<dyn Object> = match dst {
        Some(existing) => {
            existing
                .update(&mut accounted, src.mod_time(), src.size())
                .map_err(|e| stalled_to_timeout(e, ctx.opts.timeout))?;
            ctx.dst_backend
                .stat(remote)?
                .ok_or_else(|| SyncError::ObjectNotFound(remote.to_string()))?
        }
        None => ctx
            .dst_backend
            .put(&mut accounted, remote, src.mod_time(), src.size())
            .map_err(|e| stalled_to_timeout(e, ctx.opts.timeout))?,
    };

    verify_transfer(ctx, src, written.as_ref(), remote)
}

/// A watchdog trip surfaces as a TimedOut io error inside the backend's
/// put/update; translate it to the typed inactivity timeout
fn stalled_to_timeout(err: SyncError, timeout: Duration) -> SyncError {
    match &err {
        SyncError::Io { source, .. } if source.kind() == std::io::ErrorKind::TimedOut => {
            SyncError::TransferTimeout(timeout.as_secs())
        }
        _ => err,
    }
}

fn verify_transfer(
    ctx: &TransferContext,
    src: &dyn Object,
    written: &dyn Object,
    remote: &str,
) -> Result<()> {
    let mut corruption: Option<String> = None;

    if src.size() >= 0 && written.size() >= 0 && src.size() != written.size() {
        corruption = Some(format!(
            "size mismatch, expected {} got {}",
            src.size(),
            written.size()
        ));
    } else {
        let common = ctx.src_backend.hashes().overlap(ctx.dst_backend.hashes());
        if compare_hashes(src, written, common) == Some(false) {
            corruption = Some("hash mismatch after transfer".to_string());
        }
    }

    let Some(detail) = corruption else {
        return Ok(());
    };

    // Leave no corrupted object behind
    if let Err(err) = written.remove() {
        warn!("{}: failed to remove corrupted destination: {}", remote, err);
    }
    Err(SyncError::corrupted(remote, detail))
}

/// Delete one destination object
pub fn delete_object(ctx: &TransferContext, dst: &dyn Object) -> Result<()> {
    if ctx.opts.dry_run {
        info!("{}: not deleting (--dry-run)", dst.remote());
        ctx.stats.delete_done();
        return Ok(());
    }
    dst.remove()?;
    ctx.stats.delete_done();
    debug!("{}: deleted", dst.remote());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::time::SystemTime;

    fn put(backend: &MemoryBackend, remote: &str, content: &[u8]) {
        let mut reader: &[u8] = content;
        backend
            .put(&mut reader, remote, SystemTime::now(), content.len() as i64)
            .unwrap();
    }

    fn context(src: &str, dst: &str) -> TransferContext {
        MemoryBackend::clear(src);
        MemoryBackend::clear(dst);
        TransferContext {
            src_backend: Arc::new(MemoryBackend::new(src, "")),
            dst_backend: Arc::new(MemoryBackend::new(dst, "")),
            opts: SyncOptions::default(),
            stats: Arc::new(Stats::new()),
            limiter: BandwidthLimiter::unlimited(),
            check_only: false,
            move_src: false,
        }
    }

    #[test]
    fn test_stream_copy_puts_and_verifies() {
        let ctx = context("tr-src", "tr-dst");
        let src_backend = MemoryBackend::new("tr-src", "");
        put(&src_backend, "a.txt", b"hello");

        let src = src_backend.stat("a.txt").unwrap().unwrap();
        copy_object(&ctx, src.as_ref(), None, "a.txt").unwrap();

        let dst_backend = MemoryBackend::new("tr-dst", "");
        let copied = dst_backend.stat("a.txt").unwrap().unwrap();
        assert_eq!(copied.size(), 5);
        assert_eq!(ctx.stats.transfers(), 1);
        assert_eq!(ctx.stats.bytes(), 5);
    }

    #[test]
    fn test_server_side_copy_moves_no_bytes() {
        MemoryBackend::clear("tr-same");
        let backend = MemoryBackend::new("tr-same", "");
        put(&backend, "dir1/f.txt", b"payload");

        let ctx = TransferContext {
            src_backend: Arc::new(MemoryBackend::new("tr-same", "dir1")),
            dst_backend: Arc::new(MemoryBackend::new("tr-same", "dir2")),
            opts: SyncOptions::default(),
            stats: Arc::new(Stats::new()),
            limiter: BandwidthLimiter::unlimited(),
            check_only: false,
            move_src: false,
        };

        let src = ctx.src_backend.stat("f.txt").unwrap().unwrap();
        copy_object(&ctx, src.as_ref(), None, "f.txt").unwrap();

        // Copied server-side: no bytes flowed through the scheduler
        assert_eq!(ctx.stats.bytes(), 0);
        assert_eq!(ctx.stats.transfers(), 1);
        assert!(ctx.dst_backend.stat("f.txt").unwrap().is_some());
    }

    #[test]
    fn test_dry_run_copies_nothing() {
        let mut ctx = context("tr-dry-src", "tr-dry-dst");
        ctx.opts.dry_run = true;

        let src_backend = MemoryBackend::new("tr-dry-src", "");
        put(&src_backend, "a.txt", b"hello");
        let src = src_backend.stat("a.txt").unwrap().unwrap();

        copy_object(&ctx, src.as_ref(), None, "a.txt").unwrap();
        assert!(ctx.dst_backend.stat("a.txt").unwrap().is_none());
    }

    #[test]
    fn test_disallowed_name_skipped_without_error() {
        let ctx = TransferContext {
            dst_backend: Arc::new(
                MemoryBackend::new("tr-ignore-dst", "").with_ignored_system_names(true),
            ),
            ..context("tr-ignore-src", "tr-ignore-dst")
        };

        let src_backend = MemoryBackend::new("tr-ignore-src", "");
        put(&src_backend, "Thumbs.db", b"junk");
        let src = src_backend.stat("Thumbs.db").unwrap().unwrap();

        copy_object(&ctx, src.as_ref(), None, "Thumbs.db").unwrap();
        assert!(ctx.dst_backend.stat("Thumbs.db").unwrap().is_none());
        assert_eq!(ctx.stats.errors(), 0);
        assert_eq!(ctx.stats.transfers(), 0);
    }

    #[test]
    fn test_update_in_place() {
        let ctx = context("tr-upd-src", "tr-upd-dst");
        let src_backend = MemoryBackend::new("tr-upd-src", "");
        let dst_backend = MemoryBackend::new("tr-upd-dst", "");
        put(&src_backend, "f.txt", b"new content");
        put(&dst_backend, "f.txt", b"old");

        let src = src_backend.stat("f.txt").unwrap().unwrap();
        let dst = dst_backend.stat("f.txt").unwrap().unwrap();
        copy_object(&ctx, src.as_ref(), Some(dst.as_ref()), "f.txt").unwrap();

        let updated = dst_backend.stat("f.txt").unwrap().unwrap();
        assert_eq!(updated.size(), 11);
    }

    #[test]
    fn test_delete_object() {
        let ctx = context("tr-del-src", "tr-del-dst");
        let dst_backend = MemoryBackend::new("tr-del-dst", "");
        put(&dst_backend, "gone.txt", b"x");

        let dst = dst_backend.stat("gone.txt").unwrap().unwrap();
        delete_object(&ctx, dst.as_ref()).unwrap();
        assert!(dst_backend.stat("gone.txt").unwrap().is_none());
        assert_eq!(ctx.stats.deletes(), 1);
    }

    #[test]
    fn test_stalled_transfer_maps_to_timeout() {
        let io_timeout = SyncError::io(
            "slow.bin",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"),
        );
        let mapped = stalled_to_timeout(io_timeout, Duration::from_secs(300));
        assert!(matches!(mapped, SyncError::TransferTimeout(300)));

        let other = SyncError::io(
            "gone.bin",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(matches!(
            stalled_to_timeout(other, Duration::from_secs(300)),
            SyncError::Io { .. }
        ));
    }

    #[test]
    fn test_checker_announces_transfer_totals() {
        let ctx = Arc::new(context("tr-eta-src", "tr-eta-dst"));
        let src_backend = MemoryBackend::new("tr-eta-src", "");
        put(&src_backend, "a.txt", b"hello");
        let src = src_backend.stat("a.txt").unwrap().unwrap();

        let (transfer_tx, transfer_rx) = crossbeam::channel::bounded(4);
        check_one(
            &ctx,
            CheckTask::Upload {
                src,
                remote: "a.txt".to_string(),
            },
            &transfer_tx,
        );
        drop(transfer_tx);

        assert_eq!(transfer_rx.iter().count(), 1);
        assert_eq!(ctx.stats.checks(), 1);

        // The scheduled transfer's size fed the ETA total, so an ETA
        // appears as soon as the rate is nonzero
        assert!(ctx.stats.eta().is_none());
        ctx.stats.add_bytes(1);
        assert!(ctx.stats.eta().is_some());
    }

    #[test]
    fn test_dry_run_delete_keeps_object() {
        let mut ctx = context("tr-dryd-src", "tr-dryd-dst");
        ctx.opts.dry_run = true;

        let dst_backend = MemoryBackend::new("tr-dryd-dst", "");
        put(&dst_backend, "kept.txt", b"x");

        let dst = dst_backend.stat("kept.txt").unwrap().unwrap();
        delete_object(&ctx, dst.as_ref()).unwrap();
        assert!(dst_backend.stat("kept.txt").unwrap().is_some());
    }
}
