//! The sync orchestrator
//!
//! Drives one reconciliation run: starts both listings into the pair
//! builder, feeds the checker and transferrer pools, enforces the delete
//! phase ordering, and retries the whole run while errors remain. `copy`
//! runs the same pipeline with deletion disabled, `check` decides
//! equality without mutating anything, and `move` removes sources after
//! successful transfers, using server-side moves when available.

use std::sync::Arc;

use crossbeam::channel::bounded;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::backend::{start_listing, Backend, Object};
use crate::config::{DeleteMode, SyncOptions};
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::progress::Stats;
use crate::sync::pair::{PairBuilder, PairEvent};
use crate::sync::transfer::{
    delete_object, spawn_checkers, spawn_transferrers, CheckTask, TransferContext, TransferJob,
};
use crate::throttle::BandwidthLimiter;

/// Queue depth between the pipeline stages
const QUEUE_DEPTH: usize = 128;

/// What a run does with the reconciliation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    /// Transfer differing files, never delete
    Copy,
    /// Transfer differing files and delete extraneous destination files
    Sync,
    /// Copy then remove sources
    Move,
    /// Report differences, mutate nothing
    Check,
}

/// One reconciliation run between a source and destination backend
pub struct SyncRun {
    src: Arc<dyn Backend>,
    dst: Arc<dyn Backend>,
    opts: SyncOptions,
    filter: Arc<Filter>,
    stats: Arc<Stats>,
}

impl SyncRun {
    /// Create a run over the given endpoints
    pub fn new(
        src: Arc<dyn Backend>,
        dst: Arc<dyn Backend>,
        opts: SyncOptions,
        filter: Arc<Filter>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            src,
            dst,
            opts,
            filter,
            stats,
        }
    }

    /// Copy source to destination
    pub fn copy(&self) -> Result<()> {
        self.run(RunKind::Copy)
    }

    /// Make destination identical to source
    pub fn sync(&self) -> Result<()> {
        self.run(RunKind::Sync)
    }

    /// Move source into destination
    pub fn move_to(&self) -> Result<()> {
        if self.try_dir_move()? {
            return Ok(());
        }
        self.run(RunKind::Move)
    }

    /// Compare source and destination without mutating either
    pub fn check(&self) -> Result<()> {
        self.run(RunKind::Check)
    }

    /// Whole-directory server-side move, when the backends allow it
    fn try_dir_move(&self) -> Result<bool> {
        if self.opts.dry_run || !self.filter.is_empty() {
            return Ok(false);
        }
        let Some(dir_mover) = self.dst.as_dir_mover() else {
            return Ok(false);
        };
        match dir_mover.dir_move(self.src.as_ref()) {
            Ok(()) => {
                info!("server-side directory move succeeded");
                Ok(true)
            }
            Err(err) if err.is_capability_miss() || matches!(err, SyncError::DirExists) => {
                debug!("server-side directory move unavailable: {}", err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Run with whole-run retries while errors remain
    fn run(&self, kind: RunKind) -> Result<()> {
        for attempt in 1..=self.opts.retries {
            self.stats.reset_errors();

            if let Err(err) = self.run_once(kind) {
                error!("run failed: {}", err);
                self.stats.error();
            }

            let errors = self.stats.errors();
            if errors == 0 {
                return Ok(());
            }
            if attempt < self.opts.retries {
                warn!(
                    "attempt {}/{} finished with {} error(s), retrying",
                    attempt, self.opts.retries, errors
                );
            }
        }
        Err(SyncError::RunFailed(self.stats.errors()))
    }

    fn run_once(&self, kind: RunKind) -> Result<()> {
        if kind != RunKind::Check && !self.opts.dry_run {
            self.dst.mkdir()?;
        }

        let ctx = Arc::new(TransferContext {
            src_backend: Arc::clone(&self.src),
            dst_backend: Arc::clone(&self.dst),
            opts: self.opts.clone(),
            stats: Arc::clone(&self.stats),
            limiter: BandwidthLimiter::from_option(self.opts.bwlimit),
            check_only: kind == RunKind::Check,
            move_src: kind == RunKind::Move,
        });

        let (check_tx, check_rx) = bounded::<CheckTask>(QUEUE_DEPTH);
        let (transfer_tx, transfer_rx) = bounded::<TransferJob>(QUEUE_DEPTH);
        let checkers = spawn_checkers(Arc::clone(&ctx), check_rx, transfer_tx.clone());
        let transferrers = spawn_transferrers(Arc::clone(&ctx), transfer_rx);

        let deletions_enabled = kind == RunKind::Sync;
        let delete_mode = self.opts.delete_mode;
        let mut deferred: Vec<Box<dyn Object>> = Vec::new();
        let mut buffered_tasks: Vec<CheckTask> = Vec::new();
        let buffer_for_delete_before = deletions_enabled && delete_mode == DeleteMode::Before;

        let builder = PairBuilder::new(&self.filter, &self.opts, self.dst.case_insensitive());
        let src_listing = start_listing(Arc::clone(&self.src));
        let dst_listing = start_listing(Arc::clone(&self.dst));

        let listing_result = builder.build(src_listing, dst_listing, |event| match event {
            PairEvent::Check { src, dst } => {
                let task = CheckTask::Pair { src, dst };
                if buffer_for_delete_before {
                    buffered_tasks.push(task);
                } else {
                    let _ = check_tx.send(task);
                }
            }
            PairEvent::Upload { src, remote } => {
                let task = CheckTask::Upload { src, remote };
                if buffer_for_delete_before {
                    buffered_tasks.push(task);
                } else {
                    let _ = check_tx.send(task);
                }
            }
            PairEvent::Delete { dst } => {
                if !deletions_enabled {
                    match kind {
                        RunKind::Check => {
                            error!("{}: missing on source", dst.remote());
                            self.stats.error();
                        }
                        _ => debug!("{}: not deleting (deletions disabled)", dst.remote()),
                    }
                    return;
                }
                match delete_mode {
                    DeleteMode::During => {
                        let _ = transfer_tx.send(TransferJob::Delete { dst });
                    }
                    DeleteMode::Before | DeleteMode::After => deferred.push(dst),
                }
            }
        });

        if let Err(err) = listing_result {
            error!("listing failed: {}", err);
            self.stats.error();
        }

        if buffer_for_delete_before {
            // All deletions run to completion before the first transfer
            self.delete_batch(&ctx, std::mem::take(&mut deferred));
            for task in buffered_tasks {
                let _ = check_tx.send(task);
            }
        }

        drop(check_tx);
        for handle in checkers {
            let _ = handle.join();
        }
        drop(transfer_tx);
        for handle in transferrers {
            let _ = handle.join();
        }

        if deletions_enabled && delete_mode == DeleteMode::After {
            if self.stats.errors() > 0 {
                warn!(
                    "not deleting {} file(s) as errors occurred during the run",
                    deferred.len()
                );
            } else {
                self.delete_batch(&ctx, deferred);
            }
        }

        Ok(())
    }

    /// Delete a batch of objects with bounded parallelism
    fn delete_batch(&self, ctx: &Arc<TransferContext>, objects: Vec<Box<dyn Object>>) {
        if objects.is_empty() {
            return;
        }
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.transfers)
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                error!("failed to build deletion pool: {}", err);
                self.stats.error();
                return;
            }
        };

        pool.install(|| {
            objects.into_par_iter().for_each(|dst| {
                if let Err(err) = delete_object(ctx, dst.as_ref()) {
                    error!("{}: {}", dst.remote(), err);
                    self.stats.error();
                }
            });
        });
    }
}

/// Delete every object under the backend's root that the filter includes
pub fn delete_files(
    backend: Arc<dyn Backend>,
    filter: &Filter,
    opts: &SyncOptions,
    stats: Arc<Stats>,
) -> Result<()> {
    let listing = start_listing(Arc::clone(&backend));
    let mut doomed: Vec<Box<dyn Object>> = Vec::new();
    loop {
        match listing.next_entry()? {
            Some(crate::backend::ListEntry::Object(object)) => {
                if filter.include(object.remote(), object.size(), object.mod_time()) {
                    doomed.push(object);
                }
            }
            Some(_) => {}
            None => break,
        }
    }

    let ctx = Arc::new(TransferContext {
        src_backend: Arc::clone(&backend),
        dst_backend: backend,
        opts: opts.clone(),
        stats: Arc::clone(&stats),
        limiter: BandwidthLimiter::unlimited(),
        check_only: false,
        move_src: false,
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.transfers)
        .build()
        .map_err(|e| SyncError::config(format!("failed to build deletion pool: {}", e)))?;
    pool.install(|| {
        doomed.into_par_iter().for_each(|dst| {
            if let Err(err) = delete_object(&ctx, dst.as_ref()) {
                error!("{}: {}", dst.remote(), err);
                ctx.stats.error();
            }
        });
    });

    if stats.errors() > 0 {
        return Err(SyncError::RunFailed(stats.errors()));
    }
    Ok(())
}

/// Remove the backend root and all its contents
///
/// Uses the backend's purge capability when advertised, falling back to
/// delete-everything plus rmdir.
pub fn purge(backend: Arc<dyn Backend>, opts: &SyncOptions, stats: Arc<Stats>) -> Result<()> {
    if opts.dry_run {
        info!("{}: not purging (--dry-run)", backend.description());
        return Ok(());
    }
    if let Some(purger) = backend.as_purger() {
        match purger.purge() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_capability_miss() => {
                debug!("purge capability refused, deleting individually");
            }
            Err(err) => return Err(err),
        }
    }
    let everything = Filter::new();
    delete_files(Arc::clone(&backend), &everything, opts, stats)?;
    backend.rmdir()
}
