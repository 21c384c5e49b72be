//! The pair builder
//!
//! Consumes the source and destination listings in parallel and emits
//! reconciliation events: matched pairs for the checkers, source-only
//! uploads, and destination-only deletion candidates. Source objects are
//! buffered keyed by remote, case-folded iff the destination backend is
//! case-insensitive; in that case a name tree learns the destination's
//! observed directory casing so uploads do not create duplicate
//! directories differing only in case.

use std::collections::HashMap;

use crossbeam::channel::bounded;
use tracing::{debug, warn};

use crate::backend::{ListEntry, ListReceiver, Object};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::paths::{fold_key, split_parent, NameTree};

/// One reconciliation event out of the pair builder
pub enum PairEvent {
    /// Source and destination both hold the remote; equality undecided
    Check {
        /// Source object
        src: Box<dyn Object>,
        /// Destination object
        dst: Box<dyn Object>,
    },
    /// Source-only entry: upload to `remote`
    Upload {
        /// Source object
        src: Box<dyn Object>,
        /// Target name, parent case corrected for case-insensitive
        /// destinations
        remote: String,
    },
    /// Destination-only entry: deletion candidate
    Delete {
        /// Destination object
        dst: Box<dyn Object>,
    },
}

enum Tagged {
    Src(Result<Option<ListEntry>>),
    Dst(Result<Option<ListEntry>>),
}

/// Builds pairs from two listings according to the filter and options
pub struct PairBuilder<'a> {
    filter: &'a Filter,
    opts: &'a SyncOptions,
    /// Destination compares remotes case-insensitively
    pub case_insensitive: bool,
}

impl<'a> PairBuilder<'a> {
    /// Create a pair builder
    pub fn new(filter: &'a Filter, opts: &'a SyncOptions, case_insensitive: bool) -> Self {
        Self {
            filter,
            opts,
            case_insensitive,
        }
    }

    fn key(&self, remote: &str) -> String {
        if self.case_insensitive {
            fold_key(remote)
        } else {
            remote.to_string()
        }
    }

    /// Drain both listings, calling `emit` for every event
    ///
    /// Returns the first listing error; the surviving listing is aborted
    /// so its producer stops promptly.
    pub fn build(
        &self,
        src_listing: ListReceiver,
        dst_listing: ListReceiver,
        mut emit: impl FnMut(PairEvent),
    ) -> Result<()> {
        let (tag_tx, tag_rx) = bounded::<Tagged>(64);

        let src_tx = tag_tx.clone();
        let src_pump = std::thread::spawn(move || loop {
            let item = src_listing.next_entry();
            let done = matches!(item, Ok(None) | Err(_));
            if src_tx.send(Tagged::Src(item)).is_err() {
                src_listing.abort();
                return;
            }
            if done {
                return;
            }
        });
        let dst_pump = std::thread::spawn(move || loop {
            let item = dst_listing.next_entry();
            let done = matches!(item, Ok(None) | Err(_));
            if tag_tx.send(Tagged::Dst(item)).is_err() {
                dst_listing.abort();
                return;
            }
            if done {
                return;
            }
        });

        let mut src_buffer: HashMap<String, Box<dyn Object>> = HashMap::new();
        let mut dst_buffer: HashMap<String, Box<dyn Object>> = HashMap::new();
        let mut dst_casing = NameTree::new();
        let mut src_done = false;
        let mut dst_done = false;
        let mut failure: Option<SyncError> = None;

        while !(src_done && dst_done) {
            let Ok(tagged) = tag_rx.recv() else {
                break;
            };
            match tagged {
                Tagged::Src(Ok(Some(entry))) => {
                    if failure.is_some() {
                        continue;
                    }
                    let ListEntry::Object(src) = entry else {
                        continue;
                    };
                    if !src.storable() {
                        debug!("{}: not storable, skipping", src.remote());
                        continue;
                    }
                    if !self.filter.include(src.remote(), src.size(), src.mod_time()) {
                        debug!("{}: excluded from source", src.remote());
                        continue;
                    }
                    let key = self.key(src.remote());
                    if let Some(dst) = dst_buffer.remove(&key) {
                        emit(PairEvent::Check { src, dst });
                    } else {
                        src_buffer.insert(key, src);
                    }
                }
                Tagged::Dst(Ok(Some(entry))) => {
                    if failure.is_some() {
                        continue;
                    }
                    match entry {
                        ListEntry::Dir(dir) => {
                            if self.case_insensitive {
                                self.learn_dir_casing(&mut dst_casing, &dir.name);
                            }
                        }
                        ListEntry::Object(dst) => {
                            if self.case_insensitive {
                                let (parent, _) = split_parent(dst.remote());
                                self.learn_dir_casing(&mut dst_casing, parent);
                            }
                            self.take_dst(
                                dst,
                                &mut src_buffer,
                                src_done,
                                &mut dst_buffer,
                                &mut emit,
                            );
                        }
                    }
                }
                Tagged::Src(Ok(None)) => {
                    src_done = true;
                    // Source listing is complete: everything still
                    // unmatched on the destination can never pair up
                    for (_, dst) in dst_buffer.drain() {
                        self.emit_delete(dst, &mut emit);
                    }
                }
                Tagged::Dst(Ok(None)) => {
                    dst_done = true;
                }
                Tagged::Src(Err(err)) => {
                    src_done = true;
                    failure.get_or_insert(err);
                }
                Tagged::Dst(Err(err)) => {
                    dst_done = true;
                    failure.get_or_insert(err);
                }
            }
        }

        drop(tag_rx);
        let _ = src_pump.join();
        let _ = dst_pump.join();

        if let Some(err) = failure {
            return Err(err);
        }

        // Remaining source-only entries become uploads, with parent case
        // corrected to the destination's observed casing
        for (_, src) in src_buffer.drain() {
            let remote = self.upload_remote(&dst_casing, src.remote());
            emit(PairEvent::Upload { src, remote });
        }

        Ok(())
    }

    fn learn_dir_casing(&self, tree: &mut NameTree, dir_path: &str) {
        if dir_path.is_empty() {
            return;
        }
        let mut parent = String::new();
        for component in dir_path.split('/') {
            tree.put_case_correct_directory_name(&parent, component);
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(component);
        }
    }

    fn upload_remote(&self, tree: &NameTree, src_remote: &str) -> String {
        if !self.case_insensitive {
            return src_remote.to_string();
        }
        let (parent, leaf) = split_parent(src_remote);
        if parent.is_empty() {
            return src_remote.to_string();
        }
        match tree.get_path_with_correct_case(parent) {
            Some(corrected) if corrected != parent => {
                debug!(
                    "{}: using destination casing '{}' for parent",
                    src_remote, corrected
                );
                format!("{}/{}", corrected, leaf)
            }
            _ => src_remote.to_string(),
        }
    }

    fn take_dst(
        &self,
        dst: Box<dyn Object>,
        src_buffer: &mut HashMap<String, Box<dyn Object>>,
        src_done: bool,
        dst_buffer: &mut HashMap<String, Box<dyn Object>>,
        emit: &mut impl FnMut(PairEvent),
    ) {
        let key = self.key(dst.remote());
        if let Some(src) = src_buffer.remove(&key) {
            emit(PairEvent::Check { src, dst });
        } else if src_done {
            self.emit_delete(dst, emit);
        } else {
            dst_buffer.insert(key, dst);
        }
    }

    fn emit_delete(&self, dst: Box<dyn Object>, emit: &mut impl FnMut(PairEvent)) {
        if self.filter.include(dst.remote(), dst.size(), dst.mod_time()) {
            emit(PairEvent::Delete { dst });
            return;
        }
        // Excluded destination entries are normally shielded from
        // deletion; --delete-excluded inverts that, except that entries
        // kept alive by --ignore-existing stay present
        if self.opts.delete_excluded {
            if self.opts.ignore_existing {
                debug!(
                    "{}: excluded but kept (--ignore-existing)",
                    dst.remote()
                );
                return;
            }
            warn!("{}: excluded, deleting (--delete-excluded)", dst.remote());
            emit(PairEvent::Delete { dst });
        } else {
            debug!("{}: excluded from destination, keeping", dst.remote());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{start_listing, Backend};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn put(backend: &MemoryBackend, remote: &str, content: &[u8]) {
        let mut reader: &[u8] = content;
        backend
            .put(&mut reader, remote, SystemTime::now(), content.len() as i64)
            .unwrap();
    }

    struct Events {
        checks: Vec<String>,
        uploads: Vec<String>,
        deletes: Vec<String>,
    }

    fn run_builder(
        src: Arc<dyn Backend>,
        dst: Arc<dyn Backend>,
        filter: &Filter,
        opts: &SyncOptions,
        case_insensitive: bool,
    ) -> Events {
        let builder = PairBuilder::new(filter, opts, case_insensitive);
        let mut events = Events {
            checks: Vec::new(),
            uploads: Vec::new(),
            deletes: Vec::new(),
        };
        builder
            .build(start_listing(src), start_listing(dst), |event| match event {
                PairEvent::Check { src, .. } => events.checks.push(src.remote().to_string()),
                PairEvent::Upload { remote, .. } => events.uploads.push(remote),
                PairEvent::Delete { dst } => events.deletes.push(dst.remote().to_string()),
            })
            .unwrap();
        events.checks.sort();
        events.uploads.sort();
        events.deletes.sort();
        events
    }

    #[test]
    fn test_pairs_uploads_and_deletes() {
        MemoryBackend::clear("pair-src");
        MemoryBackend::clear("pair-dst");
        let src = MemoryBackend::new("pair-src", "");
        let dst = MemoryBackend::new("pair-dst", "");
        put(&src, "both.txt", b"s");
        put(&src, "only-src.txt", b"s");
        put(&dst, "both.txt", b"d");
        put(&dst, "only-dst.txt", b"d");

        let filter = Filter::new();
        let opts = SyncOptions::default();
        let events = run_builder(
            Arc::new(MemoryBackend::new("pair-src", "")),
            Arc::new(MemoryBackend::new("pair-dst", "")),
            &filter,
            &opts,
            false,
        );

        assert_eq!(events.checks, ["both.txt"]);
        assert_eq!(events.uploads, ["only-src.txt"]);
        assert_eq!(events.deletes, ["only-dst.txt"]);
    }

    #[test]
    fn test_excluded_destination_kept_without_delete_excluded() {
        MemoryBackend::clear("pair-excl-src");
        MemoryBackend::clear("pair-excl-dst");
        let dst = MemoryBackend::new("pair-excl-dst", "");
        put(&dst, "junk.bak", b"d");
        put(&dst, "stale.txt", b"d");

        let mut filter = Filter::new();
        filter.add_exclude("*.bak").unwrap();
        let opts = SyncOptions::default();
        let events = run_builder(
            Arc::new(MemoryBackend::new("pair-excl-src", "")),
            Arc::new(MemoryBackend::new("pair-excl-dst", "")),
            &filter,
            &opts,
            false,
        );

        // The excluded file survives; the included one is deletable
        assert_eq!(events.deletes, ["stale.txt"]);
    }

    #[test]
    fn test_delete_excluded_inverts() {
        MemoryBackend::clear("pair-dexcl-src");
        MemoryBackend::clear("pair-dexcl-dst");
        let dst = MemoryBackend::new("pair-dexcl-dst", "");
        put(&dst, "junk.bak", b"d");

        let mut filter = Filter::new();
        filter.add_exclude("*.bak").unwrap();
        let opts = SyncOptions {
            delete_excluded: true,
            ..Default::default()
        };
        let events = run_builder(
            Arc::new(MemoryBackend::new("pair-dexcl-src", "")),
            Arc::new(MemoryBackend::new("pair-dexcl-dst", "")),
            &filter,
            &opts,
            false,
        );
        assert_eq!(events.deletes, ["junk.bak"]);
    }

    #[test]
    fn test_delete_excluded_respects_ignore_existing() {
        MemoryBackend::clear("pair-iexcl-src");
        MemoryBackend::clear("pair-iexcl-dst");
        let dst = MemoryBackend::new("pair-iexcl-dst", "");
        put(&dst, "junk.bak", b"d");

        let mut filter = Filter::new();
        filter.add_exclude("*.bak").unwrap();
        let opts = SyncOptions {
            delete_excluded: true,
            ignore_existing: true,
            ..Default::default()
        };
        let events = run_builder(
            Arc::new(MemoryBackend::new("pair-iexcl-src", "")),
            Arc::new(MemoryBackend::new("pair-iexcl-dst", "")),
            &filter,
            &opts,
            false,
        );
        assert!(events.deletes.is_empty());
    }

    #[test]
    fn test_source_filter_prunes_uploads() {
        MemoryBackend::clear("pair-filt-src");
        MemoryBackend::clear("pair-filt-dst");
        let src = MemoryBackend::new("pair-filt-src", "");
        put(&src, "keep.jpg", b"s");
        put(&src, "drop.bak", b"s");

        let mut filter = Filter::new();
        filter.add_exclude("*.bak").unwrap();
        let opts = SyncOptions::default();
        let events = run_builder(
            Arc::new(MemoryBackend::new("pair-filt-src", "")),
            Arc::new(MemoryBackend::new("pair-filt-dst", "")),
            &filter,
            &opts,
            false,
        );
        assert_eq!(events.uploads, ["keep.jpg"]);
    }

    #[test]
    fn test_case_insensitive_pairing_and_upload_casing() {
        MemoryBackend::clear("pair-case-src");
        MemoryBackend::clear("pair-case-dst");
        let src = MemoryBackend::new("pair-case-src", "");
        let dst = MemoryBackend::new("pair-case-dst", "");
        put(&src, "photos/readme.txt", b"s");
        put(&src, "photos/new.jpg", b"s");
        // Destination has the directory with different casing
        put(&dst, "Photos/readme.txt", b"d");

        let filter = Filter::new();
        let opts = SyncOptions::default();
        let events = run_builder(
            Arc::new(MemoryBackend::new("pair-case-src", "")),
            Arc::new(MemoryBackend::new("pair-case-dst", "")),
            &filter,
            &opts,
            true,
        );

        // readme pairs despite the case difference; the upload adopts the
        // destination's observed casing
        assert_eq!(events.checks, ["photos/readme.txt"]);
        assert_eq!(events.uploads, ["Photos/new.jpg"]);
        assert!(events.deletes.is_empty());
    }
}
