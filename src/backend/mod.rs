//! Storage backend abstraction
//!
//! Every storage adapter implements [`Backend`], exposing listing,
//! put/stat, delete and mkdir, plus declared hash and modification-time
//! support. Optional server-side operations are separate traits
//! ([`Copier`], [`Mover`], [`DirMover`], [`Purger`]) discovered through
//! capability accessors; callers test for them and fall back rather than
//! forcing every adapter to implement every method.
//!
//! Listings stream through a bounded [`ListSink`] so memory stays bounded
//! regardless of remote size; the consumer can abort early and producers
//! observe the abort promptly.

pub mod local;
pub mod memory;

use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::config::ConfigFile;
use crate::error::{Result, SyncError};
use crate::hash::{HashKind, HashTypeSet};

/// Modification-time granularity value meaning "no mod time support"
///
/// Backends without modification times report this as their precision,
/// which forces the equality oracle onto its size-only branch.
pub const MOD_TIME_NOT_SUPPORTED: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Sentinel for an unknown modification time
pub const MOD_TIME_UNKNOWN: SystemTime = SystemTime::UNIX_EPOCH;

/// A single stored blob with identity `(backend, remote path)`
///
/// Objects are produced by their owning backend; mutation goes through
/// the backend or the object's own methods, never by editing a record.
pub trait Object: Send + Sync {
    /// Path relative to the backend's root: slash-separated, no leading
    /// slash, never contains backslashes
    fn remote(&self) -> &str;

    /// Size in bytes, -1 if unknown before transfer
    fn size(&self) -> i64;

    /// Modification time at the backend's native precision
    fn mod_time(&self) -> SystemTime;

    /// Best-effort mtime update; callers gate on the backend's precision
    fn set_mod_time(&self, mod_time: SystemTime) -> Result<()>;

    /// Lowercase hex digest of the requested kind; `Ok(None)` when the
    /// backend cannot produce it (treated as unknown, never unequal)
    fn hash(&self, kind: HashKind) -> Result<Option<String>>;

    /// Whether the backend will accept this object on write
    fn storable(&self) -> bool {
        true
    }

    /// Open the content for reading
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// Replace the content in place
    fn update(&self, reader: &mut dyn Read, mod_time: SystemTime, size: i64) -> Result<()>;

    /// Remove the object
    fn remove(&self) -> Result<()>;

    /// Downcast support for same-backend server-side operations
    fn as_any(&self) -> &dyn std::any::Any;
}

impl fmt::Debug for dyn Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.remote())
    }
}

/// A directory entry from a listing; a weak entity that exists only to
/// support directory listings
#[derive(Debug, Clone)]
pub struct Dir {
    /// Directory name relative to the backend root
    pub name: String,
    /// Modification or creation time, if known
    pub when: Option<SystemTime>,
    /// Size of contents, -1 if unknown
    pub bytes: i64,
    /// Number of objects, -1 if unknown
    pub count: i64,
}

impl Dir {
    /// A directory with unknown size and count
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            when: None,
            bytes: -1,
            count: -1,
        }
    }
}

/// One entry streamed out of a listing
pub enum ListEntry {
    /// A storable object
    Object(Box<dyn Object>),
    /// A directory
    Dir(Dir),
}

struct ListShared {
    error: Mutex<Option<SyncError>>,
    aborted: AtomicBool,
}

/// Producer half of a streaming listing
///
/// Backends push entries here from `list`; a full buffer applies
/// backpressure. Dropping the sink marks the listing finished.
pub struct ListSink {
    tx: Sender<ListEntry>,
    shared: Arc<ListShared>,
}

/// Consumer half of a streaming listing
pub struct ListReceiver {
    rx: Receiver<ListEntry>,
    shared: Arc<ListShared>,
}

/// Create a connected sink/receiver pair with the given buffer size
pub fn list_channel(buffer: usize) -> (ListSink, ListReceiver) {
    let (tx, rx) = bounded(buffer);
    let shared = Arc::new(ListShared {
        error: Mutex::new(None),
        aborted: AtomicBool::new(false),
    });
    (
        ListSink {
            tx,
            shared: Arc::clone(&shared),
        },
        ListReceiver { rx, shared },
    )
}

impl ListSink {
    /// Add an object to the output; returns true if the listing was
    /// aborted and the producer should stop
    pub fn add(&self, object: Box<dyn Object>) -> bool {
        self.send(ListEntry::Object(object))
    }

    /// Add a directory to the output; returns true on abort
    pub fn add_dir(&self, dir: Dir) -> bool {
        self.send(ListEntry::Dir(dir))
    }

    fn send(&self, entry: ListEntry) -> bool {
        let mut entry = entry;
        loop {
            if self.aborted() {
                return true;
            }
            match self
                .tx
                .send_timeout(entry, Duration::from_millis(50))
            {
                Ok(()) => return false,
                Err(crossbeam::channel::SendTimeoutError::Timeout(back)) => entry = back,
                Err(crossbeam::channel::SendTimeoutError::Disconnected(_)) => return true,
            }
        }
    }

    /// Set an error state and abort the listing; the first error wins
    pub fn set_error(&self, err: SyncError) {
        let mut slot = self.shared.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.shared.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether the consumer has aborted the listing
    pub fn aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

impl ListReceiver {
    /// Fetch the next entry
    ///
    /// Returns `Ok(None)` when the listing finished cleanly, or the
    /// producer's error once the stream drains after a failure.
    pub fn next_entry(&self) -> Result<Option<ListEntry>> {
        match self.rx.recv() {
            Ok(entry) => Ok(Some(entry)),
            Err(_) => {
                let mut slot = self.shared.error.lock().unwrap();
                match slot.take() {
                    Some(err) => Err(err),
                    None => {
                        if self.shared.aborted.load(Ordering::SeqCst) {
                            Err(SyncError::ListAborted)
                        } else {
                            Ok(None)
                        }
                    }
                }
            }
        }
    }

    /// Abort the listing; producers observing the flag return promptly
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        // Drain so a producer blocked on a full buffer wakes up
        while self.rx.try_recv().is_ok() {}
    }
}

/// Server-side copy capability
pub trait Copier {
    /// Copy `src` (an object of this same backend) to `remote`
    ///
    /// Returns [`SyncError::CantCopy`] when the objects are incompatible.
    fn copy(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>>;
}

/// Server-side move capability
pub trait Mover {
    /// Move `src` (an object of this same backend) to `remote`
    ///
    /// Returns [`SyncError::CantMove`] when the objects are incompatible.
    fn move_object(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>>;
}

/// Server-side directory move capability
pub trait DirMover {
    /// Move the entire root of `src` (a backend of the same type) into
    /// this backend's root
    ///
    /// Returns [`SyncError::CantDirMove`] for incompatible backends and
    /// [`SyncError::DirExists`] when the destination already exists.
    fn dir_move(&self, src: &dyn Backend) -> Result<()>;
}

/// Recursive root deletion capability
pub trait Purger {
    /// Delete all files in the root and the root directory itself
    fn purge(&self) -> Result<()>;
}

/// A capability-polymorphic adapter over one storage system
pub trait Backend: Send + Sync {
    /// Name of the remote as given in `name:path`
    fn name(&self) -> &str;

    /// Root path as given in `name:path`
    fn root(&self) -> &str;

    /// Human-readable description for logs
    fn description(&self) -> String;

    /// Stream all storable objects under the root into the sink
    ///
    /// Transient failures are reported via [`ListSink::set_error`], which
    /// aborts the listing. The sink is dropped when listing finishes.
    fn list(&self, sink: ListSink);

    /// Find the object at `remote`
    ///
    /// `Ok(None)` means not found; `Err` is reserved for transport
    /// failures.
    fn stat(&self, remote: &str) -> Result<Option<Box<dyn Object>>>;

    /// Store content at `remote` with the given mtime and expected size
    /// (-1 if unknown)
    ///
    /// On failure a partial object may remain; the backend finalizes or
    /// discards it.
    fn put(
        &self,
        reader: &mut dyn Read,
        remote: &str,
        mod_time: SystemTime,
        size: i64,
    ) -> Result<Box<dyn Object>>;

    /// Ensure the root container exists; no error when already present
    fn mkdir(&self) -> Result<()>;

    /// Remove the root if empty; not-empty and not-found are distinct
    /// errors
    fn rmdir(&self) -> Result<()>;

    /// Modification-time granularity, or [`MOD_TIME_NOT_SUPPORTED`]
    fn precision(&self) -> Duration;

    /// Declared hash set, immutable for the lifetime of a run
    fn hashes(&self) -> HashTypeSet;

    /// Whether remote paths compare case-insensitively on this backend
    fn case_insensitive(&self) -> bool {
        false
    }

    /// Names this backend silently ignores and will never store
    fn ignores(&self, _remote: &str) -> bool {
        false
    }

    /// Server-side copy capability, if implemented
    fn as_copier(&self) -> Option<&dyn Copier> {
        None
    }

    /// Server-side move capability, if implemented
    fn as_mover(&self) -> Option<&dyn Mover> {
        None
    }

    /// Server-side directory move capability, if implemented
    fn as_dir_mover(&self) -> Option<&dyn DirMover> {
        None
    }

    /// Purge capability, if implemented
    fn as_purger(&self) -> Option<&dyn Purger> {
        None
    }

    /// Downcast support for same-type directory moves
    fn as_any(&self) -> &dyn std::any::Any;
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Buffer size used for listing channels
pub const LIST_BUFFER: usize = 1024;

/// Start a listing on its own thread and return the consumer half
pub fn start_listing(backend: Arc<dyn Backend>) -> ListReceiver {
    let (sink, receiver) = list_channel(LIST_BUFFER);
    std::thread::spawn(move || {
        backend.list(sink);
    });
    receiver
}

/// A parsed `name:path` remote reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    /// Remote name; `local` for bare paths
    pub name: String,
    /// Root path on the remote
    pub root: String,
}

fn valid_remote_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == ' ' || c == '-')
}

fn looks_like_drive_letter(name: &str) -> bool {
    name.len() == 1 && name.chars().next().unwrap().is_ascii_alphabetic()
}

/// Parse a `name:path` reference, with drive-letter ambiguity resolved
/// according to `drive_letters_are_paths`
pub fn parse_remote_with(path: &str, drive_letters_are_paths: bool) -> RemotePath {
    if let Some((name, rest)) = path.split_once(':') {
        if valid_remote_name(name) && !(drive_letters_are_paths && looks_like_drive_letter(name)) {
            return RemotePath {
                name: name.to_string(),
                root: rest.to_string(),
            };
        }
    }
    RemotePath {
        name: "local".to_string(),
        root: path.to_string(),
    }
}

/// Parse a `name:path` reference; bare paths imply the local backend
///
/// On Windows, single-letter names that look like drive letters are
/// treated as local paths.
pub fn parse_remote(path: &str) -> RemotePath {
    parse_remote_with(path, cfg!(windows))
}

/// Construct a backend for a `name:path` reference
///
/// Named remotes are looked up in the config file; a missing section is
/// [`SyncError::NotFoundInConfig`]. If the path resolves to an existing
/// single object the backend lists exactly that object.
pub fn new_backend(path: &str, config: &ConfigFile) -> Result<Arc<dyn Backend>> {
    let parsed = parse_remote(path);

    if parsed.name == "local" && config.section("local").is_none() {
        return Ok(Arc::new(local::LocalBackend::new("local", &parsed.root)?));
    }

    let backend_type = config.get_value(&parsed.name, "type")?.to_string();
    match backend_type.as_str() {
        "local" => {
            let root = match config.section(&parsed.name).and_then(|s| s.get("root")) {
                Some(prefix) if !parsed.root.is_empty() => {
                    format!("{}/{}", prefix.trim_end_matches('/'), parsed.root)
                }
                Some(prefix) => prefix.to_string(),
                None => parsed.root.clone(),
            };
            Ok(Arc::new(local::LocalBackend::new(&parsed.name, &root)?))
        }
        "memory" => {
            let ignore_system_names = config
                .section(&parsed.name)
                .and_then(|s| s.get("ignore_system_names"))
                .map(|v| v == "true")
                .unwrap_or(false);
            Ok(Arc::new(
                memory::MemoryBackend::new(&parsed.name, &parsed.root)
                    .with_ignored_system_names(ignore_system_names),
            ))
        }
        other => Err(SyncError::UnknownBackendType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_named() {
        let parsed = parse_remote_with("backup:photos/2024", false);
        assert_eq!(parsed.name, "backup");
        assert_eq!(parsed.root, "photos/2024");
    }

    #[test]
    fn test_parse_remote_bare_path_is_local() {
        let parsed = parse_remote_with("/home/me/photos", false);
        assert_eq!(parsed.name, "local");
        assert_eq!(parsed.root, "/home/me/photos");
    }

    #[test]
    fn test_parse_remote_invalid_name_is_local() {
        // A colon inside a path whose prefix isn't a valid remote name
        let parsed = parse_remote_with("weird/na:me", false);
        assert_eq!(parsed.name, "local");
        assert_eq!(parsed.root, "weird/na:me");
    }

    #[test]
    fn test_parse_remote_drive_letter() {
        let on_windows = parse_remote_with(r"C:\data", true);
        assert_eq!(on_windows.name, "local");
        assert_eq!(on_windows.root, r"C:\data");

        let elsewhere = parse_remote_with("C:data", false);
        assert_eq!(elsewhere.name, "C");
        assert_eq!(elsewhere.root, "data");
    }

    #[test]
    fn test_parse_remote_allows_spaces_and_dashes() {
        let parsed = parse_remote_with("my backup-2:x", false);
        assert_eq!(parsed.name, "my backup-2");
    }

    #[test]
    fn test_list_channel_clean_finish() {
        let (sink, receiver) = list_channel(4);
        assert!(!sink.add_dir(Dir::unknown("docs")));
        drop(sink);

        match receiver.next_entry().unwrap() {
            Some(ListEntry::Dir(dir)) => assert_eq!(dir.name, "docs"),
            _ => panic!("expected dir entry"),
        }
        assert!(receiver.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_list_channel_error_aborts() {
        let (sink, receiver) = list_channel(4);
        sink.set_error(SyncError::ListingInconsistency("cursor reset".into()));
        assert!(sink.aborted());
        drop(sink);

        assert!(matches!(
            receiver.next_entry(),
            Err(SyncError::ListingInconsistency(_))
        ));
    }

    #[test]
    fn test_list_channel_consumer_abort_unblocks_producer() {
        let (sink, receiver) = list_channel(1);

        let producer = std::thread::spawn(move || {
            let mut aborted = false;
            for _ in 0..100 {
                if sink.add_dir(Dir::unknown("d")) {
                    aborted = true;
                    break;
                }
            }
            aborted
        });

        // Take one entry, then abort
        let _ = receiver.next_entry();
        receiver.abort();
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_unknown_backend_type() {
        let config = ConfigFile::parse("[weird]\ntype = teleport\n").unwrap();
        assert!(matches!(
            new_backend("weird:stuff", &config),
            Err(SyncError::UnknownBackendType(_))
        ));
    }

    #[test]
    fn test_missing_remote_not_found() {
        let config = ConfigFile::default();
        assert!(matches!(
            new_backend("nope:stuff", &config),
            Err(SyncError::NotFoundInConfig(_))
        ));
    }
}
