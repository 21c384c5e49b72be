//! In-process memory backend
//!
//! Stores objects in a process-wide map keyed by remote name. Useful as a
//! scratch remote and as the engine's test substrate: full capabilities,
//! nanosecond mod-time precision, MD5 and SHA-1 precomputed on write.
//!
//! Config section:
//!
//! ```text
//! [scratch]
//! type = memory
//! ignore_system_names = true   # optional: refuse thumbs.db and friends
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use super::{Backend, Copier, Dir, ListSink, Mover, Object, Purger};
use crate::error::{Result, SyncError};
use crate::hash::{HashKind, HashTypeSet, MultiHasher};
use crate::paths::{is_disallowed_name, normalize_remote};

#[derive(Clone)]
struct Blob {
    data: Arc<Vec<u8>>,
    mod_time: SystemTime,
    hashes: Vec<(HashKind, String)>,
}

type Store = BTreeMap<String, Blob>;

fn stores() -> &'static Mutex<HashMap<String, Store>> {
    static STORES: OnceLock<Mutex<HashMap<String, Store>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn with_store<T>(name: &str, f: impl FnOnce(&mut Store) -> T) -> T {
    let mut all = stores().lock().unwrap();
    f(all.entry(name.to_string()).or_default())
}

/// Backend over the process-wide in-memory store
pub struct MemoryBackend {
    name: String,
    root_string: String,
    root: String,
    limited: Option<String>,
    ignore_system_names: bool,
}

impl MemoryBackend {
    /// Create a backend rooted at `root` within the named store
    ///
    /// If `root` names an existing object, the backend is limited to that
    /// single object.
    pub fn new(name: &str, root: &str) -> Self {
        let normalized = normalize_remote(root);

        let exists_as_object =
            with_store(name, |store| store.contains_key(&normalized));
        if exists_as_object && !normalized.is_empty() {
            let (parent, leaf) = crate::paths::split_parent(&normalized);
            return Self {
                name: name.to_string(),
                root_string: root.to_string(),
                root: parent.to_string(),
                limited: Some(leaf.to_string()),
                ignore_system_names: false,
            };
        }

        Self {
            name: name.to_string(),
            root_string: root.to_string(),
            root: normalized,
            limited: None,
            ignore_system_names: false,
        }
    }

    /// Refuse uploads of system-junk names like `thumbs.db`
    pub fn with_ignored_system_names(mut self, ignore: bool) -> Self {
        self.ignore_system_names = ignore;
        self
    }

    /// Drop every object stored under `name`; test scaffolding
    pub fn clear(name: &str) {
        stores().lock().unwrap().remove(name);
    }

    fn full_key(&self, remote: &str) -> String {
        if self.root.is_empty() {
            remote.to_string()
        } else {
            format!("{}/{}", self.root, remote)
        }
    }

    fn strip_root<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.root.is_empty() {
            return Some(key);
        }
        key.strip_prefix(&self.root)
            .and_then(|rest| rest.strip_prefix('/'))
    }

    fn object(&self, remote: String, blob: Blob) -> MemoryObject {
        MemoryObject {
            store: self.name.clone(),
            key: self.full_key(&remote),
            remote,
            size: blob.data.len() as i64,
            mod_time: blob.mod_time,
            data: blob.data,
            hashes: blob.hashes,
        }
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        &self.root_string
    }

    fn description(&self) -> String {
        format!("Memory store {}:{}", self.name, self.root)
    }

    fn list(&self, sink: ListSink) {
        let snapshot: Vec<(String, Blob)> = with_store(&self.name, |store| {
            store
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        });

        let mut seen_dirs = Vec::new();
        for (key, blob) in snapshot {
            if sink.aborted() {
                return;
            }
            let Some(rest) = self.strip_root(&key) else {
                continue;
            };
            if let Some(leaf) = &self.limited {
                if rest != leaf {
                    continue;
                }
            }

            if let Some((top, _)) = rest.split_once('/') {
                if !seen_dirs.iter().any(|d| d == top) {
                    seen_dirs.push(top.to_string());
                    if sink.add_dir(Dir::unknown(top)) {
                        return;
                    }
                }
            }
            if sink.add(Box::new(self.object(rest.to_string(), blob))) {
                return;
            }
        }
    }

    fn stat(&self, remote: &str) -> Result<Option<Box<dyn Object>>> {
        if let Some(leaf) = &self.limited {
            if remote != leaf {
                return Ok(None);
            }
        }
        let key = self.full_key(remote);
        let blob = with_store(&self.name, |store| store.get(&key).cloned());
        Ok(blob.map(|b| Box::new(self.object(remote.to_string(), b)) as Box<dyn Object>))
    }

    fn put(
        &self,
        reader: &mut dyn Read,
        remote: &str,
        mod_time: SystemTime,
        _size: i64,
    ) -> Result<Box<dyn Object>> {
        if self.ignores(remote) {
            return Err(SyncError::DisallowedName(remote.to_string()));
        }
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| SyncError::io(remote, e))?;

        let mut hasher = MultiHasher::new(HashTypeSet::full());
        hasher.update(&data);
        let blob = Blob {
            data: Arc::new(data),
            mod_time,
            hashes: hasher.finalize(),
        };

        let key = self.full_key(remote);
        with_store(&self.name, |store| {
            store.insert(key, blob.clone());
        });

        Ok(Box::new(self.object(remote.to_string(), blob)))
    }

    fn mkdir(&self) -> Result<()> {
        // Containers are implicit in a flat keyspace
        Ok(())
    }

    fn rmdir(&self) -> Result<()> {
        let occupied = with_store(&self.name, |store| {
            store.keys().any(|k| self.strip_root(k).is_some())
        });
        if occupied {
            return Err(SyncError::DirNotEmpty(self.root_string.clone()));
        }
        Ok(())
    }

    fn precision(&self) -> Duration {
        Duration::from_nanos(1)
    }

    fn hashes(&self) -> HashTypeSet {
        HashTypeSet::full()
    }

    fn ignores(&self, remote: &str) -> bool {
        self.ignore_system_names && is_disallowed_name(remote)
    }

    fn as_copier(&self) -> Option<&dyn Copier> {
        Some(self)
    }

    fn as_mover(&self) -> Option<&dyn Mover> {
        Some(self)
    }

    fn as_purger(&self) -> Option<&dyn Purger> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Copier for MemoryBackend {
    fn copy(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(mem_src) = src.as_any().downcast_ref::<MemoryObject>() else {
            return Err(SyncError::CantCopy);
        };
        let blob = Blob {
            data: Arc::clone(&mem_src.data),
            mod_time: mem_src.mod_time,
            hashes: mem_src.hashes.clone(),
        };
        let key = self.full_key(remote);
        with_store(&self.name, |store| {
            store.insert(key, blob.clone());
        });
        Ok(Box::new(self.object(remote.to_string(), blob)))
    }
}

impl Mover for MemoryBackend {
    fn move_object(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(mem_src) = src.as_any().downcast_ref::<MemoryObject>() else {
            return Err(SyncError::CantMove);
        };
        let copied = self.copy(src, remote)?;
        with_store(&mem_src.store, |store| {
            store.remove(&mem_src.key);
        });
        Ok(copied)
    }
}

impl Purger for MemoryBackend {
    fn purge(&self) -> Result<()> {
        with_store(&self.name, |store| {
            store.retain(|k, _| self.strip_root(k).is_none());
        });
        Ok(())
    }
}

/// One object in the memory store
pub struct MemoryObject {
    store: String,
    key: String,
    remote: String,
    size: i64,
    mod_time: SystemTime,
    data: Arc<Vec<u8>>,
    hashes: Vec<(HashKind, String)>,
}

impl Object for MemoryObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> i64 {
        self.size
    }

    fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    fn set_mod_time(&self, mod_time: SystemTime) -> Result<()> {
        with_store(&self.store, |store| {
            match store.get_mut(&self.key) {
                Some(blob) => {
                    blob.mod_time = mod_time;
                    Ok(())
                }
                None => Err(SyncError::ObjectNotFound(self.remote.clone())),
            }
        })
    }

    fn hash(&self, kind: HashKind) -> Result<Option<String>> {
        Ok(self
            .hashes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.clone()))
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(CursorReader {
            data: Arc::clone(&self.data),
            pos: 0,
        }))
    }

    fn update(&self, reader: &mut dyn Read, mod_time: SystemTime, _size: i64) -> Result<()> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| SyncError::io(&self.remote, e))?;

        let mut hasher = MultiHasher::new(HashTypeSet::full());
        hasher.update(&data);

        with_store(&self.store, |store| {
            store.insert(
                self.key.clone(),
                Blob {
                    data: Arc::new(data),
                    mod_time,
                    hashes: hasher.finalize(),
                },
            );
        });
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let existed = with_store(&self.store, |store| store.remove(&self.key).is_some());
        if existed {
            Ok(())
        } else {
            Err(SyncError::ObjectNotFound(self.remote.clone()))
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct CursorReader {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for CursorReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{list_channel, ListEntry};

    fn put(backend: &MemoryBackend, remote: &str, content: &[u8]) {
        let mut reader: &[u8] = content;
        backend
            .put(&mut reader, remote, SystemTime::now(), content.len() as i64)
            .unwrap();
    }

    fn remotes(backend: &MemoryBackend) -> Vec<String> {
        let (sink, receiver) = list_channel(64);
        backend.list(sink);
        let mut out = Vec::new();
        while let Some(entry) = receiver.next_entry().unwrap() {
            if let ListEntry::Object(object) = entry {
                out.push(object.remote().to_string());
            }
        }
        out.sort();
        out
    }

    #[test]
    fn test_put_stat_list() {
        MemoryBackend::clear("mem-basic");
        let backend = MemoryBackend::new("mem-basic", "bucket");
        put(&backend, "a.txt", b"abc");
        put(&backend, "dir/b.txt", b"def");

        assert_eq!(remotes(&backend), ["a.txt", "dir/b.txt"]);

        let object = backend.stat("a.txt").unwrap().unwrap();
        assert_eq!(object.size(), 3);
        assert_eq!(
            object.hash(HashKind::Md5).unwrap().as_deref(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
        assert!(backend.stat("missing.txt").unwrap().is_none());
    }

    #[test]
    fn test_roots_isolate_listings() {
        MemoryBackend::clear("mem-roots");
        let outer = MemoryBackend::new("mem-roots", "");
        put(&outer, "top.txt", b"1");
        put(&outer, "inner/deep.txt", b"2");

        let inner = MemoryBackend::new("mem-roots", "inner");
        assert_eq!(remotes(&inner), ["deep.txt"]);
    }

    #[test]
    fn test_limited_root_on_existing_object() {
        MemoryBackend::clear("mem-limited");
        let outer = MemoryBackend::new("mem-limited", "");
        put(&outer, "dir/solo.txt", b"solo");
        put(&outer, "dir/other.txt", b"other");

        let limited = MemoryBackend::new("mem-limited", "dir/solo.txt");
        assert_eq!(remotes(&limited), ["solo.txt"]);
        assert!(limited.stat("other.txt").unwrap().is_none());
    }

    #[test]
    fn test_server_side_copy_and_move() {
        MemoryBackend::clear("mem-copy");
        let backend = MemoryBackend::new("mem-copy", "");
        put(&backend, "src.txt", b"payload");

        let src = backend.stat("src.txt").unwrap().unwrap();
        backend
            .as_copier()
            .unwrap()
            .copy(src.as_ref(), "copy.txt")
            .unwrap();
        assert_eq!(remotes(&backend), ["copy.txt", "src.txt"]);

        backend
            .as_mover()
            .unwrap()
            .move_object(src.as_ref(), "moved.txt")
            .unwrap();
        assert_eq!(remotes(&backend), ["copy.txt", "moved.txt"]);
    }

    #[test]
    fn test_set_mod_time_persists() {
        MemoryBackend::clear("mem-mtime");
        let backend = MemoryBackend::new("mem-mtime", "");
        put(&backend, "f.txt", b"x");

        let object = backend.stat("f.txt").unwrap().unwrap();
        let target = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        object.set_mod_time(target).unwrap();

        let again = backend.stat("f.txt").unwrap().unwrap();
        assert_eq!(again.mod_time(), target);
    }

    #[test]
    fn test_purge_and_rmdir() {
        MemoryBackend::clear("mem-purge");
        let backend = MemoryBackend::new("mem-purge", "zone");
        put(&backend, "a.txt", b"1");

        assert!(matches!(backend.rmdir(), Err(SyncError::DirNotEmpty(_))));
        backend.as_purger().unwrap().purge().unwrap();
        assert!(remotes(&backend).is_empty());
        assert!(backend.rmdir().is_ok());
    }

    #[test]
    fn test_ignores_system_names_when_asked() {
        let plain = MemoryBackend::new("mem-ignore", "");
        assert!(!plain.ignores("Thumbs.db"));

        let picky = MemoryBackend::new("mem-ignore", "").with_ignored_system_names(true);
        assert!(picky.ignores("Thumbs.db"));
        assert!(picky.ignores("photos/.DS_Store"));
        assert!(!picky.ignores("report.txt"));

        // Put refuses the names the backend declares it ignores
        let mut reader: &[u8] = b"junk";
        assert!(matches!(
            picky.put(&mut reader, "Thumbs.db", SystemTime::now(), 4),
            Err(SyncError::DisallowedName(_))
        ));
    }
}
