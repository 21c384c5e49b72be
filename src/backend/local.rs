//! Local filesystem backend
//!
//! Lists with walkdir, sets modification times with filetime, and
//! computes MD5/SHA-1 by streaming the file. Paths with invalid UTF-8
//! are remapped to the replacement character for display while the
//! original bytes are preserved for I/O, which can surface as apparent
//! duplicates; those are warned about during listing.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{
    Backend, Copier, Dir, DirMover, ListSink, Mover, Object, Purger, MOD_TIME_UNKNOWN,
};
use crate::error::{IoResultExt, Result, SyncError};
use crate::hash::{hash_reader, HashKind, HashTypeSet};
use crate::paths::normalize_remote;

#[cfg(unix)]
const PRECISION: Duration = Duration::from_nanos(1);
#[cfg(not(unix))]
const PRECISION: Duration = Duration::from_nanos(100);

/// Backend over a local directory tree
pub struct LocalBackend {
    name: String,
    root_string: String,
    root: PathBuf,
    /// Leaf name when the root named an existing file; the backend then
    /// lists exactly that object
    limited: Option<String>,
}

impl LocalBackend {
    /// Create a backend rooted at `root`
    ///
    /// If `root` names an existing file, the backend is limited to that
    /// single object and its root becomes the parent directory.
    pub fn new(name: &str, root: &str) -> Result<Self> {
        let given = if root.is_empty() { "." } else { root };
        let path = PathBuf::from(given);

        if path.is_file() {
            let leaf = path
                .file_name()
                .ok_or_else(|| SyncError::InvalidPath(given.to_string()))?
                .to_string_lossy()
                .into_owned();
            let parent = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            return Ok(Self {
                name: name.to_string(),
                root_string: given.to_string(),
                root: parent,
                limited: Some(leaf),
            });
        }

        Ok(Self {
            name: name.to_string(),
            root_string: given.to_string(),
            root: path,
            limited: None,
        })
    }

    fn full_path(&self, remote: &str) -> PathBuf {
        let mut path = self.root.clone();
        for component in remote.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        path
    }

    fn object_from_path(&self, path: &Path, remote: String) -> Result<LocalObject> {
        let metadata = fs::metadata(path).with_path(path)?;
        Ok(LocalObject {
            path: path.to_path_buf(),
            remote,
            size: metadata.len() as i64,
            mod_time: metadata.modified().unwrap_or(MOD_TIME_UNKNOWN),
        })
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        &self.root_string
    }

    fn description(&self) -> String {
        format!("Local file system at {}", self.root.display())
    }

    fn list(&self, sink: ListSink) {
        if let Some(leaf) = &self.limited {
            let path = self.full_path(leaf);
            match self.object_from_path(&path, leaf.clone()) {
                Ok(object) => {
                    sink.add(Box::new(object));
                }
                Err(err) => sink.set_error(err),
            }
            return;
        }

        if !self.root.exists() {
            sink.set_error(SyncError::DirNotFound(self.root_string.clone()));
            return;
        }

        for entry in WalkDir::new(&self.root).follow_links(false).min_depth(1) {
            if sink.aborted() {
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    sink.set_error(SyncError::io(
                        path,
                        err.into_io_error().unwrap_or_else(|| {
                            std::io::Error::new(std::io::ErrorKind::Other, "walk error")
                        }),
                    ));
                    return;
                }
            };

            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path());
            if rel.to_str().is_none() {
                warn!(
                    "{}: name has invalid UTF-8, displaying with replacement characters (may appear as a duplicate)",
                    rel.to_string_lossy()
                );
            }
            let remote = normalize_remote(&rel.to_string_lossy());

            if entry.file_type().is_dir() {
                if sink.add_dir(Dir::unknown(remote)) {
                    return;
                }
            } else if entry.file_type().is_file() {
                match self.object_from_path(entry.path(), remote) {
                    Ok(object) => {
                        if sink.add(Box::new(object)) {
                            return;
                        }
                    }
                    Err(err) => {
                        sink.set_error(err);
                        return;
                    }
                }
            } else {
                debug!("{}: skipping non-regular file", remote);
            }
        }
    }

    fn stat(&self, remote: &str) -> Result<Option<Box<dyn Object>>> {
        if let Some(leaf) = &self.limited {
            if remote != leaf {
                return Ok(None);
            }
        }
        let path = self.full_path(remote);
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(Box::new(
                self.object_from_path(&path, remote.to_string())?,
            ))),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SyncError::io(path, err)),
        }
    }

    fn put(
        &self,
        reader: &mut dyn Read,
        remote: &str,
        mod_time: SystemTime,
        _size: i64,
    ) -> Result<Box<dyn Object>> {
        let path = self.full_path(remote);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        let mut file = File::create(&path).with_path(&path)?;
        std::io::copy(reader, &mut file).with_path(&path)?;
        drop(file);

        filetime::set_file_mtime(&path, FileTime::from_system_time(mod_time))
            .with_path(&path)?;

        Ok(Box::new(self.object_from_path(&path, remote.to_string())?))
    }

    fn mkdir(&self) -> Result<()> {
        if self.limited.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.root).with_path(&self.root)
    }

    fn rmdir(&self) -> Result<()> {
        let mut entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::DirNotFound(self.root_string.clone()))
            }
            Err(err) => return Err(SyncError::io(&self.root, err)),
        };
        if entries.next().is_some() {
            return Err(SyncError::DirNotEmpty(self.root_string.clone()));
        }
        fs::remove_dir(&self.root).with_path(&self.root)
    }

    fn precision(&self) -> Duration {
        PRECISION
    }

    fn hashes(&self) -> HashTypeSet {
        HashTypeSet::full()
    }

    fn case_insensitive(&self) -> bool {
        cfg!(any(windows, target_os = "macos"))
    }

    fn as_copier(&self) -> Option<&dyn Copier> {
        Some(self)
    }

    fn as_mover(&self) -> Option<&dyn Mover> {
        Some(self)
    }

    fn as_dir_mover(&self) -> Option<&dyn DirMover> {
        Some(self)
    }

    fn as_purger(&self) -> Option<&dyn Purger> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Copier for LocalBackend {
    fn copy(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(local_src) = src.as_any().downcast_ref::<LocalObject>() else {
            return Err(SyncError::CantCopy);
        };
        let dst_path = self.full_path(remote);
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        fs::copy(&local_src.path, &dst_path).with_path(&dst_path)?;
        filetime::set_file_mtime(&dst_path, FileTime::from_system_time(src.mod_time()))
            .with_path(&dst_path)?;
        Ok(Box::new(
            self.object_from_path(&dst_path, remote.to_string())?,
        ))
    }
}

impl Mover for LocalBackend {
    fn move_object(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(local_src) = src.as_any().downcast_ref::<LocalObject>() else {
            return Err(SyncError::CantMove);
        };
        let dst_path = self.full_path(remote);
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        // Rename fails across filesystems; signal the caller to fall back
        if fs::rename(&local_src.path, &dst_path).is_err() {
            return Err(SyncError::CantMove);
        }
        Ok(Box::new(
            self.object_from_path(&dst_path, remote.to_string())?,
        ))
    }
}

impl DirMover for LocalBackend {
    fn dir_move(&self, src: &dyn Backend) -> Result<()> {
        let Some(local_src) = src.as_any().downcast_ref::<LocalBackend>() else {
            return Err(SyncError::CantDirMove);
        };
        if self.root.exists() {
            return Err(SyncError::DirExists);
        }
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        if fs::rename(&local_src.root, &self.root).is_err() {
            return Err(SyncError::CantDirMove);
        }
        Ok(())
    }
}

impl Purger for LocalBackend {
    fn purge(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::DirNotFound(self.root_string.clone()))
            }
            Err(err) => Err(SyncError::io(&self.root, err)),
        }
    }
}

/// One file on the local filesystem
pub struct LocalObject {
    path: PathBuf,
    remote: String,
    size: i64,
    mod_time: SystemTime,
}

impl Object for LocalObject {
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
        filetime::set_file_mtime(&self.path, FileTime::from_system_time(mod_time))
            .with_path(&self.path)
    }

    fn hash(&self, kind: HashKind) -> Result<Option<String>> {
        let file = File::open(&self.path).with_path(&self.path)?;
        Ok(Some(hash_reader(file, kind)?))
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).with_path(&self.path)?;
        Ok(Box::new(file))
    }

    fn update(&self, reader: &mut dyn Read, mod_time: SystemTime, _size: i64) -> Result<()> {
        let mut file = File::create(&self.path).with_path(&self.path)?;
        std::io::copy(reader, &mut file).with_path(&self.path)?;
        drop(file);
        filetime::set_file_mtime(&self.path, FileTime::from_system_time(mod_time))
            .with_path(&self.path)
    }

    fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path).with_path(&self.path)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
