//! Content-hash support for backend equality checks
//!
//! Backends declare which hash algorithms they can produce as a compact
//! [`HashTypeSet`]; the equality oracle intersects the source and
//! destination sets to decide whether hash comparison is available for a
//! pair. All hashers support streaming for single-pass hash-while-reading.

use std::fmt;
use std::io::Read;

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::{Result, SyncError};

/// A content-hash algorithm a backend may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    /// MD5, 128 bits, the lingua franca of object stores
    Md5,
    /// SHA-1, 160 bits
    Sha1,
}

impl HashKind {
    /// All hash kinds, in preference order
    pub const ALL: [HashKind; 2] = [HashKind::Md5, HashKind::Sha1];

    /// Expected hex digest width
    pub fn hex_width(self) -> usize {
        match self {
            HashKind::Md5 => 32,
            HashKind::Sha1 => 40,
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashKind::Md5 => write!(f, "MD5"),
            HashKind::Sha1 => write!(f, "SHA-1"),
        }
    }
}

/// Compact set of hash kinds declared by a backend
///
/// Immutable for the lifetime of a run once a backend has declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashTypeSet(u32);

impl HashTypeSet {
    /// The empty set: hash-based equality unavailable
    pub fn none() -> Self {
        HashTypeSet(0)
    }

    /// Every supported kind
    pub fn full() -> Self {
        let mut set = Self::none();
        for kind in HashKind::ALL {
            set = set.with(kind);
        }
        set
    }

    /// Set containing exactly one kind
    pub fn only(kind: HashKind) -> Self {
        Self::none().with(kind)
    }

    fn bit(kind: HashKind) -> u32 {
        match kind {
            HashKind::Md5 => 1,
            HashKind::Sha1 => 2,
        }
    }

    /// Return a copy with `kind` added
    pub fn with(self, kind: HashKind) -> Self {
        HashTypeSet(self.0 | Self::bit(kind))
    }

    /// Whether this set contains `kind`
    pub fn contains(self, kind: HashKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    /// Intersection with another set
    pub fn overlap(self, other: HashTypeSet) -> HashTypeSet {
        HashTypeSet(self.0 & other.0)
    }

    /// Whether no kinds are present
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the kinds present, in preference order
    pub fn kinds(self) -> impl Iterator<Item = HashKind> {
        HashKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }

    /// The preferred kind for comparisons, if any
    pub fn best(self) -> Option<HashKind> {
        self.kinds().next()
    }
}

/// Case-insensitive digest comparison
///
/// Hash strings for the same kind compare case-insensitively; backends are
/// not consistent about digest casing.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Unified streaming hasher over all supported kinds
pub enum Hasher {
    /// MD5 state
    Md5(Md5),
    /// SHA-1 state
    Sha1(Sha1),
}

impl Hasher {
    /// Create a new hasher for the given kind
    pub fn new(kind: HashKind) -> Self {
        match kind {
            HashKind::Md5 => Self::Md5(Md5::new()),
            HashKind::Sha1 => Self::Sha1(Sha1::new()),
        }
    }

    /// The kind this hasher computes
    pub fn kind(&self) -> HashKind {
        match self {
            Self::Md5(_) => HashKind::Md5,
            Self::Sha1(_) => HashKind::Sha1,
        }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
        }
    }

    /// Finalize and return the digest as lowercase hex
    pub fn finalize(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
        }
    }
}

/// Compute several hash kinds in a single pass over the data
pub struct MultiHasher {
    hashers: Vec<Hasher>,
}

impl MultiHasher {
    /// Create a multi-hasher for every kind in `set`
    pub fn new(set: HashTypeSet) -> Self {
        Self {
            hashers: set.kinds().map(Hasher::new).collect(),
        }
    }

    /// Update every hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(data);
        }
    }

    /// Finalize all hashers, yielding `(kind, lowercase hex)` pairs
    pub fn finalize(self) -> Vec<(HashKind, String)> {
        self.hashers
            .into_iter()
            .map(|h| (h.kind(), h.finalize()))
            .collect()
    }
}

/// Hash everything a reader produces
pub fn hash_reader<R: Read>(mut reader: R, kind: HashKind) -> Result<String> {
    let mut hasher = Hasher::new(kind);
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| SyncError::io("<reader>", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Hash a byte slice
pub fn hash_bytes(data: &[u8], kind: HashKind) -> String {
    let mut hasher = Hasher::new(kind);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_overlap() {
        let both = HashTypeSet::full();
        let md5 = HashTypeSet::only(HashKind::Md5);
        let sha1 = HashTypeSet::only(HashKind::Sha1);

        assert_eq!(both.overlap(md5), md5);
        assert!(md5.overlap(sha1).is_empty());
        assert_eq!(both.overlap(both), both);
        assert!(HashTypeSet::none().overlap(both).is_empty());
    }

    #[test]
    fn test_set_best_prefers_md5() {
        assert_eq!(HashTypeSet::full().best(), Some(HashKind::Md5));
        assert_eq!(
            HashTypeSet::only(HashKind::Sha1).best(),
            Some(HashKind::Sha1)
        );
        assert_eq!(HashTypeSet::none().best(), None);
    }

    #[test]
    fn test_known_digests() {
        // RFC 1321 / FIPS 180-1 test vectors for "abc"
        assert_eq!(
            hash_bytes(b"abc", HashKind::Md5),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hash_bytes(b"abc", HashKind::Sha1),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_hash_reader_matches_bytes() {
        let data = b"hello hash reader".to_vec();
        let streamed = hash_reader(&data[..], HashKind::Md5).unwrap();
        assert_eq!(streamed, hash_bytes(&data, HashKind::Md5));
    }

    #[test]
    fn test_multi_hasher() {
        let mut multi = MultiHasher::new(HashTypeSet::full());
        multi.update(b"abc");
        let digests = multi.finalize();
        assert_eq!(digests.len(), 2);
        assert!(digests
            .iter()
            .any(|(k, v)| *k == HashKind::Md5 && v == "900150983cd24fb0d6963f7d28e17f72"));
    }

    #[test]
    fn test_case_insensitive_compare() {
        assert!(hashes_equal(
            "900150983CD24FB0D6963F7D28E17F72",
            "900150983cd24fb0d6963f7d28e17f72"
        ));
        assert!(!hashes_equal("abc", "abd"));
    }
}
