//! Path and name utilities shared by backends and the pair builder
//!
//! Remote paths are canonical slash-separated strings with no leading
//! slash. Backends whose listings return case-inconsistent parent
//! components use [`NameTree`] to learn the canonical case of each
//! directory as entries are seen.

use std::collections::HashMap;

/// Normalize a remote path to canonical form
///
/// Converts OS-native separators to `/` and strips leading and trailing
/// slashes. The result never contains backslashes.
pub fn normalize_remote(path: &str) -> String {
    let slashed = path.replace('\\', "/");
    slashed.trim_matches('/').to_string()
}

/// Case-folding key function used when the destination is case-insensitive
pub fn fold_key(remote: &str) -> String {
    remote.to_lowercase()
}

/// Split a remote path into `(parent, leaf)`
///
/// The parent is `""` for entries directly under the root.
pub fn split_parent(remote: &str) -> (&str, &str) {
    match remote.rfind('/') {
        Some(idx) => (&remote[..idx], &remote[idx + 1..]),
        None => ("", remote),
    }
}

/// Names that case-insensitive stores silently ignore and must never be
/// uploaded. The upload path consults this before `put`.
const DISALLOWED_LEAVES: &[&str] = &[
    "desktop.ini",
    "thumbs.db",
    ".ds_store",
    "icon\r",
    ".dropbox",
    ".dropbox.attr",
];

/// Whether the leaf of `remote` is a name the destination will ignore
pub fn is_disallowed_name(remote: &str) -> bool {
    let (_, leaf) = split_parent(remote);
    let folded = leaf.to_lowercase();
    DISALLOWED_LEAVES.contains(&folded.as_str())
}

/// Learns the canonical case of each directory component as directory
/// entries are seen.
///
/// Listings that deliver entries with case-inconsistent parent components
/// feed every directory through
/// [`put_case_correct_directory_name`](NameTree::put_case_correct_directory_name);
/// the pair builder then rewrites upload paths with
/// [`get_path_with_correct_case`](NameTree::get_path_with_correct_case) so
/// objects land under the destination's observed casing.
#[derive(Default)]
pub struct NameTree {
    root: Node,
}

#[derive(Default)]
struct Node {
    /// Empty until a directory entry reveals the canonical case
    case_correct_name: String,
    directories: HashMap<String, Node>,
}

impl Node {
    fn child(&mut self, component: &str) -> &mut Node {
        self.directories
            .entry(fold_key(component))
            .or_default()
    }
}

impl NameTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the canonical case of directory `name` under `parent_path`
    pub fn put_case_correct_directory_name(&mut self, parent_path: &str, name: &str) {
        let mut node = &mut self.root;
        if !parent_path.is_empty() {
            for component in parent_path.split('/') {
                node = node.child(component);
            }
        }
        let node = node.child(name);
        node.case_correct_name = name.to_string();
    }

    /// Rewrite `path` with every directory component in its learned case
    ///
    /// Returns `None` if any component's canonical case is not yet known.
    pub fn get_path_with_correct_case(&self, path: &str) -> Option<String> {
        if path.is_empty() {
            return Some(String::new());
        }
        let mut node = &self.root;
        let mut corrected = String::new();
        for component in path.split('/') {
            node = node.directories.get(&fold_key(component))?;
            if node.case_correct_name.is_empty() {
                return None;
            }
            if !corrected.is_empty() {
                corrected.push('/');
            }
            corrected.push_str(&node.case_correct_name);
        }
        Some(corrected)
    }
}
