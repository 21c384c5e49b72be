//! Ordered include/exclude filtering with size and age bounds
//!
//! Rules are evaluated in order and the first matching rule wins. An
//! implicit trailing `- *` applies whenever at least one explicit include
//! rule was supplied; otherwise the default verdict is include. A
//! `--files-from` manifest replaces pattern filtering entirely: only
//! literal paths in the manifest are eligible. Size and age predicates are
//! AND-composed after the rule verdict.

mod glob;

pub use glob::GlobPattern;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::{IoResultExt, Result, SyncError};
use crate::paths::normalize_remote;

/// Whether a matched rule includes or excludes the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// A `+` rule
    Include,
    /// A `-` rule
    Exclude,
}

/// One ordered filter rule
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Verdict when the pattern matches
    pub kind: RuleKind,
    pattern: GlobPattern,
}

impl FilterRule {
    /// Compile a rule from a kind and pattern text
    pub fn new(kind: RuleKind, pattern: &str) -> Result<Self> {
        Ok(Self {
            kind,
            pattern: GlobPattern::new(pattern)?,
        })
    }
}

/// The assembled filter: ordered rules plus size/age bounds
#[derive(Debug, Default)]
pub struct Filter {
    rules: Vec<FilterRule>,
    saw_include: bool,
    files_from: Option<HashSet<String>>,
    /// Reject objects smaller than this
    pub min_size: Option<i64>,
    /// Reject objects larger than this
    pub max_size: Option<i64>,
    /// Reject objects younger than this
    pub min_age: Option<Duration>,
    /// Reject objects older than this
    pub max_age: Option<Duration>,
}

impl Filter {
    /// Create a filter that includes everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an include rule
    pub fn add_include(&mut self, pattern: &str) -> Result<()> {
        self.rules.push(FilterRule::new(RuleKind::Include, pattern)?);
        self.saw_include = true;
        Ok(())
    }

    /// Append an exclude rule
    pub fn add_exclude(&mut self, pattern: &str) -> Result<()> {
        self.rules.push(FilterRule::new(RuleKind::Exclude, pattern)?);
        Ok(())
    }

    /// Append a textual rule: `+ PATTERN`, `- PATTERN`, or `!` to clear
    pub fn add_rule(&mut self, rule: &str) -> Result<()> {
        let rule = rule.trim();
        if rule == "!" {
            self.rules.clear();
            self.saw_include = false;
            return Ok(());
        }
        if let Some(pattern) = rule.strip_prefix('+') {
            return self.add_include(pattern.trim_start());
        }
        if let Some(pattern) = rule.strip_prefix('-') {
            return self.add_exclude(pattern.trim_start());
        }
        Err(SyncError::FilterRule {
            rule: rule.to_string(),
            reason: "expected '+ PATTERN', '- PATTERN' or '!'".to_string(),
        })
    }

    /// Read `+`/`-` rules from a file, one per line
    ///
    /// Blank lines and lines starting with `#` or `;` are skipped.
    pub fn add_rules_from_file(&mut self, path: &Path) -> Result<()> {
        for line in read_rule_lines(path)? {
            self.add_rule(&line)?;
        }
        Ok(())
    }

    /// Read include patterns from a file, one per line
    pub fn add_includes_from_file(&mut self, path: &Path) -> Result<()> {
        for line in read_rule_lines(path)? {
            self.add_include(&line)?;
        }
        Ok(())
    }

    /// Read exclude patterns from a file, one per line
    pub fn add_excludes_from_file(&mut self, path: &Path) -> Result<()> {
        for line in read_rule_lines(path)? {
            self.add_exclude(&line)?;
        }
        Ok(())
    }

    /// Load a files-from manifest of literal paths
    ///
    /// Replaces all pattern filtering; size and age predicates still apply.
    pub fn add_files_from(&mut self, path: &Path) -> Result<()> {
        let manifest = self
            .files_from
            .get_or_insert_with(HashSet::new);
        for line in read_rule_lines(path)? {
            manifest.insert(normalize_remote(&line));
        }
        Ok(())
    }

    /// Whether a files-from manifest is in effect
    pub fn uses_files_from(&self) -> bool {
        self.files_from.is_some()
    }

    /// Whether this filter includes everything
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
            && self.files_from.is_none()
            && self.min_size.is_none()
            && self.max_size.is_none()
            && self.min_age.is_none()
            && self.max_age.is_none()
    }

    fn rule_verdict(&self, remote: &str) -> bool {
        if let Some(manifest) = &self.files_from {
            return manifest.contains(remote);
        }
        for rule in &self.rules {
            if rule.pattern.matches(remote) {
                return rule.kind == RuleKind::Include;
            }
        }
        // Implicit trailing `- *` once any include rule exists
        !self.saw_include
    }

    fn bounds_verdict(&self, size: i64, mod_time: SystemTime) -> bool {
        if size >= 0 {
            if let Some(min) = self.min_size {
                if size < min {
                    return false;
                }
            }
            if let Some(max) = self.max_size {
                if size > max {
                    return false;
                }
            }
        }
        if self.min_age.is_some() || self.max_age.is_some() {
            // Unknown mod times pass: age cannot be evaluated
            if mod_time != SystemTime::UNIX_EPOCH {
                let age = SystemTime::now()
                    .duration_since(mod_time)
                    .unwrap_or(Duration::ZERO);
                if let Some(min) = self.min_age {
                    if age < min {
                        return false;
                    }
                }
                if let Some(max) = self.max_age {
                    if age > max {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// The filter predicate: `(path, size, mod_time) -> include?`
    pub fn include(&self, remote: &str, size: i64, mod_time: SystemTime) -> bool {
        self.rule_verdict(remote) && self.bounds_verdict(size, mod_time)
    }

    /// Render the active rules for `--dump-filters`
    pub fn dump(&self) -> String {
        let mut out = String::new();
        if let Some(manifest) = &self.files_from {
            out.push_str(&format!("--- files-from: {} path(s)\n", manifest.len()));
        }
        for rule in &self.rules {
            let sign = match rule.kind {
                RuleKind::Include => '+',
                RuleKind::Exclude => '-',
            };
            out.push_str(&format!("{} {}\n", sign, rule.pattern.text));
        }
        if self.saw_include {
            out.push_str("- * (implicit)\n");
        }
        if let Some(min) = self.min_size {
            out.push_str(&format!("min-size: {}\n", min));
        }
        if let Some(max) = self.max_size {
            out.push_str(&format!("max-size: {}\n", max));
        }
        if let Some(min) = self.min_age {
            out.push_str(&format!("min-age: {:?}\n", min));
        }
        if let Some(max) = self.max_age {
            out.push_str(&format!("max-age: {:?}\n", max));
        }
        out
    }
}

fn read_rule_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).with_path(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with(';'))
        .map(str::to_string)
        .collect())
}
