//! Glob compilation for filter rules
//!
//! Compiles the rule dialect to regular expressions. Patterns are
//! matched against the object's remote path (no leading slash). A
//! `/`-anchored pattern matches only from the root; an unanchored pattern
//! matches a full path suffix ending on a `/`-aligned boundary. `*` stops
//! at `/`, `**` does not, `?` matches one non-`/` character, `[...]` and
//! `{a,b}` have their usual meanings and `\` escapes the next
//! metacharacter. A trailing `/` is ignored.

use regex::Regex;

use crate::error::{Result, SyncError};

/// A compiled rule pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    /// Pattern text as supplied in the rule
    pub text: String,
    matcher: Regex,
}

fn rule_error(rule: &str, reason: impl Into<String>) -> SyncError {
    SyncError::FilterRule {
        rule: rule.to_string(),
        reason: reason.into(),
    }
}

fn glob_to_regex(pattern: &str) -> Result<String> {
    let stripped = pattern.strip_suffix('/').unwrap_or(pattern);
    let (anchored, body) = match stripped.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, stripped),
    };
    if body.is_empty() {
        return Err(rule_error(pattern, "empty pattern"));
    }

    let mut re = String::new();
    re.push_str(if anchored { "^" } else { "(^|/)" });

    let mut stars = 0usize;
    let mut in_braces = false;
    let mut in_brackets = 0usize;
    let mut escaped = false;

    let flush_stars = |re: &mut String, stars: &mut usize| -> Result<()> {
        match *stars {
            0 => {}
            1 => re.push_str("[^/]*"),
            2 => re.push_str(".*"),
            _ => return Err(rule_error(pattern, "too many consecutive '*'")),
        }
        *stars = 0;
        Ok(())
    };

    for c in body.chars() {
        if escaped {
            // Escaped character is a literal
            for escaped_char in regex::escape(&c.to_string()).chars() {
                re.push(escaped_char);
            }
            escaped = false;
            continue;
        }
        if c != '*' {
            flush_stars(&mut re, &mut stars)?;
        }
        if in_brackets > 0 {
            re.push(c);
            match c {
                '[' => in_brackets += 1,
                ']' => in_brackets -= 1,
                _ => {}
            }
            continue;
        }
        match c {
            '\\' => escaped = true,
            '*' => stars += 1,
            '?' => re.push_str("[^/]"),
            '[' => {
                re.push(c);
                in_brackets += 1;
            }
            ']' => return Err(rule_error(pattern, "mismatched ']'")),
            '{' => {
                if in_braces {
                    return Err(rule_error(pattern, "can't nest '{' '}'"));
                }
                in_braces = true;
                re.push('(');
            }
            '}' => {
                if !in_braces {
                    return Err(rule_error(pattern, "mismatched '{' and '}'"));
                }
                in_braces = false;
                re.push(')');
            }
            ',' => re.push(if in_braces { '|' } else { ',' }),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' => {
                re.push('\\');
                re.push(c);
            }
            _ => re.push(c),
        }
    }
    flush_stars(&mut re, &mut stars)?;

    if escaped {
        return Err(rule_error(pattern, "trailing '\\'"));
    }
    if in_brackets > 0 {
        return Err(rule_error(pattern, "mismatched '[' and ']'"));
    }
    if in_braces {
        return Err(rule_error(pattern, "mismatched '{' and '}'"));
    }

    re.push('$');
    Ok(re)
}

impl GlobPattern {
    /// Compile a rule pattern
    pub fn new(pattern: &str) -> Result<Self> {
        let re = glob_to_regex(pattern)?;
        let matcher = Regex::new(&re).map_err(|e| rule_error(pattern, e.to_string()))?;
        Ok(Self {
            text: pattern.to_string(),
            matcher,
        })
    }

    /// Whether `remote` matches this pattern
    pub fn matches(&self, remote: &str) -> bool {
        self.matcher.is_match(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        GlobPattern::new(pattern).unwrap().matches(path)
    }

    #[test]
    fn test_star_does_not_cross_slash() {
        assert!(matches("*.jpg", "file.jpg"));
        assert!(matches("*.jpg", "dir/file.jpg"));
        assert!(!matches("dir*", "dir/file.jpg"));
    }

    #[test]
    fn test_double_star_crosses_slash() {
        assert!(matches("dir/**", "dir/a/b/c.txt"));
        assert!(matches("**.jpg", "a/b/file.jpg"));
        assert!(matches("**.jpg", "file.jpg"));
        assert!(!matches("**.jpg", "file.png"));
    }

    #[test]
    fn test_anchored_matches_only_at_root() {
        assert!(matches("/foo.txt", "foo.txt"));
        assert!(!matches("/foo.txt", "dir/foo.txt"));
        assert!(matches("/dir/*.txt", "dir/a.txt"));
        assert!(!matches("/dir/*.txt", "other/dir/a.txt"));
    }

    #[test]
    fn test_unanchored_matches_suffix_on_boundary() {
        assert!(matches("foo.txt", "foo.txt"));
        assert!(matches("foo.txt", "a/b/foo.txt"));
        assert!(!matches("foo.txt", "xfoo.txt"));
        assert!(matches("b/foo.txt", "a/b/foo.txt"));
        assert!(!matches("b/foo.txt", "ab/foo.txt"));
    }

    #[test]
    fn test_question_mark() {
        assert!(matches("file?.txt", "file1.txt"));
        assert!(!matches("file?.txt", "file10.txt"));
        assert!(!matches("a?b", "a/b"));
    }

    #[test]
    fn test_alternatives_expand_distributively() {
        assert!(matches("*.{jpg,png}", "photo.jpg"));
        assert!(matches("*.{jpg,png}", "photo.png"));
        assert!(!matches("*.{jpg,png}", "photo.gif"));
        // Alternatives may themselves contain wildcards
        assert!(matches("{*.tmp,*.bak}", "dir/old.bak"));
    }

    #[test]
    fn test_bracket_class() {
        assert!(matches("file[0-9].log", "file7.log"));
        assert!(!matches("file[0-9].log", "filex.log"));
    }

    #[test]
    fn test_escaped_metacharacter() {
        assert!(matches(r"star\*.txt", "star*.txt"));
        assert!(!matches(r"star\*.txt", "starA.txt"));
    }

    #[test]
    fn test_literal_dot_is_not_wildcard() {
        assert!(!matches("a.txt", "abtxt"));
    }

    #[test]
    fn test_trailing_slash_ignored() {
        assert!(matches("dir/", "dir"));
        assert!(matches("dir/", "a/dir"));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(GlobPattern::new("").is_err());
        assert!(GlobPattern::new("/").is_err());
        assert!(GlobPattern::new("***").is_err());
        assert!(GlobPattern::new("{a,{b,c}}").is_err());
        assert!(GlobPattern::new("a]b").is_err());
        assert!(GlobPattern::new("[abc").is_err());
    }
}
