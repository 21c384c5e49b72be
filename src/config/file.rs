//! Sectioned remotes config file
//!
//! Remote definitions live in a plain text file of named sections, each
//! holding a `type` key plus adapter-specific key/value pairs:
//!
//! ```text
//! [backup]
//! type = memory
//!
//! [nas]
//! type = local
//! root = /mnt/nas
//! ```
//!
//! The file may contain secrets, so it is created with owner-only
//! permissions. Lookups happen once at startup; worker code paths never
//! touch the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result, SyncError};

/// One named section of the config file
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name, the remote name used in `name:path`
    pub name: String,
    /// Key/value pairs in file order
    pub values: Vec<(String, String)>,
}

impl Section {
    /// Look up a key in this section
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The section's backend type, if declared
    pub fn backend_type(&self) -> Option<&str> {
        self.get("type")
    }
}

/// Parsed remotes config file
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    sections: Vec<Section>,
}

impl ConfigFile {
    /// Default platform location, overridable via `SKYSYNC_CONFIG`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = env::var("SKYSYNC_CONFIG") {
            return PathBuf::from(path);
        }
        #[cfg(windows)]
        let home = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(windows))]
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home).join(".skysync.conf")
    }

    /// Load a config file; a missing file yields an empty config
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).with_path(path)?;
        Self::parse(&content)
    }

    /// Parse config file content
    pub fn parse(content: &str) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push(Section {
                    name: name.trim().to_string(),
                    values: Vec::new(),
                });
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                SyncError::config(format!("line {}: expected 'key = value'", lineno + 1))
            })?;
            let section = sections.last_mut().ok_or_else(|| {
                SyncError::config(format!("line {}: key outside any section", lineno + 1))
            })?;
            section
                .values
                .push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { sections })
    }

    /// Look up a section by remote name
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Look up a value; a missing section is reported as
    /// [`SyncError::NotFoundInConfig`]
    pub fn get_value(&self, section: &str, key: &str) -> Result<&str> {
        let section_ref = self
            .section(section)
            .ok_or_else(|| SyncError::NotFoundInConfig(section.to_string()))?;
        section_ref
            .get(key)
            .ok_or_else(|| SyncError::config(format!("remote '{}' has no '{}' key", section, key)))
    }

    /// All section names in file order
    pub fn remote_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    /// Serialize back to the file format
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.name));
            for (key, value) in &section.values {
                out.push_str(&format!("{} = {}\n", key, value));
            }
            out.push('\n');
        }
        out
    }

    /// Write the file with owner-only permissions
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_path(parent)?;
            }
        }
        fs::write(path, self.render()).with_path(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).with_path(path)?;
        }

        Ok(())
    }
}
