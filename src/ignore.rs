use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{IoResultExt, PatchError, Result};
use crate::util::normalize_rel_path;

/// Relative paths excluded from diffing.
///
/// Matching is exact string equality on `/`-separated paths relative to the
/// tree root. A directory entry excludes its whole subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    dirs: HashSet<String>,
    files: HashSet<String>,
}

#[derive(Deserialize)]
struct IgnoreList {
    #[serde(default)]
    directories: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.add_dir(path);
        self
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.add_file(path);
        self
    }

    pub fn add_dir(&mut self, path: &str) {
        self.dirs.insert(normalize_entry(path));
    }

    pub fn add_file(&mut self, path: &str) {
        self.files.insert(normalize_entry(path));
    }

    /// Load `{ "directories": [...], "files": [...] }` and merge it into this set.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).at(path)?;
        let list: IgnoreList = serde_json::from_str(&text).map_err(|e| PatchError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        for dir in &list.directories {
            self.add_dir(dir);
        }
        for file in &list.files {
            self.add_file(file);
        }
        Ok(())
    }

    pub fn ignores_dir(&self, rel_path: &str) -> bool {
        self.dirs.contains(rel_path)
    }

    pub fn ignores_file(&self, rel_path: &str) -> bool {
        self.files.contains(rel_path)
    }
}

fn normalize_entry(path: &str) -> String {
    normalize_rel_path(path).trim_matches('/').to_string()
}
