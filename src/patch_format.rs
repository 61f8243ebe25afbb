use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};
use crate::hasher::Digest;

pub const MAGIC: &[u8; 8] = b"TPARCH01";
pub const FORMAT_VERSION: u32 = 1;

/// Archive key of the manifest entry. Always the last entry written.
pub const MANIFEST_ENTRY: &str = "manifest.json";
/// Appended to a file name to form the archive key of its delta.
pub const DELTA_SUFFIX: &str = ".bsdiff";
/// Appended to a file name to form the path of its pre-image backup.
pub const BACKUP_SUFFIX: &str = ".unpatched";

/// One file-level step. Each action carries exactly the hashes it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all_fields = "camelCase")]
pub enum PatchOperation {
    Patch {
        file_name: String,
        original_hash: Digest,
        final_hash: Digest,
    },
    Add {
        file_name: String,
        final_hash: Digest,
    },
    Remove {
        file_name: String,
    },
}

impl PatchOperation {
    pub fn file_name(&self) -> &str {
        match self {
            PatchOperation::Patch { file_name, .. }
            | PatchOperation::Add { file_name, .. }
            | PatchOperation::Remove { file_name } => file_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PatchOperation::Patch { .. } => "Patch",
            PatchOperation::Add { .. } => "Add",
            PatchOperation::Remove { .. } => "Remove",
        }
    }

    /// Archive key holding this operation's payload; `None` for removals.
    pub fn archive_key(&self) -> Option<String> {
        match self {
            PatchOperation::Patch { file_name, .. } => Some(format!("{file_name}{DELTA_SUFFIX}")),
            PatchOperation::Add { file_name, .. } => Some(file_name.clone()),
            PatchOperation::Remove { .. } => None,
        }
    }
}

impl fmt::Display for PatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.file_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchManifest {
    pub version: u32,
    pub operations: Vec<PatchOperation>,
}

impl Default for PatchManifest {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            operations: Vec::new(),
        }
    }
}

impl PatchManifest {
    pub fn push(&mut self, op: PatchOperation) {
        self.operations.push(op);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PatchError::ManifestMalformed(e.to_string()))
    }

    /// Parse and validate manifest text read from an archive.
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: PatchManifest =
            serde_json::from_str(text).map_err(|e| PatchError::ManifestMalformed(e.to_string()))?;
        if manifest.version != FORMAT_VERSION {
            return Err(PatchError::UnsupportedVersion {
                found: manifest.version,
                expected: FORMAT_VERSION,
            });
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject manifests that would make two operations touch the same file or
    /// payload, or that name paths outside the target tree.
    pub fn validate(&self) -> Result<()> {
        let mut names: HashSet<&str> = HashSet::with_capacity(self.operations.len());
        let mut keys: HashSet<String> = HashSet::with_capacity(self.operations.len());

        for op in &self.operations {
            let name = op.file_name();
            check_relative_path(name)?;
            if name == MANIFEST_ENTRY {
                return Err(PatchError::ManifestMalformed(format!(
                    "{name} is reserved for the manifest entry"
                )));
            }
            if !names.insert(name) {
                return Err(PatchError::ManifestMalformed(format!(
                    "{name} is named by more than one operation"
                )));
            }
            if let Some(key) = op.archive_key() {
                if !keys.insert(key.clone()) {
                    return Err(PatchError::ManifestMalformed(format!(
                        "archive entry {key} is claimed by more than one operation"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A manifest path must be relative, `/`-separated and free of `.`/`..` segments.
pub fn check_relative_path(name: &str) -> Result<()> {
    let malformed = |why: &str| Err(PatchError::ManifestMalformed(format!("{name:?}: {why}")));

    if name.is_empty() {
        return malformed("empty file name");
    }
    if name.contains('\\') {
        return malformed("backslash in file name");
    }
    if name.starts_with('/') {
        return malformed("absolute path");
    }
    // Windows reads a colon as a drive prefix or an alternate data stream.
    if cfg!(windows) && name.contains(':') {
        return malformed("colon in file name");
    }
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return malformed("empty, '.' or '..' path segment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::digest_bytes;

    fn sample() -> PatchManifest {
        PatchManifest {
            version: FORMAT_VERSION,
            operations: vec![
                PatchOperation::Patch {
                    file_name: "data.bin".into(),
                    original_hash: digest_bytes(b"AAAA"),
                    final_hash: digest_bytes(b"AABB"),
                },
                PatchOperation::Add {
                    file_name: "sub/extra.txt".into(),
                    final_hash: digest_bytes(b"hi"),
                },
                PatchOperation::Remove {
                    file_name: "old.txt".into(),
                },
            ],
        }
    }

    #[test]
    fn test_json_shape() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let ops = value["operations"].as_array().unwrap();
        assert_eq!(ops[0]["action"], "Patch");
        assert_eq!(ops[0]["fileName"], "data.bin");
        assert_eq!(ops[0]["originalHash"], digest_bytes(b"AAAA").to_hex());
        assert_eq!(ops[1]["action"], "Add");
        assert!(ops[1].get("originalHash").is_none());
        assert_eq!(ops[2]["action"], "Remove");
        assert!(ops[2].get("finalHash").is_none());
    }

    #[test]
    fn test_parse_back() {
        let manifest = sample();
        let parsed = PatchManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_add_without_final_hash_is_malformed() {
        let text = r#"{"version":1,"operations":[{"action":"Add","fileName":"a.txt"}]}"#;
        assert!(matches!(
            PatchManifest::from_json(text),
            Err(PatchError::ManifestMalformed(_))
        ));
    }

    #[test]
    fn test_unknown_version() {
        let text = r#"{"version":9,"operations":[]}"#;
        assert!(matches!(
            PatchManifest::from_json(text),
            Err(PatchError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_duplicate_file_name_rejected() {
        let mut manifest = sample();
        manifest.push(PatchOperation::Remove {
            file_name: "data.bin".into(),
        });
        assert!(matches!(
            manifest.validate(),
            Err(PatchError::ManifestMalformed(_))
        ));
    }

    #[test]
    fn test_colliding_archive_keys_rejected() {
        let manifest = PatchManifest {
            version: FORMAT_VERSION,
            operations: vec![
                PatchOperation::Patch {
                    file_name: "a".into(),
                    original_hash: digest_bytes(b"1"),
                    final_hash: digest_bytes(b"2"),
                },
                PatchOperation::Add {
                    file_name: "a.bsdiff".into(),
                    final_hash: digest_bytes(b"3"),
                },
            ],
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_path_checks() {
        assert!(check_relative_path("a/b/c.txt").is_ok());
        for bad in ["", "/etc/passwd", "a/../b", "./a", "a//b", "a\\b"] {
            assert!(check_relative_path(bad).is_err(), "{bad:?} should be rejected");
        }
        assert_eq!(check_relative_path("C:/x").is_err(), cfg!(windows));
        assert_eq!(check_relative_path("maps/a:b.txt").is_err(), cfg!(windows));
    }
}
