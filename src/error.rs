use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::hasher::Digest;

/// Errors produced while building, loading or applying a patch.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("patch archive has no manifest entry")]
    ManifestMissing,

    #[error("patch manifest is malformed: {0}")]
    ManifestMalformed(String),

    #[error("unsupported patch version: {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("patch archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("patch archive already contains an entry named {0}")]
    DuplicateEntry(String),

    #[error("patch archive is missing entry {0}")]
    MissingArchiveEntry(String),

    #[error("{0} collides with a name reserved by the patch format")]
    ReservedPath(String),

    #[error("unsupported directory entry (symlink or special file): {}", .0.display())]
    UnsupportedEntry(PathBuf),

    #[error("failed to apply patch because {0} does not exist in the source installation directory")]
    SourceFileMissing(String),

    #[error(
        "file {file} does not match expected hash {expected} (found {actual}). Cannot apply patch! \
         Check that the patch you are applying was built for the same distribution and version \
         of the installation you are patching."
    )]
    PreImageMismatch {
        file: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("file {file} does not match expected hash {expected} after patching (found {actual})")]
    PostImageMismatch {
        file: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("failed to apply delta to {file}: {source}")]
    Delta {
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Stream(#[from] io::Error),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = PatchError> = std::result::Result<T, E>;

/// Attach the offending path to a raw `io::Error`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// How far a single operation got before it stopped.
///
/// Only `Patch` operations walk the full chain; `Add` goes
/// `Pending -> Transformed -> PostVerified -> Done` and `Remove` goes straight
/// from `Pending` to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStage {
    Pending,
    BackedUp,
    PreVerified,
    Transformed,
    PostVerified,
    Done,
}

impl fmt::Display for OperationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStage::Pending => "pending",
            OperationStage::BackedUp => "backed up",
            OperationStage::PreVerified => "pre-verified",
            OperationStage::Transformed => "transformed",
            OperationStage::PostVerified => "post-verified",
            OperationStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A failed operation as delivered to [`crate::applier::ApplyObserver::on_error`].
#[derive(Debug)]
pub struct OperationFailure {
    pub file: String,
    pub stage: OperationStage,
    pub error: PatchError,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stopped at {}): {}", self.file, self.stage, self.error)
    }
}

impl std::error::Error for OperationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
