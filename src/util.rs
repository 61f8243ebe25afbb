use memmap2::Mmap;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{IoResultExt, PatchError, Result};
use crate::ignore::IgnoreSet;

/// Chunk size for streaming copies; cancellation is checked between chunks.
const COPY_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct TreeFile {
    pub relative_path: String,
    pub full_path: PathBuf,
    /// Length seen by the walk; a length mismatch means the contents differ.
    pub size: u64,
}

/// Forward slashes for cross-platform consistency in the patch format.
pub fn normalize_rel_path(path: &str) -> String {
    path.replace('\\', "/")
}

pub fn relative_path(root: &Path, full: &Path) -> Result<String> {
    let relative = full.strip_prefix(root).map_err(|_| PatchError::Io {
        path: full.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path escapes tree root"),
    })?;
    let relative = relative.to_str().ok_or_else(|| PatchError::Io {
        path: full.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF8 path"),
    })?;
    Ok(normalize_rel_path(relative))
}

/// Walk a tree and collect every regular file that is not ignored.
///
/// Order matches a depth-first walk that visits a directory's files (by name)
/// before descending into its subdirectories (by name). Ignored directories
/// are pruned without being read. Symlinks and special files are rejected.
pub fn walk_files(root: &Path, ignore: &IgnoreSet) -> Result<Vec<TreeFile>> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by(|a, b| match (a.file_type().is_dir(), b.file_type().is_dir()) {
            (false, true) => Ordering::Less,
            (true, false) => Ordering::Greater,
            _ => a.file_name().cmp(b.file_name()),
        })
        .into_iter()
        .filter_entry(|entry| match relative_path(root, entry.path()) {
            Ok(rel) if entry.file_type().is_dir() => !ignore.ignores_dir(&rel),
            Ok(rel) => !ignore.ignores_file(&rel),
            // Surfaced below as a proper error.
            Err(_) => true,
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| PatchError::Io {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            return Err(PatchError::UnsupportedEntry(entry.path().to_path_buf()));
        }

        let full_path = entry.path().to_path_buf();
        let size = entry.metadata().map_err(|e| PatchError::Io {
            path: full_path.clone(),
            source: e.into(),
        })?.len();

        files.push(TreeFile {
            relative_path: relative_path(root, &full_path)?,
            full_path,
            size,
        });
    }

    Ok(files)
}

/// Memory-map a file for read-only access.
///
/// Callers must not truncate or replace the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path).at(path)?;
    // SAFETY: read-only mapping; each apply operation owns its files exclusively.
    unsafe { Mmap::map(&file).at(path) }
}

/// `root` joined with a `/`-separated relative path.
pub fn join_rel(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(rel.split('/'));
    path
}

/// Create the parent directory of `path`. Safe to race with other workers
/// creating the same directory.
pub async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.at(parent)?;
    }
    Ok(())
}

/// Stream `reader` into `writer` in fixed chunks, checking `cancel` between chunks.
pub async fn copy_stream<R, W>(reader: &mut R, writer: &mut W, cancel: Option<&CancelToken>) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    loop {
        if let Some(token) = cancel {
            token.check()?;
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    writer.flush().await?;
    Ok(copied)
}

/// Copy `src` over `dst`, creating or truncating `dst`.
pub async fn copy_file(src: &Path, dst: &Path, cancel: Option<&CancelToken>) -> Result<u64> {
    let mut reader = tokio::fs::File::open(src).await.at(src)?;
    let mut writer = tokio::fs::File::create(dst).await.at(dst)?;
    copy_stream(&mut reader, &mut writer, cancel).await
}
