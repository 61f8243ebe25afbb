//! Entry points tying the differ, the archive codec and the applier together.

use log::info;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::applier::{ApplyObserver, ApplyOptions, ApplyReport, PatchApplier};
use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::delta::{Bsdiff, DeltaCodec};
use crate::differ::{self, DiffOptions, DiffOutcome};
use crate::error::{IoResultExt, PatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
    pub files_patched: usize,
    pub files_added: usize,
    pub files_removed: usize,
    /// Uncompressed payload bytes (informational).
    pub total_bytes: u64,
    /// Size of the finished archive on disk.
    pub archive_bytes: u64,
}

/// Diff two trees into an archive written to `writer`. The manifest goes in last.
pub fn build_patch_into<W: Write>(
    old_root: &Path,
    new_root: &Path,
    options: &DiffOptions,
    codec: &dyn DeltaCodec,
    writer: W,
) -> Result<(W, DiffOutcome)> {
    let mut archive = ArchiveWriter::new(writer)?;
    let outcome = differ::diff_trees(old_root, new_root, options, codec, &mut archive)?;
    let writer = archive.finish(&outcome.manifest)?;
    Ok((writer, outcome))
}

/// Build a patch in memory. Returns the archive bytes and the payload total.
pub fn build_patch(old_root: &Path, new_root: &Path, options: &DiffOptions) -> Result<(Vec<u8>, u64)> {
    let (bytes, outcome) = build_patch_into(old_root, new_root, options, &Bsdiff, Vec::new())?;
    Ok((bytes, outcome.total_bytes))
}

/// Build a patch straight into `output`.
pub async fn build_patch_file(
    old_root: &Path,
    new_root: &Path,
    options: &DiffOptions,
    output: &Path,
) -> Result<BuildSummary> {
    let old_root = old_root.to_path_buf();
    let new_root = new_root.to_path_buf();
    let options = options.clone();
    let output: PathBuf = output.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<BuildSummary> {
        // Check roots before truncating whatever is at `output`.
        differ::require_dir(&old_root)?;
        differ::require_dir(&new_root)?;
        let file = File::create(&output).at(&output)?;
        let (writer, outcome) =
            build_patch_into(&old_root, &new_root, &options, &Bsdiff, BufWriter::new(file))?;
        let file = writer.into_inner().map_err(|e| PatchError::Io {
            path: output.clone(),
            source: e.into_error(),
        })?;
        file.sync_all().at(&output)?;
        let archive_bytes = file.metadata().at(&output)?.len();

        info!(
            "Expected result size: {} bytes, archive size: {archive_bytes} bytes",
            outcome.total_bytes
        );
        Ok(BuildSummary {
            files_patched: outcome.patched,
            files_added: outcome.added,
            files_removed: outcome.removed,
            total_bytes: outcome.total_bytes,
            archive_bytes,
        })
    })
    .await
    .map_err(|e| PatchError::Worker(e.to_string()))?
}

async fn apply_from<R>(
    mut archive: ArchiveReader<R>,
    target_root: &Path,
    options: &ApplyOptions,
    observer: Arc<dyn ApplyObserver>,
) -> Result<ApplyReport>
where
    R: Read + Seek + Send + 'static,
{
    let manifest = archive.manifest()?;
    info!("Loaded patch manifest with {} operations", manifest.len());
    PatchApplier::new(Arc::new(Bsdiff), observer)
        .apply(&manifest, archive, target_root, options)
        .await
}

/// Apply an in-memory archive to `target_root`.
pub async fn apply_patch(
    archive_bytes: Vec<u8>,
    target_root: &Path,
    options: &ApplyOptions,
    observer: Arc<dyn ApplyObserver>,
) -> Result<ApplyReport> {
    let archive = ArchiveReader::open(Cursor::new(archive_bytes))?;
    apply_from(archive, target_root, options, observer).await
}

/// Apply the archive stored at `patch_path` to `target_root`.
pub async fn apply_patch_file(
    patch_path: &Path,
    target_root: &Path,
    options: &ApplyOptions,
    observer: Arc<dyn ApplyObserver>,
) -> Result<ApplyReport> {
    let file = File::open(patch_path).at(patch_path)?;
    let archive = ArchiveReader::open(BufReader::new(file))?;
    apply_from(archive, target_root, options, observer).await
}

/// One line per operation: `<kind> <path>`.
pub fn describe_patch(archive_bytes: &[u8]) -> Result<String> {
    let mut archive = ArchiveReader::open(Cursor::new(archive_bytes))?;
    describe(&mut archive)
}

pub fn describe_patch_file(patch_path: &Path) -> Result<String> {
    let file = File::open(patch_path).at(patch_path)?;
    let mut archive = ArchiveReader::open(BufReader::new(file))?;
    describe(&mut archive)
}

/// The manifest exactly as stored in the archive.
pub fn manifest_text_file(patch_path: &Path) -> Result<String> {
    let file = File::open(patch_path).at(patch_path)?;
    ArchiveReader::open(BufReader::new(file))?.manifest_text()
}

fn describe<R: Read + Seek>(archive: &mut ArchiveReader<R>) -> Result<String> {
    let manifest = archive.manifest()?;
    let lines: Vec<String> = manifest.operations.iter().map(|op| op.to_string()).collect();
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::LogObserver;
    use std::fs;

    #[test]
    fn test_describe_lists_operations() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(b.join("sub")).unwrap();
        fs::write(a.join("data.bin"), b"AAAA").unwrap();
        fs::write(b.join("data.bin"), b"AABB").unwrap();
        fs::write(b.join("sub/extra.txt"), b"hi").unwrap();

        let (bytes, total) = build_patch(&a, &b, &DiffOptions::default()).unwrap();
        assert!(total >= 2);
        assert_eq!(describe_patch(&bytes).unwrap(), "Patch data.bin\nAdd sub/extra.txt");
    }

    #[test]
    fn test_describe_rejects_garbage() {
        assert!(matches!(
            describe_patch(b"definitely not an archive"),
            Err(PatchError::ArchiveCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, patch) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("p.tpatch"));
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("data.bin"), b"AAAA").unwrap();
        fs::write(b.join("data.bin"), b"AABB").unwrap();

        let summary = build_patch_file(&a, &b, &DiffOptions::default(), &patch).await.unwrap();
        assert_eq!(summary.files_patched, 1);
        assert_eq!(summary.archive_bytes, fs::metadata(&patch).unwrap().len());

        let report = apply_patch_file(&patch, &a, &ApplyOptions::default(), Arc::new(LogObserver))
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(fs::read(a.join("data.bin")).unwrap(), b"AABB");
        assert!(manifest_text_file(&patch).unwrap().contains("\"action\": \"Patch\""));
    }
}
