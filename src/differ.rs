use log::{debug, info};
use std::collections::HashSet;
use std::io::{BufReader, Write};
use std::path::Path;

use crate::archive::ArchiveWriter;
use crate::delta::DeltaCodec;
use crate::error::{IoResultExt, PatchError, Result};
use crate::hasher::{self, digest_bytes};
use crate::ignore::IgnoreSet;
use crate::patch_format::{check_relative_path, PatchManifest, PatchOperation, MANIFEST_ENTRY};
use crate::util::{self, join_rel};

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub ignore: IgnoreSet,
    /// Also emit `Remove` for files that exist only in the original tree.
    pub prune: bool,
}

#[derive(Debug)]
pub struct DiffOutcome {
    pub manifest: PatchManifest,
    /// Uncompressed size of every payload stored. Informational only.
    pub total_bytes: u64,
    pub patched: usize,
    pub added: usize,
    pub removed: usize,
}

pub fn require_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(PatchError::DirectoryNotFound(path.to_path_buf()))
    }
}

/// Compare `original_root` against `desired_root`, storing payloads in `archive`
/// as it goes. Operations come out in walk order of the desired tree, followed
/// by removals when `options.prune` is set.
///
/// The manifest is returned rather than written so the caller decides when to
/// seal the archive with [`ArchiveWriter::finish`].
pub fn diff_trees<W: Write>(
    original_root: &Path,
    desired_root: &Path,
    options: &DiffOptions,
    codec: &dyn DeltaCodec,
    archive: &mut ArchiveWriter<W>,
) -> Result<DiffOutcome> {
    require_dir(original_root)?;
    require_dir(desired_root)?;

    let mut outcome = DiffOutcome {
        manifest: PatchManifest::default(),
        total_bytes: 0,
        patched: 0,
        added: 0,
        removed: 0,
    };

    let desired = util::walk_files(desired_root, &options.ignore)?;
    // Archive keys handed out so far. `x.bsdiff` and a changed `x` would share one.
    let mut keys: HashSet<String> = HashSet::new();

    for file in &desired {
        let rel = file.relative_path.as_str();
        if rel == MANIFEST_ENTRY {
            return Err(PatchError::ReservedPath(rel.to_string()));
        }
        check_relative_path(rel)?;

        let counterpart = join_rel(original_root, rel);
        let original_len = std::fs::metadata(&counterpart)
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len());
        if let Some(original_len) = original_len {
            debug!("Checking {rel}");
            let old = util::mmap_file(&counterpart)?;
            let new = util::mmap_file(&file.full_path)?;
            if original_len == file.size && old[..] == new[..] {
                continue;
            }

            info!("{rel} differs, creating delta");
            let (delta, (original_hash, final_hash)) = rayon::join(
                || codec.create(&old, &new),
                || rayon::join(|| digest_bytes(&old), || digest_bytes(&new)),
            );
            let delta = delta.map_err(|source| PatchError::Delta {
                file: rel.to_string(),
                source,
            })?;

            let op = PatchOperation::Patch {
                file_name: rel.to_string(),
                original_hash,
                final_hash,
            };
            let key = op.archive_key().unwrap_or_default();
            if !keys.insert(key.clone()) {
                return Err(PatchError::ReservedPath(key));
            }
            outcome.total_bytes += archive.add_bytes(&key, &delta)?;
            debug!("{rel}: {original_hash} -> {final_hash}");
            outcome.manifest.push(op);
            outcome.patched += 1;
        } else {
            info!("{rel} is new, storing verbatim");
            if !keys.insert(rel.to_string()) {
                return Err(PatchError::ReservedPath(rel.to_string()));
            }
            let mut handle = std::fs::File::open(&file.full_path).at(&file.full_path)?;
            // Hash first; the position comes back to zero for the copy below.
            let final_hash = hasher::digest_of(&mut handle).at(&file.full_path)?;
            outcome.total_bytes += archive.add_entry(rel, BufReader::new(&mut handle))?;
            outcome.manifest.push(PatchOperation::Add {
                file_name: rel.to_string(),
                final_hash,
            });
            outcome.added += 1;
        }
    }

    if options.prune {
        let kept: HashSet<&str> = desired.iter().map(|f| f.relative_path.as_str()).collect();
        for file in util::walk_files(original_root, &options.ignore)? {
            if kept.contains(file.relative_path.as_str()) {
                continue;
            }
            info!("{} is gone, removing", file.relative_path);
            outcome.manifest.push(PatchOperation::Remove {
                file_name: file.relative_path,
            });
            outcome.removed += 1;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReader;
    use crate::delta::Bsdiff;
    use std::fs;
    use std::io::Cursor;

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, content) in files {
            let full = join_rel(root, rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    fn run(old: &Path, new: &Path, options: &DiffOptions) -> (DiffOutcome, Vec<u8>) {
        let mut archive = ArchiveWriter::new(Vec::new()).unwrap();
        let outcome = diff_trees(old, new, options, &Bsdiff, &mut archive).unwrap();
        let bytes = archive.finish(&outcome.manifest).unwrap();
        (outcome, bytes)
    }

    #[test]
    fn test_concrete_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        write_tree(&a, &[("data.bin", b"AAAA")]);
        write_tree(&b, &[("data.bin", b"AABB"), ("extra.txt", b"hi")]);

        let (outcome, bytes) = run(&a, &b, &DiffOptions::default());
        assert_eq!(
            outcome.manifest.operations,
            vec![
                PatchOperation::Patch {
                    file_name: "data.bin".into(),
                    original_hash: digest_bytes(b"AAAA"),
                    final_hash: digest_bytes(b"AABB"),
                },
                PatchOperation::Add {
                    file_name: "extra.txt".into(),
                    final_hash: digest_bytes(b"hi"),
                },
            ]
        );

        let mut reader = ArchiveReader::open(Cursor::new(bytes)).unwrap();
        assert!(reader.contains("data.bin.bsdiff"));
        assert_eq!(reader.read_entry("extra.txt").unwrap(), b"hi");
        assert_eq!(reader.manifest().unwrap(), outcome.manifest);
    }

    #[test]
    fn test_identical_files_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        let files: &[(&str, &[u8])] = &[("same.txt", b"Same content"), ("sub/also.txt", b"Also same")];
        write_tree(&a, files);
        write_tree(&b, files);

        let (outcome, _) = run(&a, &b, &DiffOptions::default());
        assert!(outcome.manifest.is_empty());
        assert_eq!(outcome.total_bytes, 0);
    }

    #[test]
    fn test_ignored_paths_never_appear() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        write_tree(&a, &[("game.log", b"old"), ("Data/Resources/r.bin", b"old")]);
        write_tree(
            &b,
            &[
                ("game.log", b"new"),
                ("Data/Resources/r.bin", b"new"),
                ("Data/Resources/added.bin", b"new"),
                ("kept.txt", b"new"),
            ],
        );

        let options = DiffOptions {
            ignore: IgnoreSet::new().with_file("game.log").with_dir("Data/Resources"),
            prune: false,
        };
        let (outcome, _) = run(&a, &b, &options);
        let names: Vec<_> = outcome.manifest.operations.iter().map(|op| op.file_name()).collect();
        assert_eq!(names, ["kept.txt"]);
    }

    #[test]
    fn test_prune_emits_removals() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        write_tree(&a, &[("keep.txt", b"k"), ("old/gone.txt", b"g"), ("skip.log", b"s")]);
        write_tree(&b, &[("keep.txt", b"k")]);

        let (outcome, _) = run(&a, &b, &DiffOptions::default());
        assert!(outcome.manifest.is_empty());

        let options = DiffOptions {
            ignore: IgnoreSet::new().with_file("skip.log"),
            prune: true,
        };
        let (outcome, _) = run(&a, &b, &options);
        assert_eq!(
            outcome.manifest.operations,
            vec![PatchOperation::Remove {
                file_name: "old/gone.txt".into()
            }]
        );
        assert_eq!(outcome.removed, 1);
    }

    #[test]
    fn test_total_bytes_counts_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        fs::create_dir_all(&a).unwrap();
        write_tree(&b, &[("one.bin", &[1u8; 300]), ("two.bin", &[2u8; 200])]);

        let (outcome, _) = run(&a, &b, &DiffOptions::default());
        assert_eq!(outcome.total_bytes, 500);
        assert_eq!(outcome.added, 2);
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = ArchiveWriter::new(Vec::new()).unwrap();
        let result = diff_trees(
            &dir.path().join("nope"),
            dir.path(),
            &DiffOptions::default(),
            &Bsdiff,
            &mut archive,
        );
        assert!(matches!(result, Err(PatchError::DirectoryNotFound(_))));
    }

    #[test]
    fn test_reserved_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        fs::create_dir_all(&a).unwrap();
        write_tree(&b, &[(MANIFEST_ENTRY, b"{}")]);

        let mut archive = ArchiveWriter::new(Vec::new()).unwrap();
        let result = diff_trees(&a, &b, &DiffOptions::default(), &Bsdiff, &mut archive);
        assert!(matches!(result, Err(PatchError::ReservedPath(_))));
    }

    #[test]
    fn test_delta_name_collision_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        write_tree(&a, &[("x", b"old")]);
        write_tree(&b, &[("x", b"new"), ("x.bsdiff", b"a file that happens to share the name")]);

        let mut archive = ArchiveWriter::new(Vec::new()).unwrap();
        let result = diff_trees(&a, &b, &DiffOptions::default(), &Bsdiff, &mut archive);
        match result {
            Err(PatchError::ReservedPath(name)) => assert_eq!(name, "x.bsdiff"),
            other => panic!("expected a naming collision, got {other:?}"),
        }
    }

    #[test]
    fn test_same_length_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        write_tree(&a, &[("same_len.bin", b"AAAA"), ("grown.bin", b"AAAA")]);
        write_tree(&b, &[("same_len.bin", b"AAAB"), ("grown.bin", b"AAAAA")]);

        let (outcome, _) = run(&a, &b, &DiffOptions::default());
        assert_eq!(outcome.patched, 2);
    }
}
