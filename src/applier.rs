//! Applies a loaded manifest to an installed tree.
//!
//! Payloads are first extracted one at a time into a private staging
//! directory, then a fixed pool of workers pulls operations off a queue and
//! runs each one to completion. Outcomes flow back over a channel to a single
//! collector, which drives the error callback and tallies the report.

use log::{debug, error, info, warn};
use std::io::{BufWriter, Read, Seek, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::archive::ArchiveReader;
use crate::cancel::CancelToken;
use crate::delta::{Bsdiff, DeltaCodec};
use crate::error::{IoResultExt, OperationFailure, OperationStage, PatchError, Result};
use crate::hasher::{digest_of_async, Digest};
use crate::patch_format::{PatchManifest, PatchOperation, BACKUP_SUFFIX, DELTA_SUFFIX};
use crate::util::{self, copy_file, copy_stream, ensure_parent, join_rel};

/// Suffix for files being written; renamed over the final name once complete.
const PARTIAL_SUFFIX: &str = ".partial";

/// Receives progress lines and per-operation failures during an apply.
pub trait ApplyObserver: Send + Sync {
    fn on_log(&self, message: &str) {
        let _ = message;
    }

    fn on_error(&self, failure: &OperationFailure) {
        let _ = failure;
    }
}

/// Forwards everything to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ApplyObserver for LogObserver {
    fn on_log(&self, message: &str) {
        info!("{message}");
    }

    fn on_error(&self, failure: &OperationFailure) {
        error!("{failure}");
    }
}

/// Adapts a pair of closures into an [`ApplyObserver`].
pub struct FnObserver<L, E> {
    on_log: L,
    on_error: E,
}

impl<L, E> FnObserver<L, E>
where
    L: Fn(&str) + Send + Sync,
    E: Fn(&OperationFailure) + Send + Sync,
{
    pub fn new(on_log: L, on_error: E) -> Self {
        Self { on_log, on_error }
    }
}

impl<L, E> ApplyObserver for FnObserver<L, E>
where
    L: Fn(&str) + Send + Sync,
    E: Fn(&OperationFailure) + Send + Sync,
{
    fn on_log(&self, message: &str) {
        (self.on_log)(message)
    }

    fn on_error(&self, failure: &OperationFailure) {
        (self.on_error)(failure)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Tree the pre-images are read from. Defaults to the target (in-place apply).
    pub source_root: Option<PathBuf>,
    /// Requested worker count; clamped to `[2, available parallelism]`.
    pub workers: Option<usize>,
    /// Where the staging directory is created. Defaults to the system temp dir.
    pub staging_parent: Option<PathBuf>,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// At least two workers, never more than the host can run in parallel unless
/// the host has a single core.
pub fn worker_count(requested: Option<usize>) -> usize {
    let hw = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    requested.unwrap_or(hw).min(hw).max(2)
}

pub struct PatchApplier {
    codec: Arc<dyn DeltaCodec>,
    observer: Arc<dyn ApplyObserver>,
}

impl Default for PatchApplier {
    fn default() -> Self {
        Self::new(Arc::new(Bsdiff), Arc::new(LogObserver))
    }
}

impl PatchApplier {
    pub fn new(codec: Arc<dyn DeltaCodec>, observer: Arc<dyn ApplyObserver>) -> Self {
        Self { codec, observer }
    }

    /// Apply every operation in `manifest` to `target_root`.
    ///
    /// Root-level problems (missing directories, a malformed manifest, staging
    /// setup) fail the whole call. Anything that goes wrong with a single
    /// operation is reported through the observer and counted in the report;
    /// sibling operations keep running.
    pub async fn apply<R>(
        &self,
        manifest: &PatchManifest,
        archive: ArchiveReader<R>,
        target_root: &Path,
        options: &ApplyOptions,
    ) -> Result<ApplyReport>
    where
        R: Read + Seek + Send + 'static,
    {
        let source_root = options.source_root.as_deref().unwrap_or(target_root);
        for root in [target_root, source_root] {
            if !root.is_dir() {
                return Err(PatchError::DirectoryNotFound(root.to_path_buf()));
            }
        }
        manifest.validate()?;

        let target_root = tokio::fs::canonicalize(target_root).await.at(target_root)?;
        let source_root = tokio::fs::canonicalize(source_root).await.at(source_root)?;
        let in_place = target_root == source_root;

        let staging_parent = options
            .staging_parent
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let staging = tempfile::Builder::new()
            .prefix("treepatch-staging-")
            .tempdir_in(&staging_parent)
            .at(&staging_parent)?;

        let mut report = ApplyReport::default();

        // Phase 1: sequential extraction, sole owner of the archive reader.
        let extraction = {
            let operations = manifest.operations.clone();
            let staging_path = staging.path().to_path_buf();
            let cancel = options.cancel.clone();
            tokio::task::spawn_blocking(move || {
                extract_payloads(archive, operations, &staging_path, &cancel)
            })
            .await
            .map_err(|e| PatchError::Worker(e.to_string()))?
        };
        for failure in &extraction.failed {
            self.observer.on_error(failure);
        }
        report.failed += extraction.failed.len();
        report.cancelled += extraction.cancelled;

        // Phase 2: bounded parallel apply.
        let ctx = Arc::new(OpContext {
            codec: Arc::clone(&self.codec),
            observer: Arc::clone(&self.observer),
            target_root,
            source_root,
            staging: staging.path().to_path_buf(),
            in_place,
            cancel: options.cancel.clone(),
        });
        let workers = worker_count(options.workers);
        debug!("Applying {} operations with {workers} workers", extraction.ready.len());

        let (job_tx, job_rx) = mpsc::channel::<PatchOperation>(workers);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<Outcome>();

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(worker(Arc::clone(&ctx), Arc::clone(&job_rx), outcome_tx.clone()));
        }
        drop(outcome_tx);
        drop(job_rx);

        let dispatched = extraction.ready.len();
        let ready = extraction.ready;
        let feed = async move {
            for op in ready {
                if job_tx.send(op).await.is_err() {
                    break;
                }
            }
        };
        let collect = async {
            let mut tally = ApplyReport::default();
            let mut received = 0usize;
            while let Some(outcome) = outcome_rx.recv().await {
                received += 1;
                match outcome.result {
                    Ok(()) => tally.applied += 1,
                    Err(PatchError::Cancelled) => {
                        tally.cancelled += 1;
                        self.observer
                            .on_log(&format!("Cancelled {}", outcome.op.file_name()));
                    }
                    Err(error) => {
                        tally.failed += 1;
                        self.observer.on_error(&OperationFailure {
                            file: outcome.op.file_name().to_string(),
                            stage: outcome.stage,
                            error,
                        });
                    }
                }
            }
            (tally, received)
        };
        let ((), (tally, received)) = tokio::join!(feed, collect);

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("apply worker stopped unexpectedly: {e}");
            }
        }

        report.applied += tally.applied;
        report.failed += tally.failed + dispatched.saturating_sub(received);
        report.cancelled += tally.cancelled;

        if let Err(e) = staging.close() {
            warn!("Failed to remove staging directory: {e}");
        }

        info!(
            "Patch finished: {} applied, {} failed, {} cancelled",
            report.applied, report.failed, report.cancelled
        );
        Ok(report)
    }
}

struct Extraction {
    ready: Vec<PatchOperation>,
    failed: Vec<OperationFailure>,
    cancelled: usize,
}

/// Copy each payload into `staging` under its archive key. Operations whose
/// payload cannot be extracted are failed here and never dispatched.
fn extract_payloads<R: Read + Seek>(
    mut archive: ArchiveReader<R>,
    operations: Vec<PatchOperation>,
    staging: &Path,
    cancel: &CancelToken,
) -> Extraction {
    let mut extraction = Extraction {
        ready: Vec::with_capacity(operations.len()),
        failed: Vec::new(),
        cancelled: 0,
    };

    let total = operations.len();
    for (index, op) in operations.into_iter().enumerate() {
        if cancel.is_cancelled() {
            extraction.cancelled = total - index;
            break;
        }
        let Some(key) = op.archive_key() else {
            extraction.ready.push(op);
            continue;
        };

        match extract_one(&mut archive, &key, staging) {
            Ok(bytes) => {
                debug!("Extracted {key} ({bytes} bytes)");
                extraction.ready.push(op);
            }
            Err(error) => extraction.failed.push(OperationFailure {
                file: op.file_name().to_string(),
                stage: OperationStage::Pending,
                error,
            }),
        }
    }

    extraction
}

fn extract_one<R: Read + Seek>(archive: &mut ArchiveReader<R>, key: &str, staging: &Path) -> Result<u64> {
    if !archive.contains(key) {
        return Err(PatchError::MissingArchiveEntry(key.to_string()));
    }
    let out_path = join_rel(staging, key);
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    let file = std::fs::File::create(&out_path).at(&out_path)?;
    let mut writer = BufWriter::new(file);
    let bytes = archive.extract_to(key, &mut writer)?;
    writer.flush().at(&out_path)?;
    Ok(bytes)
}

struct Outcome {
    op: PatchOperation,
    stage: OperationStage,
    result: Result<()>,
}

async fn worker(
    ctx: Arc<OpContext>,
    jobs: Arc<Mutex<mpsc::Receiver<PatchOperation>>>,
    outcomes: mpsc::UnboundedSender<Outcome>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(op) = next else {
            break;
        };
        let outcome = ctx.run(op).await;
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}

/// Everything a worker needs; shared read-only across the pool.
struct OpContext {
    codec: Arc<dyn DeltaCodec>,
    observer: Arc<dyn ApplyObserver>,
    target_root: PathBuf,
    source_root: PathBuf,
    staging: PathBuf,
    in_place: bool,
    cancel: CancelToken,
}

impl OpContext {
    fn log(&self, message: String) {
        self.observer.on_log(&message);
    }

    async fn run(&self, op: PatchOperation) -> Outcome {
        let mut stage = OperationStage::Pending;
        let result = self.execute(&op, &mut stage).await;
        if result.is_ok() {
            stage = OperationStage::Done;
            debug!("{}: {stage}", op.file_name());
        }
        Outcome { op, stage, result }
    }

    async fn execute(&self, op: &PatchOperation, stage: &mut OperationStage) -> Result<()> {
        self.cancel.check()?;
        match op {
            PatchOperation::Patch {
                file_name,
                original_hash,
                final_hash,
            } => {
                self.patch(file_name, *original_hash, *final_hash, stage)
                    .await
            }
            PatchOperation::Add {
                file_name,
                final_hash,
            } => self.add(file_name, *final_hash, stage).await,
            PatchOperation::Remove { file_name } => self.remove(file_name).await,
        }
    }

    async fn patch(
        &self,
        name: &str,
        original_hash: Digest,
        final_hash: Digest,
        stage: &mut OperationStage,
    ) -> Result<()> {
        let target = join_rel(&self.target_root, name);
        let backup = with_suffix(&target, BACKUP_SUFFIX);
        ensure_parent(&target).await?;

        let reuse = self.in_place && tokio::fs::try_exists(&backup).await.at(&backup)?;
        if reuse {
            self.log(format!("Reusing unpatched original file for {name}"));
        } else {
            let source = join_rel(&self.source_root, name);
            if !tokio::fs::try_exists(&source).await.at(&source)? {
                return Err(PatchError::SourceFileMissing(name.to_string()));
            }
            self.log(format!("Creating unpatched original file for {name}"));
            let partial = with_suffix(&backup, PARTIAL_SUFFIX);
            if let Err(e) = copy_file(&source, &partial, Some(&self.cancel)).await {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
            tokio::fs::rename(&partial, &backup).await.at(&backup)?;
        }
        *stage = OperationStage::BackedUp;
        debug!("{name}: {stage}");

        let mut backup_file = File::open(&backup).await.at(&backup)?;
        let actual = digest_of_async(&mut backup_file, Some(&self.cancel)).await?;
        drop(backup_file);
        if actual != original_hash {
            // Discard only a backup taken by this run.
            if !reuse {
                let _ = tokio::fs::remove_file(&backup).await;
            }
            return Err(PatchError::PreImageMismatch {
                file: name.to_string(),
                expected: original_hash,
                actual,
            });
        }
        *stage = OperationStage::PreVerified;
        debug!("{name}: {stage}");

        // From here on the write runs to completion even if cancellation is requested.
        self.log(format!("Applying binary patch to {name}"));
        let delta = join_rel(&self.staging, &format!("{name}{DELTA_SUFFIX}"));
        let codec = Arc::clone(&self.codec);
        let file = name.to_string();
        let written = target.clone();
        tokio::task::spawn_blocking(move || write_patched(codec.as_ref(), &backup, &delta, &written, &file))
            .await
            .map_err(|e| PatchError::Worker(e.to_string()))??;
        *stage = OperationStage::Transformed;
        debug!("{name}: {stage}");

        let mut target_file = File::open(&target).await.at(&target)?;
        let actual = digest_of_async(&mut target_file, None).await?;
        if actual != final_hash {
            return Err(PatchError::PostImageMismatch {
                file: name.to_string(),
                expected: final_hash,
                actual,
            });
        }
        *stage = OperationStage::PostVerified;
        Ok(())
    }

    async fn add(&self, name: &str, final_hash: Digest, stage: &mut OperationStage) -> Result<()> {
        let target = join_rel(&self.target_root, name);
        ensure_parent(&target).await?;
        self.log(format!("Copying {name} from patch"));

        let staged = join_rel(&self.staging, name);
        let mut payload = File::open(&staged).await.at(&staged)?;
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)
            .await
            .at(&target)?;
        copy_stream(&mut payload, &mut out, None).await?;
        *stage = OperationStage::Transformed;

        let actual = digest_of_async(&mut out, None).await?;
        if actual != final_hash {
            return Err(PatchError::PostImageMismatch {
                file: name.to_string(),
                expected: final_hash,
                actual,
            });
        }
        *stage = OperationStage::PostVerified;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let target = join_rel(&self.target_root, name);
        self.log(format!("Deleting {name}"));
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).at(&target),
        }
    }
}

/// Reconstruct `target` from `backup` and the staged delta. The installed file
/// is only replaced once the codec has produced the complete output.
fn write_patched(codec: &dyn DeltaCodec, backup: &Path, delta: &Path, target: &Path, file: &str) -> Result<()> {
    let old = util::mmap_file(backup)?;
    let delta = std::fs::read(delta).at(delta)?;
    let partial = with_suffix(target, PARTIAL_SUFFIX);

    let written = (|| {
        let out = std::fs::File::create(&partial).at(&partial)?;
        let mut writer = BufWriter::new(out);
        codec
            .apply(&old, &delta, &mut writer)
            .map_err(|source| PatchError::Delta {
                file: file.to_string(),
                source,
            })?;
        writer.flush().at(&partial)
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }

    std::fs::rename(&partial, target).at(target)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
