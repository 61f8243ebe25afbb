use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use treepatch::patch::{describe_patch_file, manifest_text_file};
use treepatch::{
    apply_patch_file, build_patch_file, ApplyOptions, CancelToken, DiffOptions, IgnoreSet, LogObserver,
};

#[derive(Parser)]
#[command(name = "treepatch", about = "Hash-verified binary patch builder and applier for directory trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing an original and a desired directory
    Create {
        /// Path to the original (baseline) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the desired (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch archive
        #[arg(long, short)]
        output: PathBuf,
        /// Directory (relative to the tree root) to leave out entirely; repeatable
        #[arg(long = "ignore-dir")]
        ignore_dirs: Vec<String>,
        /// File (relative to the tree root) to leave out; repeatable
        #[arg(long = "ignore-file")]
        ignore_files: Vec<String>,
        /// JSON file with `directories` and `files` arrays to ignore
        #[arg(long)]
        ignore_list: Option<PathBuf>,
        /// Also remove files that exist only in the original directory
        #[arg(long)]
        prune: bool,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch archive
        #[arg(long, short)]
        patch: PathBuf,
        /// Read original files from this directory instead of the target
        #[arg(long)]
        source: Option<PathBuf>,
        /// Number of parallel workers (at least 2, at most the CPU count)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// List the operations in a patch archive
    Describe {
        /// Path to the patch archive
        #[arg(long, short)]
        patch: PathBuf,
        /// Print the raw manifest instead of one line per operation
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            ignore_dirs,
            ignore_files,
            ignore_list,
            prune,
        } => {
            let mut ignore = IgnoreSet::new();
            if let Some(list) = &ignore_list {
                ignore
                    .load(list)
                    .with_context(|| format!("Failed to load ignore list: {}", list.display()))?;
            }
            for dir in &ignore_dirs {
                ignore.add_dir(dir);
            }
            for file in &ignore_files {
                ignore.add_file(file);
            }

            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let options = DiffOptions { ignore, prune };
            let summary = build_patch_file(&old, &new, &options, &output)
                .await
                .context("Failed to create patch")?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Files patched: {}", summary.files_patched);
            println!("  Files added: {}", summary.files_added);
            println!("  Files removed: {}", summary.files_removed);
            println!("  Payload bytes: {}", summary.total_bytes);
            println!("  Archive bytes: {}", summary.archive_bytes);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            source,
            workers,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());
            if let Some(source) = &source {
                println!("  Source: {}", source.display());
            }

            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupted, finishing in-flight files");
                    on_interrupt.cancel();
                }
            });

            let options = ApplyOptions {
                source_root: source,
                workers,
                staging_parent: None,
                cancel,
            };

            let start = Instant::now();
            let report = apply_patch_file(&patch, &target, &options, Arc::new(LogObserver))
                .await
                .context("Failed to apply patch")?;
            let elapsed = start.elapsed();

            println!("\nFiles applied: {}", report.applied);
            println!("Files failed: {}", report.failed);
            println!("Files cancelled: {}", report.cancelled);
            println!("Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if report.failed > 0 {
                bail!("{} file(s) could not be patched", report.failed);
            }
            if report.cancelled > 0 {
                bail!("Patch interrupted; {} file(s) were not processed", report.cancelled);
            }
            println!("Patch applied successfully!");
        }
        Commands::Describe { patch, json } => {
            let text = if json {
                manifest_text_file(&patch)
            } else {
                describe_patch_file(&patch)
            }
            .with_context(|| format!("Failed to read patch: {}", patch.display()))?;
            println!("{text}");
        }
    }

    Ok(())
}
