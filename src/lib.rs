//! Hash-verified binary-delta patching for large, mostly static directory trees.
//!
//! A patch is built by diffing a baseline tree against a target tree
//! ([`patch::build_patch`]) and applied to an installed copy of the baseline
//! ([`patch::apply_patch`]). Every patched file is checked against the
//! expected pre-image before it is touched and against the expected
//! post-image afterwards; the pre-image is kept beside it as
//! `<file>.unpatched` so the same patch can be applied again.

pub mod applier;
pub mod archive;
pub mod cancel;
pub mod delta;
pub mod differ;
pub mod error;
pub mod hasher;
pub mod ignore;
pub mod patch;
pub mod patch_format;
pub mod util;

pub use applier::{ApplyObserver, ApplyOptions, ApplyReport, FnObserver, LogObserver, PatchApplier};
pub use cancel::CancelToken;
pub use delta::{Bsdiff, DeltaCodec};
pub use differ::DiffOptions;
pub use error::{OperationFailure, OperationStage, PatchError};
pub use hasher::Digest;
pub use ignore::IgnoreSet;
pub use patch::{apply_patch, apply_patch_file, build_patch, build_patch_file, describe_patch, BuildSummary};
pub use patch_format::{PatchManifest, PatchOperation};
