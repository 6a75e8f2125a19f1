//! Errors that callers need to tell apart.
//!
//! Most of this crate reports failures with [`anyhow::Error`]. The types here
//! are the exceptions: they mark conditions that change how a run proceeds,
//! so they can be recovered with [`anyhow::Error::downcast_ref`].

use std::path::PathBuf;

/// The allocation manifest is missing one or more required columns.
///
/// Fatal for the whole run, and raised before any batch starts.
#[derive(Debug, thiserror::Error)]
#[error("manifest {path:?} is missing required columns: {}", missing.join(", "))]
pub struct ManifestFormatError {
    /// The manifest we tried to read.
    pub path: PathBuf,
    /// The required column names that were absent.
    pub missing: Vec<String>,
}

/// The output of one chunk could not be merged back into document tables.
///
/// Fatal for the batch, which will be retried on the next run.
#[derive(Debug, thiserror::Error)]
#[error("cannot merge OCR output for chunk {chunk_id} ({path:?}): {reason}")]
pub struct MergeError {
    /// The chunk whose output was unusable.
    pub chunk_id: usize,
    /// The file we were reading.
    pub path: PathBuf,
    /// What was wrong with it.
    pub reason: String,
}

/// We refused to delete a directory that doesn't look like one of ours.
#[derive(Debug, thiserror::Error)]
#[error(
    "refusing to clear {path:?}: expected a `batch_` directory directly inside {scratch_root:?}"
)]
pub struct WorkingDirectoryGuardError {
    /// The path we were asked to clear.
    pub path: PathBuf,
    /// The configured scratch root.
    pub scratch_root: PathBuf,
}

/// Some of a batch's documents could not be turned into page images.
///
/// Fatal for the batch, which is left unlocked so the next run retries it.
/// Output for the documents that did work may already have been written.
#[derive(Debug, thiserror::Error)]
#[error(
    "{failed} of {documents} documents in batch {batch_id} could not be prepared, see failed_documents.csv"
)]
pub struct DocumentPreparationError {
    pub batch_id: u32,
    /// Documents listed in the failed-document report.
    pub failed: usize,
    /// Documents we tried to prepare.
    pub documents: usize,
}
