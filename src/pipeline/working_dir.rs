//! Per-batch scratch directories and lock files.
//!
//! Everything a batch writes lives under `<working_dir>/batch_NN/`, and a
//! finished batch is marked by `<working_dir>/batch_NN.lock`. The lock sits
//! beside the scratch directory, so wiping the directory never removes it.

use std::{fs, io};

use crate::{errors::WorkingDirectoryGuardError, prelude::*};

/// Prefix of every directory we are willing to delete.
const BATCH_DIR_PREFIX: &str = "batch_";

/// The scratch directory name for a batch.
pub fn batch_dir_name(batch_id: u32) -> String {
    format!("{BATCH_DIR_PREFIX}{batch_id:02}")
}

/// Where the lock file for `batch_id` lives.
pub fn lock_path(scratch_root: &Path, batch_id: u32) -> PathBuf {
    scratch_root.join(format!("{}.lock", batch_dir_name(batch_id)))
}

/// Has this batch already been processed?
pub fn is_locked(scratch_root: &Path, batch_id: u32) -> bool {
    lock_path(scratch_root, batch_id).exists()
}

/// Mark a batch as fully processed with a zero-byte lock file.
pub fn create_lock(scratch_root: &Path, batch_id: u32) -> Result<PathBuf> {
    let path = lock_path(scratch_root, batch_id);
    fs::File::create(&path).with_context(|| format!("cannot create lock file {:?}", path))?;
    Ok(path)
}

/// Refuse to touch `path` unless it's a `batch_` directory directly inside
/// `scratch_root`.
pub fn check_batch_dir(path: &Path, scratch_root: &Path) -> Result<(), WorkingDirectoryGuardError> {
    let named_like_batch = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(BATCH_DIR_PREFIX));
    if named_like_batch && path.parent() == Some(scratch_root) {
        Ok(())
    } else {
        Err(WorkingDirectoryGuardError {
            path: path.to_owned(),
            scratch_root: scratch_root.to_owned(),
        })
    }
}

/// The directory tree for one attempt at one batch.
#[derive(Clone, Debug)]
pub struct WorkingDir {
    /// `<working_dir>/batch_NN`.
    pub batch_dir: PathBuf,
    /// Page images straight from the rasterizer.
    pub image_raw_dir: PathBuf,
    /// Cleaned page images, which are what we OCR.
    pub image_processed_dir: PathBuf,
    /// Chunk manifests.
    pub chunk_dir: PathBuf,
    /// Raw engine output.
    pub tsv_dir: PathBuf,
    /// Per-document merged tables.
    pub output_dir: PathBuf,
}

impl WorkingDir {
    /// The layout for `batch_id`, without touching the filesystem.
    pub fn for_batch(scratch_root: &Path, batch_id: u32) -> Self {
        let batch_dir = scratch_root.join(batch_dir_name(batch_id));
        Self {
            image_raw_dir: batch_dir.join("images").join("raw"),
            image_processed_dir: batch_dir.join("images").join("processed"),
            chunk_dir: batch_dir.join("chunks"),
            tsv_dir: batch_dir.join("tsv"),
            output_dir: batch_dir.join("output"),
            batch_dir,
        }
    }

    /// Delete anything left by an earlier attempt and create a fresh tree.
    #[instrument(level = "debug", skip(scratch_root))]
    pub fn create(scratch_root: &Path, batch_id: u32) -> Result<Self> {
        fs::create_dir_all(scratch_root)
            .with_context(|| format!("cannot create working directory {:?}", scratch_root))?;
        let dirs = Self::for_batch(scratch_root, batch_id);
        check_batch_dir(&dirs.batch_dir, scratch_root)?;

        match fs::remove_dir_all(&dirs.batch_dir) {
            Ok(()) => debug!(path = %dirs.batch_dir.display(), "Cleared old scratch directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("cannot clear scratch directory {:?}", dirs.batch_dir)
                });
            }
        }
        for dir in [
            &dirs.image_raw_dir,
            &dirs.image_processed_dir,
            &dirs.chunk_dir,
            &dirs.tsv_dir,
            &dirs.output_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create directory {:?}", dir))?;
        }
        Ok(dirs)
    }
}
