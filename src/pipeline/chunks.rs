//! Splitting a batch's page images into balanced chunks, one per OCR process.

use std::{fmt::Write as _, fs};

use crate::prelude::*;

/// A contiguous slice of a batch's sorted page images, OCRed by one process.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Position of this chunk in the batch, from 0.
    pub chunk_id: usize,
    /// Absolute image paths, sorted.
    pub files: Vec<PathBuf>,
    /// The text file listing `files`, one per line, that the engine reads.
    pub manifest_path: PathBuf,
    /// The engine writes `<output_prefix>.tsv` (and maybe `.pdf`).
    pub output_prefix: PathBuf,
}

impl Chunk {
    /// The engine's tab-separated output table.
    pub fn tsv_path(&self) -> PathBuf {
        let mut path = self.output_prefix.clone().into_os_string();
        path.push(".tsv");
        PathBuf::from(path)
    }
}

/// Chunks are identified by their id and contents. Where their files live on
/// disk doesn't matter.
impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.chunk_id == other.chunk_id && self.files == other.files
    }
}

impl Eq for Chunk {}

/// Split `items` into `min(parts, items.len())` contiguous slices whose
/// lengths differ by at most one. Earlier slices get the extra items.
/// `parts == 0` is treated as 1.
pub fn split_balanced<T>(items: &[T], parts: usize) -> Vec<&[T]> {
    let parts = parts.max(1).min(items.len());
    if parts == 0 {
        return vec![];
    }
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut slices = Vec::with_capacity(parts);
    let mut start = 0;
    for idx in 0..parts {
        let len = base + usize::from(idx < extra);
        slices.push(&items[start..start + len]);
        start += len;
    }
    slices
}

/// Plan the chunks for `files` without writing anything. Each image is OCRed
/// once, even if it is listed twice.
pub fn plan_chunks(
    mut files: Vec<PathBuf>,
    worker_count: usize,
    chunk_dir: &Path,
    output_dir: &Path,
) -> Vec<Chunk> {
    files.sort();
    files.dedup();
    split_balanced(&files, worker_count)
        .into_iter()
        .enumerate()
        .map(|(chunk_id, slice)| Chunk {
            chunk_id,
            files: slice.to_vec(),
            manifest_path: chunk_dir.join(format!("tesseract_chunk-{chunk_id}.txt")),
            output_prefix: output_dir.join(format!("tesseract_chunk-{chunk_id}")),
        })
        .collect()
}

/// Plan the chunks for `files` and write each chunk's manifest.
#[instrument(level = "debug", skip_all, fields(files = files.len(), worker_count = worker_count))]
pub fn partition(
    files: Vec<PathBuf>,
    worker_count: usize,
    chunk_dir: &Path,
    output_dir: &Path,
) -> Result<Vec<Chunk>> {
    let chunks = plan_chunks(files, worker_count, chunk_dir, output_dir);
    for chunk in &chunks {
        write_manifest(chunk)?;
        debug!(
            chunk_id = chunk.chunk_id,
            files = chunk.files.len(),
            "Wrote chunk manifest"
        );
    }
    Ok(chunks)
}

fn write_manifest(chunk: &Chunk) -> Result<()> {
    let mut text = String::new();
    for file in &chunk.files {
        let line = file
            .to_str()
            .ok_or_else(|| anyhow!("image path is not valid UTF-8: {:?}", file))?;
        writeln!(text, "{line}")?;
    }
    fs::write(&chunk.manifest_path, text)
        .with_context(|| format!("cannot write chunk manifest {:?}", chunk.manifest_path))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|name| PathBuf::from(format!("/img/{name}"))).collect()
    }

    #[test]
    fn three_images_over_two_workers() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("chunks")?;
        let chunks = partition(
            paths(&["c_0001.tif", "a_0001.tif", "b_0001.tif"]),
            2,
            dir.path(),
            Path::new("/tsv"),
        )?;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].files, paths(&["a_0001.tif", "b_0001.tif"]));
        assert_eq!(chunks[1].files, paths(&["c_0001.tif"]));
        assert_eq!(
            fs::read_to_string(dir.path().join("tesseract_chunk-0.txt"))?,
            "/img/a_0001.tif\n/img/b_0001.tif\n"
        );
        assert_eq!(
            chunks[1].tsv_path(),
            PathBuf::from("/tsv/tesseract_chunk-1.tsv")
        );
        Ok(())
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(plan_chunks(vec![], 4, Path::new("/c"), Path::new("/t")).is_empty());
    }

    #[test]
    fn zero_workers_means_one_chunk() {
        let chunks = plan_chunks(paths(&["a", "b"]), 0, Path::new("/c"), Path::new("/t"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].files.len(), 2);
    }

    #[test]
    fn repeated_images_land_in_one_chunk() {
        let chunks = plan_chunks(
            paths(&["b", "a", "b", "c"]),
            3,
            Path::new("/c"),
            Path::new("/t"),
        );
        let files = chunks.iter().flat_map(|c| c.files.clone()).collect::<Vec<_>>();
        assert_eq!(files, paths(&["a", "b", "c"]));
    }

    #[test]
    fn equality_ignores_locations() {
        let a = plan_chunks(paths(&["a"]), 1, Path::new("/c1"), Path::new("/t1"));
        let b = plan_chunks(paths(&["a"]), 1, Path::new("/c2"), Path::new("/t2"));
        assert_eq!(a, b);
    }

    proptest! {
        /// Chunks cover every file exactly once, in sorted order, with
        /// sizes that differ by at most one.
        #[test]
        fn chunks_partition_the_sorted_files(
            names in prop::collection::btree_set("[a-z]{1,6}_[0-9]{4}", 0..40),
            workers in 0usize..12,
        ) {
            let mut files = names.iter().map(PathBuf::from).collect::<Vec<_>>();
            files.reverse();
            let chunks = plan_chunks(files, workers, Path::new("/c"), Path::new("/t"));

            let expected_count = workers.max(1).min(names.len());
            prop_assert_eq!(chunks.len(), expected_count);

            let flattened = chunks.iter().flat_map(|c| c.files.clone()).collect::<Vec<_>>();
            let sorted = names.iter().map(PathBuf::from).collect::<Vec<_>>();
            prop_assert_eq!(flattened, sorted);

            if let (Some(max), Some(min)) = (
                chunks.iter().map(|c| c.files.len()).max(),
                chunks.iter().map(|c| c.files.len()).min(),
            ) {
                prop_assert!(max - min <= 1);
                prop_assert!(min > 0);
            }

            let ids = chunks.iter().map(|c| c.chunk_id).collect::<BTreeSet<_>>();
            prop_assert_eq!(ids, (0..expected_count).collect::<BTreeSet<_>>());
        }

        /// Bigger chunks always come first.
        #[test]
        fn extra_items_go_to_the_first_slices(len in 0usize..100, parts in 1usize..20) {
            let items = (0..len).collect::<Vec<_>>();
            let sizes = split_balanced(&items, parts).iter().map(|s| s.len()).collect::<Vec<_>>();
            prop_assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
            prop_assert_eq!(sizes.iter().sum::<usize>(), len);
        }
    }
}
