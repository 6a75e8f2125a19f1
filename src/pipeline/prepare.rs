//! Rasterizing and cleaning up a batch's documents before OCR.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fs,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::{StreamExt as _, stream};

use super::working_dir::WorkingDir;
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    cpu_limit::CpuLimit,
    images::{ImageCleaner, Rasterizer, document_basename},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// A document we couldn't turn into page images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct DocumentFailure {
    /// The document's path in the allocation manifest.
    pub path: String,
    /// What went wrong.
    pub error: String,
}

/// The column names of the failed-document report.
pub const FAILURE_COLUMNS: &[&str] = &["path", "error"];

/// The result of preparing a batch.
#[derive(Debug, Default)]
pub struct PreparedImages {
    /// Cleaned page images, sorted.
    pub images: Vec<PathBuf>,
    /// Documents that were skipped, sorted by path.
    pub failures: Vec<DocumentFailure>,
}

/// Turns PDFs into cleaned page images.
#[derive(Clone)]
pub struct ImagePreparer {
    rasterizer: Arc<dyn Rasterizer>,
    cleaner: Arc<dyn ImageCleaner>,
    cpu_limit: CpuLimit,
    ui: Ui,
    report_frequency: usize,
}

impl ImagePreparer {
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        cleaner: Arc<dyn ImageCleaner>,
        cpu_limit: CpuLimit,
        ui: Ui,
        report_frequency: usize,
    ) -> Self {
        Self {
            rasterizer,
            cleaner,
            cpu_limit,
            ui,
            report_frequency: report_frequency.max(1),
        }
    }

    /// Rasterize and clean each `(manifest_path, full_path)` document.
    ///
    /// A document that fails is recorded and skipped, and any images it
    /// already produced are removed. Page images are named after the
    /// document's file name, so if two documents share one, only the first
    /// is prepared.
    #[instrument(level = "info", skip_all, fields(batch_id = batch_id, documents = documents.len()))]
    pub async fn prepare(
        &self,
        batch_id: u32,
        documents: Vec<(String, PathBuf)>,
        dirs: &WorkingDir,
    ) -> PreparedImages {
        let (documents, mut failures) = claim_basenames(documents);
        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄",
                msg: "Preparing images",
                done_msg: "Prepared images",
            },
            documents.len() as u64,
        );
        let cleaned_count = AtomicUsize::new(0);
        let cleaned_count = &cleaned_count;

        let results = stream::iter(documents)
            .map(|(manifest_path, pdf)| {
                let pb = pb.clone();
                async move {
                    let result = self.prepare_document(&pdf, dirs, cleaned_count).await;
                    pb.inc(1);
                    (manifest_path, result)
                }
            })
            .buffer_unordered(self.cpu_limit.permits())
            .collect::<Vec<_>>()
            .await;
        pb.finish_using_style();

        let mut prepared = PreparedImages::default();
        prepared.failures.append(&mut failures);
        for (path, result) in results {
            match result {
                Ok(images) => prepared.images.extend(images),
                Err(err) => {
                    warn!(batch_id, path = %path, "Skipping document: {:#}", err);
                    prepared.failures.push(DocumentFailure {
                        path,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        prepared.images.sort();
        prepared.failures.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            batch_id,
            images = prepared.images.len(),
            failed_documents = prepared.failures.len(),
            "Finished preparing images"
        );
        prepared
    }

    #[instrument(level = "debug", skip_all, fields(path = %pdf.display()))]
    async fn prepare_document(
        &self,
        pdf: &Path,
        dirs: &WorkingDir,
        cleaned_count: &AtomicUsize,
    ) -> Result<Vec<PathBuf>> {
        let raw_pages = self
            .cpu_limit
            .run(|| self.rasterizer.rasterize(pdf, &dirs.image_raw_dir))
            .await?;

        let mut cleaned = Vec::with_capacity(raw_pages.len());
        for raw in &raw_pages {
            match self.clean_page(raw, &dirs.image_processed_dir).await {
                Ok(path) => cleaned.push(path),
                Err(err) => {
                    remove_files(raw_pages.iter().chain(&cleaned));
                    return Err(err);
                }
            }
            let count = cleaned_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count % self.report_frequency == 0 {
                info!(images = count, "Preprocessing progress");
            }
        }
        Ok(cleaned)
    }

    async fn clean_page(&self, raw: &Path, processed_dir: &Path) -> Result<PathBuf> {
        let file_name = raw
            .file_name()
            .ok_or_else(|| anyhow!("page image has no file name: {:?}", raw))?;
        let output = processed_dir.join(file_name);
        let cleaner = self.cleaner.clone();
        let input = raw.to_owned();
        let dest = output.clone();
        self.cpu_limit
            .run(|| spawn_blocking_propagating_panics(move || cleaner.clean(&input, &dest)))
            .await
            .with_context(|| format!("cannot clean up {:?}", raw))?;
        Ok(output)
    }
}

/// Keep the first document for each page image basename and fail the rest.
fn claim_basenames(
    documents: Vec<(String, PathBuf)>,
) -> (Vec<(String, PathBuf)>, Vec<DocumentFailure>) {
    let mut owners = BTreeMap::<String, String>::new();
    let mut kept = Vec::with_capacity(documents.len());
    let mut failures = vec![];
    for (manifest_path, pdf) in documents {
        let error = match document_basename(&pdf) {
            Ok(basename) => match owners.entry(basename) {
                Entry::Vacant(entry) => {
                    entry.insert(manifest_path.clone());
                    kept.push((manifest_path, pdf));
                    continue;
                }
                Entry::Occupied(entry) => format!(
                    "page images would have the same names as those of {}",
                    entry.get()
                ),
            },
            Err(err) => format!("{err:#}"),
        };
        warn!(path = %manifest_path, "Skipping document: {}", error);
        failures.push(DocumentFailure {
            path: manifest_path,
            error,
        });
    }
    (kept, failures)
}

fn remove_files<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            debug!(path = %path.display(), "Could not remove partial output: {}", err);
        }
    }
}
