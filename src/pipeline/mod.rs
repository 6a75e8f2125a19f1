//! Processing a batch from allocated PDFs to per-document OCR tables.
//!
//! Each batch runs through these stages in order, and is only locked once
//! all of them succeed:
//!
//! 1. Skip the batch if its lock file exists.
//! 2. Recreate its scratch directory.
//! 3. Report missing documents.
//! 4. Rasterize and clean up page images, reporting failed documents.
//! 5. Split the images into one chunk per worker.
//! 6. Run the OCR engine on every chunk.
//! 7. Merge chunk output into one table per document.
//! 8. Write the lock file.
//!
//! A batch with documents that failed stage 4 is still OCRed, but isn't
//! locked unless `lock_with_failed_documents` is set. A batch where every
//! document failed stage 4 is never locked.

use std::sync::Arc;

use crate::{
    allocation::{REQUIRED_COLUMNS, WorkBatch},
    config::Config,
    cpu_limit::CpuLimit,
    engines::{OcrEngine, tesseract::TesseractEngine},
    errors::{DocumentPreparationError, WorkingDirectoryGuardError},
    images::{
        ImageCleaner, Rasterizer, cleanup::ThresholdCleaner, pdftocairo::PdftocairoRasterizer,
    },
    prelude::*,
    table::write_csv_records,
    ui::Ui,
};

pub mod chunks;
pub mod dispatch;
pub mod merge;
pub mod prepare;
pub mod working_dir;

use self::{
    dispatch::Dispatcher,
    prepare::{FAILURE_COLUMNS, ImagePreparer},
    working_dir::{WorkingDir, create_lock, is_locked, lock_path},
};

/// File name of the per-batch missing-document report.
pub const MISSING_REPORT: &str = "missing_documents.csv";

/// File name of the per-batch failed-document report.
pub const FAILED_REPORT: &str = "failed_documents.csv";

/// What happened to a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A lock file showed the batch was already done.
    Skipped,
    /// The batch ran to completion and is now locked.
    Completed {
        /// Merged output tables, one per document.
        outputs: Vec<PathBuf>,
        /// Documents we couldn't rasterize or clean.
        failed_documents: usize,
        /// Chunks whose engine process failed.
        failed_chunks: Vec<usize>,
    },
}

impl BatchOutcome {
    /// Human-readable descriptions of anything that went wrong in a batch
    /// that still completed.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = vec![];
        if let BatchOutcome::Completed {
            failed_documents,
            failed_chunks,
            ..
        } = self
        {
            if *failed_documents > 0 {
                problems.push(format!(
                    "{failed_documents} documents could not be prepared, see {FAILED_REPORT}"
                ));
            }
            if !failed_chunks.is_empty() {
                problems.push(format!(
                    "OCR engine failed on chunks {failed_chunks:?}, see the engine output in the log"
                ));
            }
        }
        problems
    }
}

/// Which batches did what during a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: Vec<u32>,
    pub skipped: Vec<u32>,
    pub failed: Vec<u32>,
}

impl RunSummary {
    /// Log the summary, and fail if any batch failed.
    pub fn check(&self) -> Result<()> {
        info!(
            completed = ?self.completed,
            skipped = ?self.skipped,
            failed = ?self.failed,
            "Run finished"
        );
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} batches failed: {:?}",
                self.failed.len(),
                self.failed
            ))
        }
    }
}

/// Runs batches through the whole pipeline.
pub struct BatchRunner {
    config: Config,
    preparer: ImagePreparer,
    dispatcher: Dispatcher,
}

impl BatchRunner {
    /// Create a runner with explicit collaborators.
    pub fn new(
        config: Config,
        rasterizer: Arc<dyn Rasterizer>,
        cleaner: Arc<dyn ImageCleaner>,
        engine: Arc<dyn OcrEngine>,
        ui: Ui,
    ) -> Self {
        let cpu_limit = CpuLimit::new(config.worker_count);
        let preparer = ImagePreparer::new(
            rasterizer,
            cleaner,
            cpu_limit.clone(),
            ui.clone(),
            config.preprocess_report_frequency,
        );
        let dispatcher = Dispatcher::new(engine, cpu_limit, ui);
        Self {
            config,
            preparer,
            dispatcher,
        }
    }

    /// Create a runner using `pdftocairo`, threshold cleanup and `tesseract`.
    pub fn with_defaults(config: Config, ui: Ui) -> Result<Self> {
        let rasterizer = PdftocairoRasterizer::new(config.ocr_dpi, &config.image_suffix)?;
        let engine = TesseractEngine::from_config(&config);
        Ok(Self::new(
            config,
            Arc::new(rasterizer),
            Arc::new(ThresholdCleaner),
            Arc::new(engine),
            ui,
        ))
    }

    /// Run each batch in turn. A failed batch is logged and left unlocked,
    /// and we move on to the next one. Only an unsafe scratch directory stops
    /// the whole run.
    #[instrument(level = "info", skip_all, fields(batches = batches.len()))]
    pub async fn run_batches(&self, batches: &[WorkBatch]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for batch in batches {
            let batch_id = batch.batch_id();
            match self.process(batch).await {
                Ok(BatchOutcome::Skipped) => summary.skipped.push(batch_id),
                Ok(outcome @ BatchOutcome::Completed { .. }) => {
                    for problem in outcome.problems() {
                        warn!(batch_id, "Batch completed with problems: {}", problem);
                    }
                    summary.completed.push(batch_id);
                }
                Err(err) if err.downcast_ref::<WorkingDirectoryGuardError>().is_some() => {
                    return Err(err);
                }
                Err(err) => {
                    error!(batch_id, "Batch failed: {:#}", err);
                    summary.failed.push(batch_id);
                }
            }
        }
        Ok(summary)
    }

    /// Process one batch, unless it's already locked.
    #[instrument(level = "info", skip_all, fields(batch_id = batch.batch_id()))]
    pub async fn process(&self, batch: &WorkBatch) -> Result<BatchOutcome> {
        let batch_id = batch.batch_id();
        let scratch_root = &self.config.working_dir;
        if is_locked(scratch_root, batch_id) {
            info!(
                batch_id,
                lock = %lock_path(scratch_root, batch_id).display(),
                "Batch already processed, skipping"
            );
            return Ok(BatchOutcome::Skipped);
        }
        info!(
            batch_id,
            documents = batch.len(),
            missing = batch.missing().len(),
            "Processing batch"
        );

        let dirs = WorkingDir::create(scratch_root, batch_id)?;
        write_csv_records(
            &dirs.batch_dir.join(MISSING_REPORT),
            REQUIRED_COLUMNS,
            &batch.missing_records(),
        )?;

        let documents = batch
            .present()
            .iter()
            .cloned()
            .zip(batch.document_paths())
            .collect();
        let document_count = batch.present().len();
        let prepared = self.preparer.prepare(batch_id, documents, &dirs).await;
        write_csv_records(
            &dirs.batch_dir.join(FAILED_REPORT),
            FAILURE_COLUMNS,
            &prepared.failures,
        )?;
        let failed_documents = prepared.failures.len();
        let preparation_error = || DocumentPreparationError {
            batch_id,
            failed: failed_documents,
            documents: document_count,
        };
        if failed_documents > 0 && prepared.images.is_empty() {
            return Err(preparation_error().into());
        }

        let chunks = chunks::partition(
            prepared.images,
            self.config.worker_count,
            &dirs.chunk_dir,
            &dirs.tsv_dir,
        )?;
        let runs = self.dispatcher.run_all(batch_id, &chunks).await;
        let failed_chunks = runs
            .iter()
            .filter(|run| !run.succeeded())
            .map(|run| run.chunk_id)
            .collect::<Vec<_>>();

        let outputs = merge::merge(&chunks, &dirs.output_dir, &self.config.image_suffix)?;
        if failed_documents > 0 && !self.config.lock_with_failed_documents {
            info!(
                batch_id,
                outputs = outputs.len(),
                "Wrote output for the documents we could prepare, leaving batch unlocked"
            );
            return Err(preparation_error().into());
        }
        create_lock(scratch_root, batch_id)?;
        info!(batch_id, outputs = outputs.len(), "Batch complete");
        Ok(BatchOutcome::Completed {
            outputs,
            failed_documents,
            failed_chunks,
        })
    }
}
