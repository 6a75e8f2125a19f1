//! Running one OCR engine process per chunk.

use std::sync::Arc;

use futures::future::join_all;

use super::chunks::Chunk;
use crate::{
    cpu_limit::CpuLimit,
    engines::OcrEngine,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// The environment variable that controls Tesseract's OpenMP threads.
pub const THREAD_LIMIT_VAR: &str = "OMP_THREAD_LIMIT";

/// What happened when we ran the engine on one chunk.
#[derive(Clone, Debug)]
pub struct ChunkRun {
    pub chunk_id: usize,
    pub stdout: String,
    pub stderr: String,
    /// `None` if the process couldn't be started, or was killed by a signal.
    pub exit_code: Option<i32>,
}

impl ChunkRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Is `OMP_THREAD_LIMIT` set so that each engine process uses one core?
///
/// We run one process per worker, so multithreaded OCR would oversubscribe
/// the CPU. This only warns.
pub fn check_thread_limit(value: Option<&str>) -> bool {
    if value == Some("1") {
        true
    } else {
        warn!(
            value = value.unwrap_or("<unset>"),
            "{THREAD_LIMIT_VAR} should be 1 when running one OCR process per worker"
        );
        false
    }
}

/// Launches engine processes, at most one per CPU permit.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn OcrEngine>,
    cpu_limit: CpuLimit,
    ui: Ui,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn OcrEngine>, cpu_limit: CpuLimit, ui: Ui) -> Self {
        Self {
            engine,
            cpu_limit,
            ui,
        }
    }

    /// Run every chunk and wait for all of them. Failures are logged and
    /// recorded, but never stop other chunks. Results are in chunk order.
    #[instrument(level = "info", skip_all, fields(batch_id = batch_id, chunks = chunks.len()))]
    pub async fn run_all(&self, batch_id: u32, chunks: &[Chunk]) -> Vec<ChunkRun> {
        check_thread_limit(std::env::var(THREAD_LIMIT_VAR).ok().as_deref());

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🔎",
                msg: "Running OCR",
                done_msg: "Ran OCR",
            },
            chunks.len() as u64,
        );
        let runs = join_all(chunks.iter().map(|chunk| {
            let pb = pb.clone();
            async move {
                let run = self.run_one(chunk).await;
                if run.succeeded() {
                    debug!(
                        batch_id,
                        chunk_id = run.chunk_id,
                        stdout = %run.stdout.trim(),
                        "OCR chunk finished"
                    );
                } else {
                    warn!(
                        batch_id,
                        chunk_id = run.chunk_id,
                        exit_code = ?run.exit_code,
                        stderr = %run.stderr.trim(),
                        "{} failed on chunk",
                        self.engine.name(),
                    );
                }
                pb.inc(1);
                run
            }
        }))
        .await;
        pb.finish_using_style();
        runs
    }

    #[instrument(level = "debug", skip_all, fields(chunk_id = chunk.chunk_id))]
    async fn run_one(&self, chunk: &Chunk) -> ChunkRun {
        let mut command = self.engine.command(chunk);
        let command = &mut command;
        let result = self
            .cpu_limit
            .run(|| async move {
                command.output().await.with_context(|| {
                    format!("cannot start {} for chunk {}", self.engine.name(), chunk.chunk_id)
                })
            })
            .await;
        match result {
            Ok(output) => ChunkRun {
                chunk_id: chunk.chunk_id,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            },
            Err(err) => ChunkRun {
                chunk_id: chunk.chunk_id,
                stdout: String::new(),
                stderr: format!("{err:#}"),
                exit_code: None,
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        pipeline::chunks::partition,
        test_support::{FAILING_ENGINE_SCRIPT, ShellEngine, TSV_ENGINE_SCRIPT},
    };

    fn dispatcher(script: &str, workers: usize) -> Dispatcher {
        Dispatcher::new(
            Arc::new(ShellEngine::new(script)),
            CpuLimit::new(workers),
            Ui::init_for_tests(),
        )
    }

    #[test]
    fn thread_limit_must_be_one() {
        assert!(check_thread_limit(Some("1")));
        assert!(!check_thread_limit(Some("4")));
        assert!(!check_thread_limit(None));
    }

    #[tokio::test]
    async fn runs_every_chunk() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("dispatch")?;
        let files = (1..=5)
            .map(|page| dir.path().join(format!("doc_{page:04}.tif")))
            .collect();
        let chunks = partition(files, 2, dir.path(), dir.path())?;
        let runs = dispatcher(TSV_ENGINE_SCRIPT, 2).run_all(1, &chunks).await;

        assert_eq!(runs.iter().map(|r| r.chunk_id).collect::<Vec<_>>(), [0, 1]);
        assert!(runs.iter().all(ChunkRun::succeeded));
        let tsv = fs::read_to_string(chunks[1].tsv_path())?;
        assert_eq!(tsv.lines().count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn failures_do_not_affect_siblings() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("dispatch")?;
        let files = ["bad_0001.tif", "good_0001.tif", "good_0002.tif"]
            .iter()
            .map(|name| dir.path().join(name))
            .collect();
        let chunks = partition(files, 3, dir.path(), dir.path())?;
        let runs = dispatcher(FAILING_ENGINE_SCRIPT, 3).run_all(1, &chunks).await;

        assert_eq!(runs[0].exit_code, Some(3));
        assert!(runs[0].stderr.contains("cannot OCR"));
        assert!(runs[1].succeeded() && runs[2].succeeded());
        assert!(!chunks[0].tsv_path().exists());
        assert!(chunks[2].tsv_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_programs_are_recorded_as_failures() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("dispatch")?;
        let chunks = partition(vec![dir.path().join("a_0001.tif")], 1, dir.path(), dir.path())?;
        let engine = ShellEngine::with_program("/nonexistent/ocr-engine", "");
        let runs = Dispatcher::new(Arc::new(engine), CpuLimit::new(1), Ui::init_for_tests())
            .run_all(1, &chunks)
            .await;
        assert_eq!(runs[0].exit_code, None);
        assert!(!runs[0].succeeded());
        Ok(())
    }
}
