//! Tesseract OCR engine.

use tokio::process::Command;

use super::OcrEngine;
use crate::{config::Config, pipeline::chunks::Chunk};

/// OCR engine wrapping the `tesseract` CLI tool, in list-file mode.
#[derive(Clone, Debug)]
pub struct TesseractEngine {
    program: String,
    language: String,
    pdf_output: bool,
}

impl TesseractEngine {
    /// Create a new `tesseract` engine from our configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.tesseract_command.clone(),
            language: config.ocr_language.clone(),
            pdf_output: config.ocr_pdf_output,
        }
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn command(&self, chunk: &Chunk) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(&chunk.manifest_path)
            .arg(&chunk.output_prefix)
            .arg("-l")
            .arg(&self.language)
            .arg("tsv");
        if self.pdf_output {
            command.arg("pdf");
        }
        command
    }
}
