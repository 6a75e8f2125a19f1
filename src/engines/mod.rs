//! External OCR engines.
//!
//! An engine is a black box that we launch once per chunk. It reads the
//! chunk's manifest and writes a tab-separated table to
//! `<output_prefix>.tsv`, with a `page_num` column giving the 1-based
//! position of each image in the manifest.

use tokio::process::Command;

use crate::pipeline::chunks::Chunk;

pub mod tesseract;

/// Builds the command line for one chunk.
pub trait OcrEngine: Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// The command that OCRs every image listed in `chunk`'s manifest.
    fn command(&self, chunk: &Chunk) -> Command;
}
