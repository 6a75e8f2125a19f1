//! Stand-ins for external tools, for use in unit tests.

use std::fs;

use tokio::process::Command;

use crate::{
    engines::OcrEngine,
    images::{ImageCleaner, Rasterizer, document_basename, page_image_name},
    pipeline::chunks::Chunk,
    prelude::*,
};

/// Writes a TSV with one row per image in the manifest. The `text` column
/// holds the image's file name.
pub const TSV_ENGINE_SCRIPT: &str = r#"
i=0
{
    printf 'level\tpage_num\tconf\ttext\n'
    while IFS= read -r f; do
        i=$((i + 1))
        printf '1\t%s\t96\t%s\n' "$i" "$(basename "$f")"
    done < "$1"
} > "$2.tsv"
"#;

/// Like [`TSV_ENGINE_SCRIPT`], but fails on any chunk containing `bad_`.
pub const FAILING_ENGINE_SCRIPT: &str = r#"
if grep -q bad_ "$1"; then
    echo "cannot OCR $1" >&2
    exit 3
fi
i=0
{
    printf 'level\tpage_num\tconf\ttext\n'
    while IFS= read -r f; do
        i=$((i + 1))
        printf '1\t%s\t96\t%s\n' "$i" "$(basename "$f")"
    done < "$1"
} > "$2.tsv"
"#;

/// An OCR engine that runs a shell script with the chunk manifest as `$1` and
/// the output prefix as `$2`.
pub struct ShellEngine {
    program: String,
    script: String,
}

impl ShellEngine {
    pub fn new(script: &str) -> Self {
        Self::with_program("sh", script)
    }

    pub fn with_program(program: &str, script: &str) -> Self {
        Self {
            program: program.to_owned(),
            script: script.to_owned(),
        }
    }
}

impl OcrEngine for ShellEngine {
    fn name(&self) -> &str {
        "shell"
    }

    fn command(&self, chunk: &Chunk) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(&self.script)
            .arg("sh")
            .arg(&chunk.manifest_path)
            .arg(&chunk.output_prefix);
        command
    }
}

/// A "PDF" for [`FakeRasterizer`]: a text file holding its page count.
pub fn write_fake_pdf(path: &Path, pages: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pages.to_string())?;
    Ok(())
}

/// Rasterizes fake PDFs written by [`write_fake_pdf`]. Anything else fails.
pub struct FakeRasterizer {
    pub suffix: String,
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let basename = document_basename(pdf)?;
        let pages = fs::read_to_string(pdf)?
            .trim()
            .parse::<u32>()
            .map_err(|_| anyhow!("not a PDF: {:?}", pdf))?;
        (1..=pages)
            .map(|page| {
                let path = out_dir.join(page_image_name(&basename, page, &self.suffix));
                fs::write(&path, format!("{basename} page {page}"))?;
                Ok(path)
            })
            .collect()
    }
}

/// "Cleans" images by copying them.
pub struct CopyCleaner;

impl ImageCleaner for CopyCleaner {
    fn clean(&self, input: &Path, output: &Path) -> Result<()> {
        fs::copy(input, output)?;
        Ok(())
    }
}
