//! Rasterization using Poppler's `pdftocairo` CLI tool.

use std::{fs, sync::LazyLock};

use regex::Regex;
use tokio::process::Command;

use super::{Rasterizer, document_basename, page_image_name};
use crate::{
    async_utils::{DEFAULT_ERROR_REGEX, check_for_command_failure},
    prelude::*,
};

/// Poppler complains about this a lot, but it's harmless.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Matches the page number `pdftocairo` appends to its output files.
static OUTPUT_PAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-(\d+)\.[A-Za-z]+$").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    DEFAULT_ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Rasterizes PDFs with `pdftocairo`, one image file per page.
#[derive(Clone, Debug)]
pub struct PdftocairoRasterizer {
    dpi: u32,
    suffix: String,
    format_flag: &'static str,
}

impl PdftocairoRasterizer {
    /// Create a rasterizer writing images with the given suffix, which picks
    /// the image format.
    pub fn new(dpi: u32, suffix: &str) -> Result<Self> {
        let format_flag = match suffix.to_ascii_lowercase().as_str() {
            ".tif" | ".tiff" => "-tiff",
            ".png" => "-png",
            ".jpg" | ".jpeg" => "-jpeg",
            _ => return Err(anyhow!("pdftocairo cannot write {:?} images", suffix)),
        };
        Ok(Self {
            dpi,
            suffix: suffix.to_owned(),
            format_flag,
        })
    }
}

#[async_trait]
impl Rasterizer for PdftocairoRasterizer {
    #[instrument(level = "debug", skip_all, fields(path = %pdf.display(), dpi = self.dpi))]
    async fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let basename = document_basename(pdf)?;

        // Render into a private directory on the same filesystem, so we can
        // rename pages into place once we know what was produced.
        let tmpdir = tempfile::TempDir::with_prefix_in(".pdftocairo", out_dir)
            .with_context(|| format!("cannot create temporary directory in {:?}", out_dir))?;
        let out_prefix = tmpdir.path().join("page");

        let output = Command::new("pdftocairo")
            .arg(self.format_flag)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(pdf)
            .arg(&out_prefix)
            .output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {:?}", pdf.display()))?;
        check_for_command_failure("pdftocairo", &output, None)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(line) = stderr.lines().find(|line| is_error_line(line)) {
            return Err(anyhow!("pdftocairo reported an error: {}", line.trim()));
        }

        collect_pages(tmpdir.path(), out_dir, &basename, &self.suffix)
    }
}

/// Move the numbered files `pdftocairo` wrote in `render_dir` into `out_dir`,
/// renamed with [`page_image_name`]. Returns them in page order.
fn collect_pages(
    render_dir: &Path,
    out_dir: &Path,
    basename: &str,
    suffix: &str,
) -> Result<Vec<PathBuf>> {
    let mut rendered = vec![];
    for entry in render_dir
        .read_dir()
        .with_context(|| format!("failed to read directory {:?}", render_dir))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {:?}", render_dir))?
            .path();
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let page = OUTPUT_PAGE_REGEX
            .captures(file_name)
            .and_then(|caps| caps[1].parse::<u32>().ok())
            .ok_or_else(|| anyhow!("unexpected pdftocairo output file {:?}", path))?;
        rendered.push((page, path));
    }
    if rendered.is_empty() {
        return Err(anyhow!("pdftocairo produced no pages"));
    }
    rendered.sort();

    let mut pages = Vec::with_capacity(rendered.len());
    for (page, path) in rendered {
        let dest = out_dir.join(page_image_name(basename, page, suffix));
        fs::rename(&path, &dest)
            .with_context(|| format!("cannot move {:?} to {:?}", path, dest))?;
        pages.push(dest);
    }
    Ok(pages)
}
