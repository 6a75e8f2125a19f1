//! Turning PDFs into page images that are ready for OCR.
//!
//! The pipeline only depends on the [`Rasterizer`] and [`ImageCleaner`]
//! traits. It also relies on the page image naming scheme defined here,
//! because that's how OCR output is traced back to a document and page.

use crate::prelude::*;

pub mod cleanup;
pub mod pdftocairo;

/// Converts a PDF into one image per page.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Rasterize `pdf` into `out_dir`.
    ///
    /// Every image must be named with [`page_image_name`], using the PDF's
    /// file stem. Returns the images in page order.
    async fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Cleans up a single page image before OCR.
///
/// This is CPU-bound and synchronous. Callers should run it on the blocking
/// thread pool.
pub trait ImageCleaner: Send + Sync {
    /// Read `input`, and write the cleaned image to `output`.
    fn clean(&self, input: &Path, output: &Path) -> Result<()>;
}

/// The file name for page `page` (1-based) of the document `basename`.
///
/// Page numbers are zero-padded so that a lexical sort of a document's pages
/// is also a numeric sort, for documents under 10,000 pages.
pub fn page_image_name(basename: &str, page: u32, suffix: &str) -> String {
    format!("{basename}_{page:04}{suffix}")
}

/// Split a page image file name into its document basename and page number.
///
/// This is the inverse of [`page_image_name`], but it accepts unpadded page
/// numbers too. The basename may itself contain underscores.
pub fn parse_page_image_name(file_name: &str, suffix: &str) -> Option<(String, u32)> {
    let stem = file_name.strip_suffix(suffix)?;
    let (basename, page) = stem.rsplit_once('_')?;
    if basename.is_empty() || page.is_empty() || !page.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some((basename.to_owned(), page.parse().ok()?))
}

/// The basename we use for a PDF's page images.
pub fn document_basename(pdf: &Path) -> Result<String> {
    pdf.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("cannot get a UTF-8 file stem from {:?}", pdf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_padded() {
        assert_eq!(page_image_name("report", 3, ".tif"), "report_0003.tif");
        assert_eq!(page_image_name("a_b", 12345, ".png"), "a_b_12345.png");
    }

    #[test]
    fn names_parse_back() {
        assert_eq!(
            parse_page_image_name("company_accounts_0012.tif", ".tif"),
            Some(("company_accounts".to_owned(), 12))
        );
        assert_eq!(
            parse_page_image_name("doc_7.tif", ".tif"),
            Some(("doc".to_owned(), 7))
        );
    }

    #[test]
    fn bad_names_do_not_parse() {
        assert_eq!(parse_page_image_name("doc_0001.png", ".tif"), None);
        assert_eq!(parse_page_image_name("doc.tif", ".tif"), None);
        assert_eq!(parse_page_image_name("_0001.tif", ".tif"), None);
        assert_eq!(parse_page_image_name("doc_.tif", ".tif"), None);
        assert_eq!(parse_page_image_name("doc_1a.tif", ".tif"), None);
    }

    #[test]
    fn basename_is_the_file_stem() -> Result<()> {
        assert_eq!(document_basename(Path::new("/pdfs/x/12345.pdf"))?, "12345");
        Ok(())
    }
}
