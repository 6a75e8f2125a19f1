//! Rebuilding per-document OCR tables from per-chunk engine output.
//!
//! The engine numbers its rows by position in the chunk manifest
//! (`page_num`, from 1). We join that back against the manifest to find each
//! row's image, and parse the image's file name to find the document and
//! page it came from.

use std::collections::{BTreeMap, HashMap};

use super::chunks::Chunk;
use crate::{errors::MergeError, images::parse_page_image_name, prelude::*, table::Table};

/// The engine's synthetic key column.
const PAGE_NUM_COLUMN: &str = "page_num";

/// An engine column we never copy to the output.
const FILENAME_COLUMN: &str = "filename";

/// One row of engine output, traced back to its source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OcrResultRow {
    pub source_document: String,
    pub page_number: u32,
    /// Engine cells, minus `page_num` and `filename`.
    pub cells: Vec<String>,
}

/// One chunk's output, joined against its manifest.
struct ChunkRows {
    columns: Vec<String>,
    rows: Vec<OcrResultRow>,
}

/// Merge the output of `chunks` into one `<document>_output.csv` per source
/// document in `output_dir`. Returns the files written, ordered by document.
#[instrument(level = "info", skip_all, fields(chunks = chunks.len()))]
pub fn merge(chunks: &[Chunk], output_dir: &Path, image_suffix: &str) -> Result<Vec<PathBuf>> {
    let mut columns: Option<(usize, Vec<String>)> = None;
    let mut by_document = BTreeMap::<String, Vec<OcrResultRow>>::new();
    for chunk in chunks {
        let chunk_rows = read_chunk(chunk, image_suffix)?;
        match &columns {
            None => columns = Some((chunk.chunk_id, chunk_rows.columns)),
            Some((first_id, first)) if *first != chunk_rows.columns => {
                return Err(merge_error(
                    chunk,
                    format!(
                        "columns {:?} differ from chunk {}'s {:?}",
                        chunk_rows.columns, first_id, first
                    ),
                )
                .into());
            }
            Some(_) => {}
        }
        for row in chunk_rows.rows {
            by_document
                .entry(row.source_document.clone())
                .or_default()
                .push(row);
        }
    }

    let Some((_, columns)) = columns else {
        return Ok(vec![]);
    };
    let mut headers = vec!["page_number".to_owned()];
    headers.extend(columns);

    let mut written = Vec::with_capacity(by_document.len());
    for (document, mut rows) in by_document {
        rows.sort_by_key(|row| row.page_number);
        let mut table = Table::new(headers.clone());
        for row in rows {
            let mut cells = Vec::with_capacity(row.cells.len() + 1);
            cells.push(row.page_number.to_string());
            cells.extend(row.cells);
            table.push_row(cells)?;
        }
        let path = output_dir.join(format!("{document}_output.csv"));
        table.write_csv(&path)?;
        debug!(document = %document, path = %path.display(), "Wrote document output");
        written.push(path);
    }
    info!(documents = written.len(), "Merged OCR output");
    Ok(written)
}

fn merge_error(chunk: &Chunk, reason: impl Into<String>) -> MergeError {
    MergeError {
        chunk_id: chunk.chunk_id,
        path: chunk.tsv_path(),
        reason: reason.into(),
    }
}

/// Load one chunk's table and left-join the manifest against it.
fn read_chunk(chunk: &Chunk, image_suffix: &str) -> Result<ChunkRows, MergeError> {
    let tsv_path = chunk.tsv_path();
    if !tsv_path.exists() {
        return Err(merge_error(chunk, "engine output is missing"));
    }
    let table = Table::read_tsv(&tsv_path).map_err(|err| merge_error(chunk, format!("{err:#}")))?;
    let page_num_idx = table
        .column_index(PAGE_NUM_COLUMN)
        .ok_or_else(|| merge_error(chunk, format!("no {PAGE_NUM_COLUMN:?} column")))?;
    let kept = table
        .headers()
        .iter()
        .enumerate()
        .filter(|(_, name)| *name != PAGE_NUM_COLUMN && *name != FILENAME_COLUMN)
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();
    let columns = kept
        .iter()
        .map(|&idx| table.headers()[idx].clone())
        .collect::<Vec<_>>();

    let mut engine_rows = HashMap::<usize, Vec<Vec<String>>>::new();
    for row in table.rows() {
        let page_num = row[page_num_idx].trim().parse::<usize>().map_err(|_| {
            merge_error(chunk, format!("bad {PAGE_NUM_COLUMN} {:?}", row[page_num_idx]))
        })?;
        if page_num == 0 || page_num > chunk.files.len() {
            warn!(
                chunk_id = chunk.chunk_id,
                page_num, "Ignoring engine output for a page not in the chunk manifest"
            );
            continue;
        }
        let cells = kept.iter().map(|&idx| row[idx].clone()).collect();
        engine_rows.entry(page_num).or_default().push(cells);
    }

    let mut rows = vec![];
    for (idx, file) in chunk.files.iter().enumerate() {
        let file_name = file.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        let (source_document, page_number) = parse_page_image_name(file_name, image_suffix)
            .ok_or_else(|| merge_error(chunk, format!("cannot parse image name {:?}", file)))?;
        match engine_rows.remove(&(idx + 1)) {
            Some(found) => rows.extend(found.into_iter().map(|cells| OcrResultRow {
                source_document: source_document.clone(),
                page_number,
                cells,
            })),
            None => rows.push(OcrResultRow {
                source_document,
                page_number,
                cells: vec![String::new(); columns.len()],
            }),
        }
    }
    Ok(ChunkRows { columns, rows })
}
