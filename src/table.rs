//! A small in-memory table of string cells, plus CSV/TSV I/O.
//!
//! OCR engine output is treated as opaque columns. We only ever look up a
//! couple of them by name, so there's no need for anything fancier.

use std::{fs::File, io};

use crate::prelude::*;

/// A table with named columns. Every row has exactly one cell per column.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Create an empty table with the given columns.
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: vec![],
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Find a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    /// Append a row. It must have one cell per column.
    pub fn push_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.headers.len() {
            return Err(anyhow!(
                "row has {} cells but table has {} columns",
                row.len(),
                self.headers.len()
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Read a tab-separated file with a header row and no quoting, which is
    /// what `tesseract` writes.
    pub fn read_tsv(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open {:?}", path))?;
        Self::read_tsv_from(file).with_context(|| format!("cannot parse {:?}", path))
    }

    /// Like [`Table::read_tsv`], from any reader.
    pub fn read_tsv_from(rdr: impl io::Read) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .from_reader(rdr);
        let headers = reader
            .headers()
            .context("cannot read header row")?
            .iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if headers.iter().all(String::is_empty) {
            return Err(anyhow!("header row is empty"));
        }
        let mut table = Self::new(headers);
        for record in reader.records() {
            let record = record.context("cannot read row")?;
            table.push_row(record.iter().map(str::to_owned).collect())?;
        }
        Ok(table)
    }

    /// Write as CSV, replacing any existing file.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("cannot create {:?}", path))?;
        wtr.write_record(&self.headers)
            .with_context(|| format!("cannot write headers to {:?}", path))?;
        for row in &self.rows {
            wtr.write_record(row)
                .with_context(|| format!("cannot write row to {:?}", path))?;
        }
        wtr.flush().with_context(|| format!("cannot flush {:?}", path))?;
        Ok(())
    }
}

/// Write serializable records as CSV. The header row is always written, even
/// when there are no records, so an empty report is still a valid table.
pub fn write_csv_records<T: Serialize>(
    path: &Path,
    headers: &[&str],
    records: &[T],
) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("cannot create {:?}", path))?;
    wtr.write_record(headers)
        .with_context(|| format!("cannot write headers to {:?}", path))?;
    for record in records {
        wtr.serialize(record)
            .with_context(|| format!("cannot write record to {:?}", path))?;
    }
    wtr.flush().with_context(|| format!("cannot flush {:?}", path))?;
    Ok(())
}
