//! Which documents are ours to process, and in which batches.
//!
//! The allocation manifest is a CSV file shared by every machine. Each row
//! assigns one PDF to a numbered batch and to one machine. We only ever look
//! at the rows whose `machine_allocation` matches our own machine ID.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
};

use schemars::JsonSchema;

use crate::{errors::ManifestFormatError, prelude::*};

/// Columns the manifest must have. Any others are ignored.
pub const REQUIRED_COLUMNS: &[&str] = &["path", "batch_id", "machine_allocation"];

/// One row of the allocation manifest.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    /// Path of the PDF, relative to the document root.
    #[serde(rename = "path")]
    pub document_path: String,

    /// The batch this document belongs to.
    pub batch_id: u32,

    /// The machine that should process this batch.
    #[serde(rename = "machine_allocation")]
    pub machine_id: String,
}

/// A manifest row before we know whether we care about it. `batch_id` is
/// only parsed for rows allocated to us, so that unallocated rows may leave
/// it blank.
#[derive(Debug, Deserialize)]
struct RawRecord {
    path: String,
    batch_id: String,
    machine_allocation: String,
}

/// All the documents in one batch allocated to this machine.
///
/// `present` and `missing` are decided when the batch is built and never
/// change afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkBatch {
    batch_id: u32,
    machine_id: String,
    document_root: PathBuf,
    present: BTreeSet<String>,
    missing: BTreeSet<String>,
}

impl WorkBatch {
    /// Build a batch, checking which documents exist under `document_root`.
    pub fn new(
        batch_id: u32,
        machine_id: &str,
        document_paths: impl IntoIterator<Item = String>,
        document_root: &Path,
    ) -> Self {
        let mut present = BTreeSet::new();
        let mut missing = BTreeSet::new();
        for document_path in document_paths {
            if document_root.join(&document_path).is_file() {
                present.insert(document_path);
            } else {
                warn!(batch_id, path = %document_path, "Allocated document is missing");
                missing.insert(document_path);
            }
        }
        if !missing.is_empty() {
            warn!(batch_id, "Missing {} documents from batch", missing.len());
        }
        Self {
            batch_id,
            machine_id: machine_id.to_owned(),
            document_root: document_root.to_owned(),
            present,
            missing,
        }
    }

    /// The batch ID.
    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    /// Documents that exist, as manifest paths.
    pub fn present(&self) -> &BTreeSet<String> {
        &self.present
    }

    /// Documents that were allocated but not found.
    pub fn missing(&self) -> &BTreeSet<String> {
        &self.missing
    }

    /// Full paths of the documents we can process, in order.
    pub fn document_paths(&self) -> Vec<PathBuf> {
        self.present
            .iter()
            .map(|path| self.document_root.join(path))
            .collect()
    }

    /// Manifest rows for the missing documents, for reporting.
    pub fn missing_records(&self) -> Vec<AllocationRecord> {
        self.missing
            .iter()
            .map(|path| AllocationRecord {
                document_path: path.clone(),
                batch_id: self.batch_id,
                machine_id: self.machine_id.clone(),
            })
            .collect()
    }

    /// Number of documents we can process.
    pub fn len(&self) -> usize {
        self.present.len()
    }

    /// Is there nothing to process?
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

impl fmt::Display for WorkBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkBatch(batch_id={})", self.batch_id)
    }
}

/// Load the batches allocated to `machine_id`, in ascending `batch_id` order.
///
/// A missing or empty `machine_id` means nothing is allocated to us. The
/// manifest columns are still checked, so a malformed manifest is always an
/// error.
#[instrument(level = "debug", skip_all, fields(path = %manifest_path.display()))]
pub fn load(
    manifest_path: &Path,
    machine_id: Option<&str>,
    document_root: &Path,
) -> Result<Vec<WorkBatch>> {
    let records = read_allocated(manifest_path, machine_id)?;
    let machine_id = machine_id.unwrap_or_default();

    let mut groups: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.batch_id)
            .or_default()
            .push(record.document_path);
    }

    Ok(groups
        .into_iter()
        .map(|(batch_id, paths)| WorkBatch::new(batch_id, machine_id, paths, document_root))
        .collect())
}

/// Read the manifest rows allocated to `machine_id`, in file order.
pub fn read_allocated(
    manifest_path: &Path,
    machine_id: Option<&str>,
) -> Result<Vec<AllocationRecord>> {
    let file = fs::File::open(manifest_path)
        .with_context(|| format!("cannot open allocation manifest {:?}", manifest_path))?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader
        .headers()
        .with_context(|| format!("cannot read CSV headers from {:?}", manifest_path))?
        .to_owned();
    let missing_columns = REQUIRED_COLUMNS
        .iter()
        .filter(|&&column| !headers.iter().any(|header| header == column))
        .map(|&column| column.to_owned())
        .collect::<Vec<_>>();
    if !missing_columns.is_empty() {
        return Err(ManifestFormatError {
            path: manifest_path.to_owned(),
            missing: missing_columns,
        }
        .into());
    }

    let machine_id = match machine_id {
        Some(id) if !id.is_empty() => id,
        _ => {
            warn!("No machine ID set, so no batches are allocated to this machine");
            return Ok(vec![]);
        }
    };
    info!(machine_id, "Running allocation for machine");

    let mut total = 0usize;
    let mut allocated = vec![];
    for (row_idx, raw) in reader.deserialize::<RawRecord>().enumerate() {
        let raw = raw.with_context(|| {
            format!("cannot read row {} of {:?}", row_idx + 1, manifest_path)
        })?;
        total += 1;
        if raw.machine_allocation != machine_id {
            continue;
        }
        let batch_id = raw.batch_id.trim().parse::<u32>().with_context(|| {
            format!(
                "row {} of {:?} has invalid batch_id {:?}",
                row_idx + 1,
                manifest_path,
                raw.batch_id
            )
        })?;
        allocated.push(AllocationRecord {
            document_path: raw.path,
            batch_id,
            machine_id: raw.machine_allocation,
        });
    }
    info!(
        machine_id,
        "{} of {} total documents allocated to this machine",
        allocated.len(),
        total
    );
    Ok(allocated)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A manifest plus a document root containing some of its PDFs.
    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(manifest: &str, existing: &[&str]) -> Result<Self> {
            let dir = tempfile::TempDir::with_prefix("allocation")?;
            fs::write(dir.path().join("manifest.csv"), manifest)?;
            fs::create_dir(dir.path().join("pdfs"))?;
            for name in existing {
                fs::write(dir.path().join("pdfs").join(name), b"%PDF-1.4")?;
            }
            Ok(Self { dir })
        }

        fn load(&self, machine_id: Option<&str>) -> Result<Vec<WorkBatch>> {
            load(
                &self.dir.path().join("manifest.csv"),
                machine_id,
                &self.dir.path().join("pdfs"),
            )
        }
    }

    const MANIFEST: &str = "\
path,batch_id,machine_allocation,notes
c.pdf,2,M1,x
a.pdf,1,M1,
b.pdf,1,M1,
z.pdf,1,M2,
y.pdf,3,m1,
d.pdf,2,M1,
";

    #[test]
    fn groups_by_batch_in_order() -> Result<()> {
        let fixture = Fixture::new(MANIFEST, &["a.pdf", "b.pdf", "c.pdf", "d.pdf"])?;
        let batches = fixture.load(Some("M1"))?;
        let ids = batches.iter().map(WorkBatch::batch_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(
            batches[0].present().iter().collect::<Vec<_>>(),
            vec!["a.pdf", "b.pdf"]
        );
        assert_eq!(
            batches[1].present().iter().collect::<Vec<_>>(),
            vec!["c.pdf", "d.pdf"]
        );
        assert!(batches.iter().all(|b| b.missing().is_empty()));
        Ok(())
    }

    #[test]
    fn machine_match_is_exact() -> Result<()> {
        let fixture = Fixture::new(MANIFEST, &["y.pdf", "z.pdf"])?;
        let batches = fixture.load(Some("m1"))?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].batch_id(), 3);
        assert!(fixture.load(Some("M3"))?.is_empty());
        Ok(())
    }

    #[test]
    fn unset_machine_gets_nothing() -> Result<()> {
        let fixture = Fixture::new(MANIFEST, &["a.pdf"])?;
        assert!(fixture.load(None)?.is_empty());
        assert!(fixture.load(Some(""))?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_documents_are_split_out() -> Result<()> {
        let fixture = Fixture::new(MANIFEST, &["a.pdf", "c.pdf", "d.pdf"])?;
        let batches = fixture.load(Some("M1"))?;
        let batch = &batches[0];
        assert_eq!(batch.present().iter().collect::<Vec<_>>(), vec!["a.pdf"]);
        assert_eq!(batch.missing().iter().collect::<Vec<_>>(), vec!["b.pdf"]);
        assert!(batch.present().is_disjoint(batch.missing()));
        assert_eq!(
            batch.missing_records(),
            vec![AllocationRecord {
                document_path: "b.pdf".to_owned(),
                batch_id: 1,
                machine_id: "M1".to_owned(),
            }]
        );
        assert_eq!(
            batch.document_paths(),
            vec![fixture.dir.path().join("pdfs").join("a.pdf")]
        );
        Ok(())
    }

    #[test]
    fn present_and_missing_cover_every_allocated_row() -> Result<()> {
        let fixture = Fixture::new(MANIFEST, &["b.pdf", "d.pdf"])?;
        for batch in fixture.load(Some("M1"))? {
            let union = batch
                .present()
                .union(batch.missing())
                .cloned()
                .collect::<BTreeSet<_>>();
            let expected = match batch.batch_id() {
                1 => ["a.pdf", "b.pdf"],
                2 => ["c.pdf", "d.pdf"],
                other => panic!("unexpected batch {}", other),
            };
            let expected = expected
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>();
            assert_eq!(union, expected);
        }
        Ok(())
    }

    #[test]
    fn missing_columns_are_a_format_error() -> Result<()> {
        let fixture = Fixture::new("path,batch\na.pdf,1\n", &[])?;
        let err = fixture.load(Some("M1")).unwrap_err();
        let err = err
            .downcast_ref::<ManifestFormatError>()
            .expect("should be a ManifestFormatError");
        assert_eq!(err.missing, vec!["batch_id", "machine_allocation"]);
        Ok(())
    }

    #[test]
    fn format_is_checked_even_without_machine_id() -> Result<()> {
        let fixture = Fixture::new("path\na.pdf\n", &[])?;
        let err = fixture.load(None).unwrap_err();
        assert!(err.downcast_ref::<ManifestFormatError>().is_some());
        Ok(())
    }

    #[test]
    fn blank_batch_ids_on_other_machines_are_fine() -> Result<()> {
        let manifest = "path,batch_id,machine_allocation\na.pdf,1,M1\nb.pdf,,\n";
        let fixture = Fixture::new(manifest, &["a.pdf"])?;
        assert_eq!(fixture.load(Some("M1"))?.len(), 1);
        Ok(())
    }

    #[test]
    fn bad_batch_id_on_our_rows_is_an_error() -> Result<()> {
        let manifest = "path,batch_id,machine_allocation\na.pdf,one,M1\n";
        let fixture = Fixture::new(manifest, &["a.pdf"])?;
        assert!(fixture.load(Some("M1")).is_err());
        Ok(())
    }
}
