//! Runtime configuration.
//!
//! Defaults are computed from a single data directory. They can be overridden
//! by a TOML file, but only for the keys listed in [`CONFIGURABLE_KEYS`].
//! Anything else in the file is reported and ignored.
//!
//! A [`Config`] is built once in `main` and handed to whatever needs it.

use std::{env, fs};

use schemars::JsonSchema;
use toml_span::value::ValueInner;

use crate::prelude::*;

/// Name of the config file we look for under `~/config/` when no explicit
/// path is given.
const DEFAULT_CONFIG_FILE_NAME: &str = "ocr_runner.toml";

/// The only keys a config file may set.
pub const CONFIGURABLE_KEYS: &[&str] = &[
    "data_dir",
    "pdf_dir",
    "working_dir",
    "allocation_path",
    "machine_env_var",
    "ocr_dpi",
    "image_suffix",
    "worker_count",
    "tesseract_command",
    "ocr_language",
    "ocr_pdf_output",
    "preprocess_report_frequency",
    "lock_with_failed_documents",
];

/// Effective configuration for a run.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct Config {
    /// Root of all our data. Other paths default to locations under here.
    pub data_dir: PathBuf,

    /// Shared directory holding the PDFs named in the allocation manifest.
    pub pdf_dir: PathBuf,

    /// Scratch root. Holds one `batch_NN` directory and one `batch_NN.lock`
    /// file per batch.
    pub working_dir: PathBuf,

    /// The allocation manifest (CSV).
    pub allocation_path: PathBuf,

    /// Environment variable holding this machine's ID.
    pub machine_env_var: String,

    /// Resolution used when rasterizing PDF pages.
    pub ocr_dpi: u32,

    /// Suffix of the page images we generate, including the dot.
    pub image_suffix: String,

    /// Maximum number of CPU-bound external processes at once. This is also
    /// the number of OCR chunks per batch.
    pub worker_count: usize,

    /// The `tesseract` binary to run.
    pub tesseract_command: String,

    /// Language passed to `tesseract -l`.
    pub ocr_language: String,

    /// Should `tesseract` also produce a searchable PDF per chunk?
    pub ocr_pdf_output: bool,

    /// Log preprocessing progress every N images.
    pub preprocess_report_frequency: usize,

    /// Lock a batch even if some of its documents could not be turned into
    /// page images. Off by default, so the next run retries the batch.
    pub lock_with_failed_documents: bool,
}

impl Config {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            pdf_dir: data_dir.join("pdfs"),
            working_dir: data_dir.join("working"),
            allocation_path: data_dir.join("pdf_batch_allocation.csv"),
            data_dir,
            machine_env_var: "OCR_MACHINE_ID".to_owned(),
            ocr_dpi: 300,
            image_suffix: ".tif".to_owned(),
            worker_count: num_cpus::get(),
            tesseract_command: "tesseract".to_owned(),
            ocr_language: "eng".to_owned(),
            ocr_pdf_output: true,
            preprocess_report_frequency: 50,
            lock_with_failed_documents: false,
        }
    }

    /// Load our configuration.
    ///
    /// If `path` is given, it must exist. Otherwise we use
    /// `~/config/ocr_runner.toml` if present, and the defaults if not.
    #[instrument(level = "debug", skip_all)]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_owned()),
            None => {
                let candidate = home_dir()?.join("config").join(DEFAULT_CONFIG_FILE_NAME);
                candidate.is_file().then_some(candidate)
            }
        };
        match path {
            Some(path) => {
                info!(path = %path.display(), "Reading config");
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("cannot read config file {:?}", path))?;
                Self::from_toml_str(&text, &path, default_data_dir)
            }
            None => {
                debug!("No config file found, using defaults");
                Ok(Self::with_data_dir(default_data_dir()?))
            }
        }
    }

    /// Build a configuration from TOML overrides on top of the defaults.
    ///
    /// `source` is only used in messages. `default_data_dir` is only called
    /// if the file doesn't set `data_dir`.
    pub fn from_toml_str(
        text: &str,
        source: &Path,
        default_data_dir: impl FnOnce() -> Result<PathBuf>,
    ) -> Result<Self> {
        let mut root = toml_span::de::parse(text)
            .map_err(|err| anyhow!("cannot parse TOML in {:?}: {}", source, err))?;
        let table = match root.take() {
            ValueInner::Table(table) => table,
            _ => return Err(anyhow!("config file {:?} must be a TOML table", source)),
        };

        let mut overrides = Overrides::default();
        for (key, mut value) in table {
            let name = key.name.as_ref();
            if !CONFIGURABLE_KEYS.contains(&name) {
                warn!(
                    key = name,
                    line = line_of(text, key.span.start),
                    "Ignoring unknown config key in {:?}",
                    source
                );
                continue;
            }
            let line = line_of(text, value.span.start);
            overrides
                .set(name, value.take())
                .with_context(|| format!("{:?}, line {}: bad value for {}", source, line, name))?;
            info!("Overriding default value of {} from {:?}", name, source);
        }
        overrides.apply(default_data_dir)
    }

    /// Read this machine's ID from the environment.
    ///
    /// Unset and empty are both reported as `None`.
    pub fn machine_id(&self) -> Option<String> {
        env::var(&self.machine_env_var)
            .ok()
            .filter(|id| !id.is_empty())
    }

    /// Log every setting.
    pub fn log_config(&self) {
        info!("data_dir: {}", self.data_dir.display());
        info!("pdf_dir: {}", self.pdf_dir.display());
        info!("working_dir: {}", self.working_dir.display());
        info!("allocation_path: {}", self.allocation_path.display());
        info!("machine_env_var: {}", self.machine_env_var);
        info!("ocr_dpi: {}", self.ocr_dpi);
        info!("image_suffix: {}", self.image_suffix);
        info!("worker_count: {}", self.worker_count);
        info!("tesseract_command: {}", self.tesseract_command);
        info!("ocr_language: {}", self.ocr_language);
        info!("ocr_pdf_output: {}", self.ocr_pdf_output);
        info!(
            "preprocess_report_frequency: {}",
            self.preprocess_report_frequency
        );
        info!(
            "lock_with_failed_documents: {}",
            self.lock_with_failed_documents
        );
    }

    fn validate(self) -> Result<Self> {
        if self.worker_count == 0 {
            return Err(anyhow!("worker_count must be at least 1"));
        }
        if self.ocr_dpi == 0 {
            return Err(anyhow!("ocr_dpi must be at least 1"));
        }
        if !self.image_suffix.starts_with('.') || self.image_suffix.len() < 2 {
            return Err(anyhow!(
                "image_suffix must look like \".tif\", got {:?}",
                self.image_suffix
            ));
        }
        if self.preprocess_report_frequency == 0 {
            return Err(anyhow!("preprocess_report_frequency must be at least 1"));
        }
        Ok(self)
    }
}

/// Values read from a config file, before defaults are filled in.
#[derive(Debug, Default)]
struct Overrides {
    data_dir: Option<PathBuf>,
    pdf_dir: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    allocation_path: Option<PathBuf>,
    machine_env_var: Option<String>,
    ocr_dpi: Option<u32>,
    image_suffix: Option<String>,
    worker_count: Option<usize>,
    tesseract_command: Option<String>,
    ocr_language: Option<String>,
    ocr_pdf_output: Option<bool>,
    preprocess_report_frequency: Option<usize>,
    lock_with_failed_documents: Option<bool>,
}

impl Overrides {
    /// Record a single allow-listed key.
    fn set(&mut self, name: &str, value: ValueInner<'_>) -> Result<()> {
        match name {
            "data_dir" => self.data_dir = Some(expect_string(value)?.into()),
            "pdf_dir" => self.pdf_dir = Some(expect_string(value)?.into()),
            "working_dir" => self.working_dir = Some(expect_string(value)?.into()),
            "allocation_path" => {
                self.allocation_path = Some(expect_string(value)?.into())
            }
            "machine_env_var" => self.machine_env_var = Some(expect_string(value)?),
            "ocr_dpi" => self.ocr_dpi = Some(u32::try_from(expect_integer(value)?)?),
            "image_suffix" => self.image_suffix = Some(expect_string(value)?),
            "worker_count" => {
                self.worker_count = Some(usize::try_from(expect_integer(value)?)?)
            }
            "tesseract_command" => self.tesseract_command = Some(expect_string(value)?),
            "ocr_language" => self.ocr_language = Some(expect_string(value)?),
            "ocr_pdf_output" => self.ocr_pdf_output = Some(expect_bool(value)?),
            "preprocess_report_frequency" => {
                self.preprocess_report_frequency =
                    Some(usize::try_from(expect_integer(value)?)?)
            }
            "lock_with_failed_documents" => {
                self.lock_with_failed_documents = Some(expect_bool(value)?)
            }
            other => return Err(anyhow!("{} is not a configurable key", other)),
        }
        Ok(())
    }

    /// Fill in defaults. Paths not set explicitly follow `data_dir`.
    fn apply(self, default_data_dir: impl FnOnce() -> Result<PathBuf>) -> Result<Config> {
        let data_dir = match self.data_dir {
            Some(data_dir) => data_dir,
            None => default_data_dir()?,
        };
        let mut config = Config::with_data_dir(data_dir);
        if let Some(pdf_dir) = self.pdf_dir {
            config.pdf_dir = pdf_dir;
        }
        if let Some(working_dir) = self.working_dir {
            config.working_dir = working_dir;
        }
        if let Some(allocation_path) = self.allocation_path {
            config.allocation_path = allocation_path;
        }
        if let Some(machine_env_var) = self.machine_env_var {
            config.machine_env_var = machine_env_var;
        }
        if let Some(ocr_dpi) = self.ocr_dpi {
            config.ocr_dpi = ocr_dpi;
        }
        if let Some(image_suffix) = self.image_suffix {
            config.image_suffix = image_suffix;
        }
        if let Some(worker_count) = self.worker_count {
            config.worker_count = worker_count;
        }
        if let Some(tesseract_command) = self.tesseract_command {
            config.tesseract_command = tesseract_command;
        }
        if let Some(ocr_language) = self.ocr_language {
            config.ocr_language = ocr_language;
        }
        if let Some(ocr_pdf_output) = self.ocr_pdf_output {
            config.ocr_pdf_output = ocr_pdf_output;
        }
        if let Some(frequency) = self.preprocess_report_frequency {
            config.preprocess_report_frequency = frequency;
        }
        if let Some(lock) = self.lock_with_failed_documents {
            config.lock_with_failed_documents = lock;
        }
        config.validate()
    }
}

fn expect_string(value: ValueInner<'_>) -> Result<String> {
    match value {
        ValueInner::String(s) => Ok(s.into_owned()),
        _ => Err(anyhow!("expected a string")),
    }
}

fn expect_integer(value: ValueInner<'_>) -> Result<i64> {
    match value {
        ValueInner::Integer(i) => Ok(i),
        _ => Err(anyhow!("expected an integer")),
    }
}

fn expect_bool(value: ValueInner<'_>) -> Result<bool> {
    match value {
        ValueInner::Boolean(b) => Ok(b),
        _ => Err(anyhow!("expected a boolean")),
    }
}

/// 1-based line number of a byte offset.
fn line_of(text: &str, offset: usize) -> usize {
    let offset = offset.min(text.len());
    text.as_bytes()[..offset].iter().filter(|&&b| b == b'\n').count() + 1
}

/// `~/data/ocr`.
fn default_data_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("data").join("ocr"))
}

fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME is not set, cannot locate default directories"))
}
