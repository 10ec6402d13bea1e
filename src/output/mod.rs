//! Output sinks
//!
//! Every sink consumes ordered batches of [`AnalysisRecord`]s and persists
//! them incrementally. Three independent implementations exist:
//!
//! | Format | Type | Notes |
//! |---|---|---|
//! | `csv` | [`CsvSink`] | rolls over to `name__N.csv` at the row limit |
//! | `parquet` | [`ParquetSink`] | rewrites the whole file on every batch |
//! | `sqlite` | [`SqliteSink`] | one transaction per batch, four tables |
//!
//! A sink is owned by a single writer (the accumulator). A failed write is
//! returned to the caller; nothing is rolled back across batches except by
//! the SQLite transaction of the failing batch itself.

mod csv_sink;
mod parquet_sink;
mod sqlite_sink;

pub use csv_sink::CsvSink;
pub use parquet_sink::ParquetSink;
pub use sqlite_sink::SqliteSink;

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::record::AnalysisRecord;
use crate::sampling::SamplingMode;

/// Version written into run metadata
pub const FORMAT_VERSION: &str = "1.0";

/// Default row limit per CSV file
pub const DEFAULT_MAX_ROWS_PER_FILE: usize = 80_000;

/// Output error types
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("Unexpected column type for '{0}' in existing output")]
    ColumnType(String),

    #[error("Output connection is no longer available")]
    Closed,
}

pub type Result<T> = std::result::Result<T, OutputError>;

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Parquet,
    Sqlite,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Csv, OutputFormat::Parquet, OutputFormat::Sqlite];

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
            OutputFormat::Sqlite => "sqlite",
        }
    }

    /// File extension of the primary output
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
            OutputFormat::Sqlite => "db",
        }
    }

    /// Output path for a requested base path
    ///
    /// CSV keeps an explicit extension; Parquet and SQLite always use their
    /// own.
    pub fn resolve_path(self, base: &Path) -> PathBuf {
        match self {
            OutputFormat::Csv if base.extension().is_some() => base.to_path_buf(),
            _ => base.with_extension(self.extension()),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = OutputError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "parquet" => Ok(OutputFormat::Parquet),
            "sqlite" | "db" => Ok(OutputFormat::Sqlite),
            other => Err(OutputError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// One metadata record per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub run_id: String,
    pub created_at: String,
    pub threshold: f64,
    pub format_version: String,
    /// `none`, `statistical` or `random_n`
    pub sampling_method: String,
    pub sampling_enabled: bool,
    pub confidence_level: Option<f64>,
    pub margin_of_error: Option<f64>,
    pub sample_size: Option<usize>,
    pub random_n_size: Option<usize>,
    pub total_files: Option<usize>,
}

impl AnalysisMetadata {
    /// Metadata for a run with the given threshold and sampling mode
    pub fn new(threshold: f64, sampling: &SamplingMode) -> Self {
        let (confidence_level, margin_of_error) = match *sampling {
            SamplingMode::Statistical {
                confidence_level,
                margin_of_error,
            } => (Some(confidence_level), Some(margin_of_error)),
            _ => (None, None),
        };

        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            created_at: Local::now().to_rfc3339(),
            threshold,
            format_version: FORMAT_VERSION.to_string(),
            sampling_method: sampling.method_name().to_string(),
            sampling_enabled: sampling.is_enabled(),
            confidence_level,
            margin_of_error,
            sample_size: None,
            random_n_size: None,
            total_files: None,
        }
    }

    /// Record population and sample sizes once sampling has run
    pub fn with_population(
        mut self,
        total_files: usize,
        sample_size: Option<usize>,
        random_n_size: Option<usize>,
    ) -> Self {
        self.total_files = Some(total_files);
        self.sample_size = sample_size;
        self.random_n_size = random_n_size;
        self
    }

    /// Key/value view used by the JSON companions and the SQLite table
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// `<dir>/<stem>_metadata.json` next to an output file
pub fn metadata_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{}_metadata.json", stem))
}

/// Write a metadata map as pretty JSON
pub(crate) fn write_metadata_json(
    path: &Path,
    map: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    let content = serde_json::to_string_pretty(map)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Sink behaviour shared by all formats
#[derive(Debug, Clone, PartialEq)]
pub struct SinkOptions {
    /// File, Page and Content Status only
    pub minimal_output: bool,
    /// Row limit per CSV file
    pub max_rows_per_file: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            minimal_output: false,
            max_rows_per_file: DEFAULT_MAX_ROWS_PER_FILE,
        }
    }
}

/// Column headers for text outputs
pub const FULL_COLUMNS: [&str; 9] = [
    "File",
    "Page",
    "Content Status",
    "Text Status",
    "Image Status",
    "Type",
    "Analysis Details",
    "Error",
    "Error Severity",
];

/// Column headers in minimal mode
pub const MINIMAL_COLUMNS: [&str; 3] = ["File", "Page", "Content Status"];

/// Output sink capability
pub trait OutputSink: Send {
    /// Persist one batch
    ///
    /// `is_final` marks the last call of a run, which may carry zero
    /// records. Returns the path written to, if any.
    fn write_batch(&mut self, records: &[AnalysisRecord], is_final: bool) -> Result<Option<PathBuf>>;

    /// Release held connections and file handles
    fn cleanup(&mut self) -> Result<()>;

    /// Run metadata
    fn metadata(&self) -> &AnalysisMetadata;

    /// Primary output path
    fn output_path(&self) -> &Path;

    fn format(&self) -> OutputFormat;
}

/// Create the sink for a format
pub fn create_sink(
    format: OutputFormat,
    path: &Path,
    options: &SinkOptions,
    metadata: AnalysisMetadata,
) -> Result<Box<dyn OutputSink>> {
    let path = format.resolve_path(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(format = %format, path = %path.display(), "creating output sink");
    let sink: Box<dyn OutputSink> = match format {
        OutputFormat::Csv => Box::new(CsvSink::new(&path, options.clone(), metadata)?),
        OutputFormat::Parquet => Box::new(ParquetSink::new(&path, options.clone(), metadata)),
        OutputFormat::Sqlite => Box::new(SqliteSink::new(&path, options.clone(), metadata)?),
    };
    Ok(sink)
}

/// Create the sink for a format name (`csv`, `parquet`, `sqlite`)
pub fn create_sink_by_name(
    name: &str,
    path: &Path,
    options: &SinkOptions,
    metadata: AnalysisMetadata,
) -> Result<Box<dyn OutputSink>> {
    create_sink(name.parse()?, path, options, metadata)
}
