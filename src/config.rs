//! Settings and configuration file support for margin-scan
//!
//! [`AnalysisSettings`] is the validated, immutable value every component
//! receives. It is built with [`AnalysisSettings::builder`], usually from a
//! TOML [`Config`] merged with command line overrides.
//!
//! Configuration files are searched in this order:
//! 1. `--config <path>` - explicitly specified path
//! 2. `./margin-scan.toml` - current directory
//! 3. `~/.config/margin-scan/config.toml` - user config
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [analysis]
//! threshold = 1.5
//! dpi = 200
//! workers = 8
//!
//! [sampling]
//! statistical = true
//! confidence_level = 0.95
//! margin_of_error = 0.05
//!
//! [output]
//! format = "parquet"
//! batch_size = 500
//!
//! [scan]
//! excluded_folders = ["$RECYCLE.BIN", "archive"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::enumerate::{
    FileEnumerator, ProcessingOptions, DEFAULT_BATCH_SIZE, DEFAULT_EXCLUDED_FOLDERS,
    DEFAULT_IMAGE_EXTENSIONS,
};
use crate::margin::{MarginAnalyzer, MarginError, DEFAULT_DPI, DEFAULT_THRESHOLD, MAX_THRESHOLD, MIN_THRESHOLD};
use crate::output::{OutputFormat, SinkOptions, DEFAULT_MAX_ROWS_PER_FILE};
use crate::sampling::{SamplingError, SamplingMode, DEFAULT_CONFIDENCE, DEFAULT_MARGIN_OF_ERROR};

/// Accepted rendering resolution
pub const MIN_DPI: u32 = 36;
pub const MAX_DPI: u32 = 1200;

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Settings validation errors
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("Threshold must be between {MIN_THRESHOLD} and {MAX_THRESHOLD} percent, got {0}")]
    InvalidThreshold(f64),

    #[error("DPI must be between {MIN_DPI} and {MAX_DPI}, got {0}")]
    InvalidDpi(u32),

    #[error("Max rows per file must be at least 1")]
    InvalidMaxRows,

    #[error("Batch size must be at least 1")]
    InvalidBatchSize,

    #[error("Worker count must be at least 1")]
    InvalidWorkers,

    #[error("At least one of PDF or image processing must be enabled")]
    NoFileTypes,

    #[error("Statistical sampling and random-N sampling cannot be used together")]
    ConflictingSampling,

    #[error("Sampling: {0}")]
    Sampling(#[from] SamplingError),
}

/// Validated run settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSettings {
    /// Percentage of a margin band that may be non-white
    pub threshold: f64,
    pub dpi: u32,
    pub output_format: OutputFormat,
    /// CSV only
    pub max_rows_per_file: usize,
    /// Records per sink write
    pub batch_size: usize,
    pub sampling: SamplingMode,
    /// Seed for reproducible sampling
    pub seed: Option<u64>,
    pub include_pdf: bool,
    pub include_images: bool,
    pub image_extensions: Vec<String>,
    pub excluded_folders: Vec<String>,
    pub max_depth: Option<usize>,
    pub workers: usize,
    /// File, Page and Content Status only
    pub minimal_output: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            dpi: DEFAULT_DPI,
            output_format: OutputFormat::Csv,
            max_rows_per_file: DEFAULT_MAX_ROWS_PER_FILE,
            batch_size: DEFAULT_BATCH_SIZE,
            sampling: SamplingMode::None,
            seed: None,
            include_pdf: true,
            include_images: true,
            image_extensions: DEFAULT_IMAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            excluded_folders: DEFAULT_EXCLUDED_FOLDERS.iter().map(|s| s.to_string()).collect(),
            max_depth: None,
            workers: num_cpus::get().max(1),
            minimal_output: false,
        }
    }
}

impl AnalysisSettings {
    pub fn builder() -> AnalysisSettingsBuilder {
        AnalysisSettingsBuilder::default()
    }

    /// Check every constraint
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&self.threshold) {
            return Err(SettingsError::InvalidThreshold(self.threshold));
        }
        if !(MIN_DPI..=MAX_DPI).contains(&self.dpi) {
            return Err(SettingsError::InvalidDpi(self.dpi));
        }
        if self.max_rows_per_file == 0 {
            return Err(SettingsError::InvalidMaxRows);
        }
        if self.batch_size == 0 {
            return Err(SettingsError::InvalidBatchSize);
        }
        if self.workers == 0 {
            return Err(SettingsError::InvalidWorkers);
        }
        if !self.include_pdf && !self.include_images {
            return Err(SettingsError::NoFileTypes);
        }
        self.sampling.validate()?;
        Ok(())
    }

    pub fn analyzer(&self) -> Result<MarginAnalyzer, MarginError> {
        MarginAnalyzer::with_dpi(self.threshold, self.dpi)
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            minimal_output: self.minimal_output,
            max_rows_per_file: self.max_rows_per_file,
        }
    }

    pub fn processing_options(&self) -> ProcessingOptions {
        ProcessingOptions::builder()
            .excluded_folders(self.excluded_folders.iter().cloned())
            .max_depth(self.max_depth)
            .batch_size(self.batch_size)
            .parallel(self.workers > 1)
            .build()
    }

    pub fn enumerator(&self) -> FileEnumerator {
        FileEnumerator::new(self.processing_options())
            .include_pdf(self.include_pdf)
            .include_images(self.include_images)
            .image_extensions(&self.image_extensions)
    }
}

/// Builder for [`AnalysisSettings`]
#[derive(Debug, Clone, Default)]
pub struct AnalysisSettingsBuilder {
    settings: AnalysisSettings,
    statistical: Option<(f64, f64)>,
    random_n: Option<usize>,
}

impl AnalysisSettingsBuilder {
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.settings.threshold = threshold;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.settings.dpi = dpi;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.settings.output_format = format;
        self
    }

    pub fn max_rows_per_file(mut self, rows: usize) -> Self {
        self.settings.max_rows_per_file = rows;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.settings.batch_size = size;
        self
    }

    /// Enable statistical sampling
    pub fn statistical_sampling(mut self, confidence_level: f64, margin_of_error: f64) -> Self {
        self.statistical = Some((confidence_level, margin_of_error));
        self
    }

    /// Enable fixed-size random sampling
    pub fn random_n(mut self, size: usize) -> Self {
        self.random_n = Some(size);
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.settings.seed = seed;
        self
    }

    pub fn include_pdf(mut self, enabled: bool) -> Self {
        self.settings.include_pdf = enabled;
        self
    }

    pub fn include_images(mut self, enabled: bool) -> Self {
        self.settings.include_images = enabled;
        self
    }

    pub fn image_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.image_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn excluded_folders<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.excluded_folders = names.into_iter().map(Into::into).collect();
        self
    }

    /// Add one folder name to the exclusion list
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.settings.excluded_folders.contains(&name) {
            self.settings.excluded_folders.push(name);
        }
        self
    }

    pub fn max_depth(mut self, depth: Option<usize>) -> Self {
        self.settings.max_depth = depth;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.settings.workers = workers;
        self
    }

    pub fn minimal_output(mut self, enabled: bool) -> Self {
        self.settings.minimal_output = enabled;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<AnalysisSettings, SettingsError> {
        let mut settings = self.settings;
        settings.sampling = match (self.statistical, self.random_n) {
            (Some(_), Some(_)) => return Err(SettingsError::ConflictingSampling),
            (Some((confidence_level, margin_of_error)), None) => SamplingMode::Statistical {
                confidence_level,
                margin_of_error,
            },
            (None, Some(size)) => SamplingMode::RandomN { size },
            (None, None) => SamplingMode::None,
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// `[analysis]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Margin threshold in percent (0.1 - 10.0)
    #[serde(default)]
    pub threshold: Option<f64>,

    /// Rendering DPI for PDF pages
    #[serde(default)]
    pub dpi: Option<u32>,

    /// Number of worker threads
    #[serde(default)]
    pub workers: Option<usize>,
}

/// `[sampling]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    /// Enable statistical sampling
    #[serde(default)]
    pub statistical: Option<bool>,

    #[serde(default)]
    pub confidence_level: Option<f64>,

    #[serde(default)]
    pub margin_of_error: Option<f64>,

    /// Fixed sample size (random-N mode)
    #[serde(default)]
    pub random_n: Option<usize>,

    #[serde(default)]
    pub seed: Option<u64>,
}

/// `[output]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: Option<OutputFormat>,

    #[serde(default)]
    pub max_rows_per_file: Option<usize>,

    #[serde(default)]
    pub batch_size: Option<usize>,

    #[serde(default)]
    pub minimal: Option<bool>,
}

/// `[scan]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    #[serde(default)]
    pub include_pdf: Option<bool>,

    #[serde(default)]
    pub include_images: Option<bool>,

    #[serde(default)]
    pub image_extensions: Option<Vec<String>>,

    #[serde(default)]
    pub excluded_folders: Option<Vec<String>>,

    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default search path
    pub fn load() -> Result<Self, ConfigError> {
        for path in Self::search_paths() {
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading config file");
                return Self::load_from_path(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load from an explicit path, or search the default locations
    pub fn load_or_search(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific file path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Settings from file values only
    pub fn to_settings(&self) -> Result<AnalysisSettings, SettingsError> {
        self.merge_with_cli(&CliOverrides::default())
    }

    /// Merge with CLI arguments (CLI takes precedence) and validate
    pub fn merge_with_cli(&self, cli: &CliOverrides) -> Result<AnalysisSettings, SettingsError> {
        let mut builder = AnalysisSettings::builder();

        if let Some(threshold) = cli.threshold.or(self.analysis.threshold) {
            builder = builder.threshold(threshold);
        }
        if let Some(dpi) = cli.dpi.or(self.analysis.dpi) {
            builder = builder.dpi(dpi);
        }
        if let Some(workers) = cli.workers.or(self.analysis.workers) {
            builder = builder.workers(workers);
        }

        if let Some(format) = cli.format.or(self.output.format) {
            builder = builder.output_format(format);
        }
        if let Some(rows) = cli.max_rows_per_file.or(self.output.max_rows_per_file) {
            builder = builder.max_rows_per_file(rows);
        }
        if let Some(size) = cli.batch_size.or(self.output.batch_size) {
            builder = builder.batch_size(size);
        }
        if let Some(minimal) = cli.minimal.or(self.output.minimal) {
            builder = builder.minimal_output(minimal);
        }

        if let Some(include) = cli.include_pdf.or(self.scan.include_pdf) {
            builder = builder.include_pdf(include);
        }
        if let Some(include) = cli.include_images.or(self.scan.include_images) {
            builder = builder.include_images(include);
        }
        if let Some(extensions) = &self.scan.image_extensions {
            builder = builder.image_extensions(extensions.iter().cloned());
        }
        if let Some(folders) = &self.scan.excluded_folders {
            builder = builder.excluded_folders(folders.iter().cloned());
        }
        for name in &cli.exclude {
            builder = builder.exclude(name.clone());
        }
        if let Some(depth) = cli.max_depth.or(self.scan.max_depth) {
            builder = builder.max_depth(Some(depth));
        }

        let statistical = cli
            .statistical
            .or(self.sampling.statistical)
            .unwrap_or(false);
        if statistical {
            let confidence = cli
                .confidence_level
                .or(self.sampling.confidence_level)
                .unwrap_or(DEFAULT_CONFIDENCE);
            let margin = cli
                .margin_of_error
                .or(self.sampling.margin_of_error)
                .unwrap_or(DEFAULT_MARGIN_OF_ERROR);
            builder = builder.statistical_sampling(confidence, margin);
        }
        if let Some(n) = cli.random_n.or(self.sampling.random_n) {
            builder = builder.random_n(n);
        }
        builder = builder.seed(cli.seed.or(self.sampling.seed));

        builder.build()
    }

    /// Get config file search paths
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("margin-scan.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("margin-scan").join("config.toml"));
        }

        paths
    }
}

/// CLI override values for merging with config file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub threshold: Option<f64>,
    pub dpi: Option<u32>,
    pub workers: Option<usize>,
    pub format: Option<OutputFormat>,
    pub max_rows_per_file: Option<usize>,
    pub batch_size: Option<usize>,
    pub minimal: Option<bool>,
    pub statistical: Option<bool>,
    pub confidence_level: Option<f64>,
    pub margin_of_error: Option<f64>,
    pub random_n: Option<usize>,
    pub seed: Option<u64>,
    pub include_pdf: Option<bool>,
    pub include_images: Option<bool>,
    pub exclude: Vec<String>,
    pub max_depth: Option<usize>,
}

impl CliOverrides {
    /// Create new empty overrides
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = Some(dpi);
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_statistical(mut self, enabled: bool) -> Self {
        self.statistical = Some(enabled);
        self
    }

    pub fn with_random_n(mut self, size: usize) -> Self {
        self.random_n = Some(size);
        self
    }
}
