//! margin-scan - header/footer margin checker for PDFs and scanned images
//!
//! Walks a folder of PDFs and image scans, renders every page, and reports
//! pages whose header or footer band (half an inch at the analysis DPI)
//! contains ink or text. Large collections can be sampled statistically or
//! by a fixed random count, and results stream to CSV, Parquet or SQLite.
//!
//! # Features
//!
//! - **Margin Analysis** ([`margin`]) - Pixel and text-block checks of the header/footer bands
//! - **Sampling** ([`sampling`]) - Cochran sample size and seeded random selection
//! - **Enumeration** ([`enumerate`]) - Recursive discovery with excluded folders
//! - **Rendering** ([`document`]) - Poppler-backed page rasterisation and text boxes
//! - **Output** ([`output`]) - CSV, Parquet and SQLite sinks with run metadata
//! - **Pipeline** ([`pipeline`]) - Parallel orchestration with cancel and pause
//!
//! # Quick Start
//!
//! ## Checking a single image
//!
//! ```rust
//! use image::{GrayImage, Luma};
//! use margin_scan::MarginAnalyzer;
//!
//! let analyzer = MarginAnalyzer::with_dpi(1.0, 72).unwrap();
//! let page = GrayImage::from_pixel(612, 792, Luma([255]));
//! let measurements = analyzer.measure(page.width(), page.height());
//!
//! let result = analyzer.analyze_image(&page, &measurements);
//! assert!(!result.has_content());
//! ```
//!
//! ## Scanning a folder
//!
//! ```rust,no_run
//! use margin_scan::{AnalysisPipeline, AnalysisSettings, OutputFormat, SilentProgress};
//! use std::path::Path;
//!
//! let settings = AnalysisSettings::builder()
//!     .threshold(2.0)
//!     .output_format(OutputFormat::Sqlite)
//!     .statistical_sampling(0.95, 0.05)
//!     .build()
//!     .unwrap();
//!
//! let pipeline = AnalysisPipeline::new(settings).unwrap();
//! let summary = pipeline
//!     .run(Path::new("/scans"), Path::new("report"), &SilentProgress)
//!     .unwrap();
//! println!("{}", summary);
//! ```
//!
//! # Architecture
//!
//! ```text
//! FileEnumerator -> SamplingMode -> AnalysisPipeline -> ResultAccumulator -> OutputSink
//!                                         |
//!                         PageRenderer + MarginAnalyzer
//! ```

pub mod accumulator;
pub mod cli;
pub mod config;
pub mod document;
pub mod enumerate;
pub mod errors;
pub mod margin;
pub mod output;
pub mod pipeline;
pub mod record;
pub mod sampling;
pub mod util;

// Re-exports for convenience
pub use accumulator::ResultAccumulator;
pub use cli::{create_progress_bar, create_spinner, Cli, CliProgress, Commands, ExitCode, ScanArgs};
pub use config::{
    AnalysisSettings, AnalysisSettingsBuilder, CliOverrides, Config, ConfigError, SettingsError,
};
pub use document::{load_image, pdf_page_count, DocumentError, PageRenderer, PopplerRenderer};
pub use enumerate::{
    partition, EnumerateError, EnumeratedFiles, FileEnumerator, ProcessingOptions,
    ProcessingOptionsBuilder, SourceFile,
};
pub use errors::{ErrorCategory, ErrorDescriptor, ErrorLog, ErrorSeverity, ErrorSummary, ProcessingError};
pub use margin::{
    BoundingBox, MarginAnalysisResult, MarginAnalyzer, MarginError, MarginMeasurements,
    PageAssessment, TextBlock, WITHIN_MARGINS,
};
pub use output::{
    create_sink, create_sink_by_name, AnalysisMetadata, CsvSink, OutputError, OutputFormat,
    OutputSink, ParquetSink, SinkOptions, SqliteSink,
};
pub use pipeline::{
    calculate_optimal_chunk_size, process_in_chunks, AnalysisPipeline, PipelineError,
    ProcessingStats, ProgressCallback, RunControl, RunPlan, RunSummary, SamplingSummary,
    SilentProgress, StatsSnapshot,
};
pub use record::{AnalysisDetails, AnalysisRecord, FileType, PROCESSING_FAILED};
pub use sampling::{
    sampling_rng, SamplingCalculator, SamplingError, SamplingMode, SamplingOutcome,
    SamplingParameters,
};
pub use util::{ensure_dir_writable, format_duration, format_eta, format_rate, percentage};

/// Exit codes for CLI (prefer the `ExitCode` enum)
pub mod exit_codes {
    use super::ExitCode;

    pub const SUCCESS: i32 = ExitCode::Success as i32;
    pub const GENERAL_ERROR: i32 = ExitCode::GeneralError as i32;
    pub const INVALID_ARGS: i32 = ExitCode::InvalidArgs as i32;
    pub const INPUT_NOT_FOUND: i32 = ExitCode::InputNotFound as i32;
    pub const OUTPUT_ERROR: i32 = ExitCode::OutputError as i32;
    pub const PROCESSING_ERROR: i32 = ExitCode::ProcessingError as i32;
    pub const CANCELLED: i32 = ExitCode::Cancelled as i32;
    pub const EXTERNAL_TOOL_ERROR: i32 = ExitCode::ExternalToolError as i32;
}
