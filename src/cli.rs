//! CLI interface module
//!
//! Provides command-line interface using clap derive macros.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::CliOverrides;
use crate::output::OutputFormat;
use crate::pipeline::{PipelineError, ProgressCallback, StatsSnapshot};
use crate::util::{format_eta, format_rate};

/// Exit codes for the CLI
///
/// These codes follow standard Unix conventions and provide
/// specific error categories for scripting and automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// Invalid arguments or settings
    InvalidArgs = 2,
    InputNotFound = 3,
    /// Output could not be written
    OutputError = 4,
    ProcessingError = 5,
    /// Run stopped early; partial results were written
    Cancelled = 6,
    /// pdftoppm / pdftotext missing
    ExternalToolError = 7,
}

impl ExitCode {
    /// Convert to process exit code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::GeneralError => "General error",
            ExitCode::InvalidArgs => "Invalid arguments",
            ExitCode::InputNotFound => "Input directory not found",
            ExitCode::OutputError => "Output error (permission denied, disk full, etc.)",
            ExitCode::ProcessingError => "Processing error",
            ExitCode::Cancelled => "Run cancelled after a critical error",
            ExitCode::ExternalToolError => "External tool error (pdftoppm, pdftotext)",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code() as u8)
    }
}

impl From<&PipelineError> for ExitCode {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::Settings(_) | PipelineError::Margin(_) | PipelineError::Sampling(_) => {
                ExitCode::InvalidArgs
            }
            PipelineError::Enumerate(_) => ExitCode::InputNotFound,
            PipelineError::Output(_) => ExitCode::OutputError,
            PipelineError::ThreadPool(_) => ExitCode::GeneralError,
        }
    }
}

/// Header/footer margin checker for PDFs and scanned images
#[derive(Parser, Debug)]
#[command(name = "margin-scan")]
#[command(version)]
#[command(
    about = "Detect content in the header and footer margins of PDFs and scanned images",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a folder and write a margin report
    Scan(ScanArgs),
    /// Show system information
    Info,
}

fn parse_format(value: &str) -> Result<OutputFormat, String> {
    value.parse::<OutputFormat>().map_err(|e| e.to_string())
}

/// Arguments for the scan command
#[derive(clap::Args, Debug)]
pub struct ScanArgs {
    /// Folder to scan (recursively)
    pub input: PathBuf,

    /// Output base path; the extension follows the format
    #[arg(short, long, default_value = "margin_analysis")]
    pub output: PathBuf,

    /// Output format: csv, parquet or sqlite
    #[arg(short, long, value_parser = parse_format)]
    pub format: Option<OutputFormat>,

    /// Margin content threshold in percent (0.1-10)
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Rendering DPI for PDF pages and margin size
    #[arg(long)]
    pub dpi: Option<u32>,

    /// Maximum rows per CSV file
    #[arg(long = "max-rows")]
    pub max_rows: Option<usize>,

    /// Records buffered before each write
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Enable statistical sampling
    #[arg(long)]
    pub sample: bool,

    /// Confidence level for statistical sampling (0.90, 0.95, 0.99)
    #[arg(long, requires = "sample")]
    pub confidence: Option<f64>,

    /// Margin of error for statistical sampling
    #[arg(long, requires = "sample")]
    pub margin: Option<f64>,

    /// Analyse N randomly chosen files
    #[arg(long, conflicts_with = "sample")]
    pub random_n: Option<usize>,

    /// Seed for reproducible sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Skip PDF files
    #[arg(long = "no-pdf")]
    pub no_pdf: bool,

    /// Skip image files
    #[arg(long = "no-images")]
    pub no_images: bool,

    /// Folder name to skip (repeatable)
    #[arg(long, value_name = "NAME")]
    pub exclude: Vec<String>,

    /// Maximum recursion depth below the input folder
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Number of parallel threads
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Only write File, Page and Content Status
    #[arg(long)]
    pub minimal: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Show execution plan without processing
    #[arg(long)]
    pub dry_run: bool,

    /// Config file (default: ./margin-scan.toml, then the user config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ScanArgs {
    /// Overrides for values given on the command line
    ///
    /// Flags left at their defaults stay `None` so the config file can
    /// supply them.
    pub fn to_overrides(&self) -> CliOverrides {
        CliOverrides {
            threshold: self.threshold,
            dpi: self.dpi,
            workers: self.threads,
            format: self.format,
            max_rows_per_file: self.max_rows,
            batch_size: self.batch_size,
            minimal: self.minimal.then_some(true),
            statistical: self.sample.then_some(true),
            confidence_level: self.confidence,
            margin_of_error: self.margin,
            random_n: self.random_n,
            seed: self.seed,
            include_pdf: self.no_pdf.then_some(false),
            include_images: self.no_images.then_some(false),
            exclude: self.exclude.clone(),
            max_depth: self.max_depth,
        }
    }

    /// Default log level for the tracing filter
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Create a styled progress bar for file processing
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files {msg}")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Create a spinner for indeterminate progress
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Terminal progress for `scan`
///
/// A spinner while a step runs, replaced by a bar once the step reports
/// file counts.
pub struct CliProgress {
    verbose: u8,
    quiet: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    pub fn new(verbose: u8, quiet: bool) -> Self {
        Self {
            verbose,
            quiet,
            bar: Mutex::new(None),
        }
    }

    fn replace_bar(&self, bar: Option<ProgressBar>) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(old) = slot.take() {
                old.finish_and_clear();
            }
            *slot = bar;
        }
    }

    fn println(&self, line: String) {
        match self.bar.lock().ok().and_then(|slot| slot.clone()) {
            Some(bar) => bar.println(line),
            None => eprintln!("{}", line),
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_step_start(&self, step: &str) {
        if self.quiet {
            return;
        }
        self.replace_bar(Some(create_spinner(step)));
    }

    fn on_step_progress(&self, current: usize, total: usize) {
        if self.quiet {
            return;
        }
        if let Ok(mut slot) = self.bar.lock() {
            let needs_bar = slot.as_ref().map_or(true, |b| b.length() != Some(total as u64));
            if needs_bar {
                if let Some(old) = slot.take() {
                    old.finish_and_clear();
                }
                *slot = Some(create_progress_bar(total as u64));
            }
            if let Some(bar) = slot.as_ref() {
                bar.set_position(current as u64);
            }
        }
    }

    fn on_step_complete(&self, step: &str, message: &str) {
        if self.quiet {
            return;
        }
        self.replace_bar(None);
        eprintln!("  {}: {}", step, message);
    }

    fn on_debug(&self, message: &str) {
        if self.verbose > 1 && !self.quiet {
            self.println(format!("    [DEBUG] {}", message));
        }
    }

    // indicatif's own {eta} would count paused time
    fn on_stats(&self, stats: &StatsSnapshot) {
        if self.quiet {
            return;
        }
        if let Some(bar) = self.bar.lock().ok().and_then(|slot| slot.clone()) {
            bar.set_message(format!(
                "{}, ETA {}",
                format_rate(stats.rate),
                format_eta(stats.eta)
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn scan_args(args: &[&str]) -> ScanArgs {
        let mut argv = vec!["margin-scan", "scan"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Scan(args) => args,
            Commands::Info => panic!("Expected Scan command"),
        }
    }

    #[test]
    fn test_cli_parse() {
        // Verify CLI can be built
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_display() {
        let mut cmd = Cli::command();
        let help = cmd.render_help().to_string();
        assert!(help.contains("margin-scan"));
        assert!(help.contains("scan"));
        assert!(help.contains("info"));
    }

    #[test]
    fn test_missing_input_error() {
        let result = Cli::try_parse_from(["margin-scan", "scan"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn test_default_values() {
        let args = scan_args(&["/data"]);
        assert_eq!(args.output, PathBuf::from("margin_analysis"));
        assert!(args.format.is_none());
        assert!(!args.sample);
        assert!(!args.dry_run);
        assert_eq!(args.log_level(), "info");

        // defaults leave everything to the config file
        let overrides = args.to_overrides();
        assert_eq!(overrides, CliOverrides::default());
    }

    #[test]
    fn test_option_parsing() {
        let args = scan_args(&[
            "/data",
            "--format",
            "parquet",
            "--threshold",
            "2.5",
            "--dpi",
            "300",
            "--sample",
            "--confidence",
            "0.99",
            "--seed",
            "42",
            "--no-pdf",
            "--exclude",
            "tmp",
            "--exclude",
            "old",
            "--minimal",
            "-vv",
        ]);

        assert_eq!(args.format, Some(OutputFormat::Parquet));
        assert_eq!(args.log_level(), "trace");

        let overrides = args.to_overrides();
        assert_eq!(overrides.threshold, Some(2.5));
        assert_eq!(overrides.dpi, Some(300));
        assert_eq!(overrides.statistical, Some(true));
        assert_eq!(overrides.confidence_level, Some(0.99));
        assert_eq!(overrides.seed, Some(42));
        assert_eq!(overrides.include_pdf, Some(false));
        assert_eq!(overrides.include_images, None);
        assert_eq!(overrides.exclude, vec!["tmp", "old"]);
        assert_eq!(overrides.minimal, Some(true));
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!(scan_args(&["/d", "-f", "db"]).format, Some(OutputFormat::Sqlite));
        assert!(Cli::try_parse_from(["margin-scan", "scan", "/d", "-f", "xlsx"]).is_err());
    }

    #[test]
    fn test_sampling_flags_conflict() {
        let result = Cli::try_parse_from(["margin-scan", "scan", "/d", "--sample", "--random-n", "5"]);
        assert!(result.is_err());

        let result = Cli::try_parse_from(["margin-scan", "scan", "/d", "--confidence", "0.9"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_quiet_lowers_log_level() {
        assert_eq!(scan_args(&["/d", "-q", "-v"]).log_level(), "warn");
    }

    #[test]
    fn test_info_command() {
        let cli = Cli::try_parse_from(["margin-scan", "info"]).unwrap();
        assert!(matches!(cli.command, Commands::Info));
    }

    #[test]
    fn test_progress_bar_display() {
        let pb = create_progress_bar(100);
        assert_eq!(pb.length(), Some(100));

        pb.set_position(50);
        assert_eq!(pb.position(), 50);

        pb.finish_with_message("done");
    }

    #[test]
    fn test_spinner_creation() {
        let spinner = create_spinner("Enumerating files...");
        assert_eq!(spinner.message(), "Enumerating files...");
        spinner.finish_with_message("Complete");
    }

    #[test]
    fn test_cli_progress_switches_to_bar() {
        let progress = CliProgress::new(0, false);
        progress.on_step_start("Analysing files...");
        progress.on_step_progress(3, 10);
        {
            let slot = progress.bar.lock().unwrap();
            let bar = slot.as_ref().unwrap();
            assert_eq!(bar.length(), Some(10));
            assert_eq!(bar.position(), 3);
        }
        progress.on_step_complete("Analysing files", "10 records");
        assert!(progress.bar.lock().unwrap().is_none());
    }

    #[test]
    fn test_quiet_progress_creates_nothing() {
        let progress = CliProgress::new(2, true);
        progress.on_step_start("Enumerating files...");
        progress.on_step_progress(1, 2);
        assert!(progress.bar.lock().unwrap().is_none());
    }

    #[test]
    fn test_progress_bar_shows_rate_and_eta() {
        let progress = CliProgress::new(0, false);
        progress.on_step_progress(1, 4);
        progress.on_stats(&StatsSnapshot {
            total_files: 4,
            files_done: 1,
            records: 1,
            succeeded: 1,
            failed: 0,
            flagged: 0,
            elapsed: std::time::Duration::from_secs(1),
            rate: 2.0,
            eta: Some(std::time::Duration::from_secs(125)),
        });

        let bar = progress.bar.lock().unwrap().clone().unwrap();
        assert_eq!(bar.message(), "2.0/s, ETA 2m 5s");
    }

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::GeneralError.code(), 1);
        assert_eq!(ExitCode::InvalidArgs.code(), 2);
        assert_eq!(ExitCode::InputNotFound.code(), 3);
        assert_eq!(ExitCode::OutputError.code(), 4);
        assert_eq!(ExitCode::ProcessingError.code(), 5);
        assert_eq!(ExitCode::Cancelled.code(), 6);
        assert_eq!(ExitCode::ExternalToolError.code(), 7);
    }

    #[test]
    fn test_exit_code_descriptions() {
        assert_eq!(ExitCode::Success.description(), "Success");
        assert!(!ExitCode::Cancelled.description().is_empty());
        assert!(ExitCode::ExternalToolError.description().contains("pdftoppm"));
    }

    #[test]
    fn test_exit_code_from_pipeline_error() {
        let err = PipelineError::ThreadPool("boom".into());
        assert_eq!(ExitCode::from(&err), ExitCode::GeneralError);

        let err = PipelineError::Output(crate::output::OutputError::Closed);
        assert_eq!(ExitCode::from(&err), ExitCode::OutputError);

        let code: i32 = ExitCode::ExternalToolError.into();
        assert_eq!(code, 7);
    }
}
