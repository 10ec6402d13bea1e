//! Analysis pipeline
//!
//! Runs one scan from an input folder to a finished output file.
//!
//! ## Processing Steps
//!
//! 1. Enumerate PDFs and images below the input root
//! 2. Apply statistical or random-N sampling
//! 3. Create the output sink behind a [`ResultAccumulator`]
//! 4. Analyse PDFs file by file (pages in parallel, written in page order)
//! 5. Analyse images in parallel
//! 6. Final flush and sink cleanup, also after cancellation

use rayon::prelude::*;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::accumulator::ResultAccumulator;
use crate::config::{AnalysisSettings, SettingsError};
use crate::document::{DocumentError, PageRenderer, PopplerRenderer};
use crate::enumerate::{partition, EnumerateError, EnumeratedFiles, SourceFile};
use crate::errors::{ErrorLog, ErrorSummary};
use crate::margin::{MarginAnalysisResult, MarginAnalyzer, MarginError, WITHIN_MARGINS};
use crate::output::{create_sink, AnalysisMetadata, OutputError, OutputFormat};
use crate::record::{AnalysisRecord, FileType, PROCESSING_FAILED};
use crate::sampling::{sampling_rng, SamplingError, SamplingMode, SamplingOutcome};
use crate::util::{format_duration, format_rate, percentage};

// ============================================================
// Memory Management Utilities
// ============================================================

/// Minimum chunk size for parallel processing
const MIN_CHUNK_SIZE: usize = 4;

/// Default memory limit if not specified (4GB)
const DEFAULT_MEMORY_LIMIT_MB: usize = 4096;

/// Largest common page format (US Letter), in inches
const PAGE_AREA_SQ_INCHES: f64 = 8.5 * 11.0;

/// Poll interval while a run is paused
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Number of progress updates averaged for the processing rate
pub const RATE_WINDOW: usize = 5;

/// Estimated peak memory of one rendered page
///
/// Covers the encoded PNG from the renderer plus the decoded luminance
/// raster.
pub fn estimated_page_memory_mb(dpi: u32) -> usize {
    let pixels = PAGE_AREA_SQ_INCHES * (dpi as f64).powi(2);
    ((pixels * 2.0) / (1024.0 * 1024.0)).ceil().max(1.0) as usize
}

/// Calculate optimal chunk size based on memory constraints
///
/// # Arguments
/// * `total_items` - Total number of items to process
/// * `max_memory_mb` - Maximum memory to use (0 = use available memory)
/// * `threads` - Number of parallel threads
/// * `item_memory_mb` - Estimated memory per item
///
/// # Returns
/// Optimal chunk size that fits within memory constraints
pub fn calculate_optimal_chunk_size(
    total_items: usize,
    max_memory_mb: usize,
    threads: usize,
    item_memory_mb: usize,
) -> usize {
    let memory_limit = if max_memory_mb == 0 {
        get_available_memory_mb().unwrap_or(DEFAULT_MEMORY_LIMIT_MB)
    } else {
        max_memory_mb
    };

    // Reserve 50% of available memory for OS and other processes
    let usable_memory = memory_limit / 2;

    let max_concurrent = threads.max(1);
    let per_thread_capacity = usable_memory / item_memory_mb.max(1);
    let concurrent_capacity = per_thread_capacity.min(max_concurrent * 2);

    let chunk_size = concurrent_capacity.max(MIN_CHUNK_SIZE);

    // Don't exceed total items
    chunk_size.min(total_items).max(1)
}

/// Get available system memory in MB
#[cfg(target_os = "linux")]
fn get_available_memory_mb() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if line.starts_with("MemAvailable:") {
            let kb: usize = line.split_whitespace().nth(1)?.parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn get_available_memory_mb() -> Option<usize> {
    // For non-Linux systems, use a conservative default
    Some(DEFAULT_MEMORY_LIMIT_MB)
}

/// Process items in chunks for memory-controlled parallel execution
///
/// Each chunk is processed in parallel using rayon, but chunks are processed
/// sequentially to limit peak memory usage.
///
/// # Arguments
/// * `items` - Items to process
/// * `chunk_size` - Size of each processing chunk (0 = process all at once)
/// * `processor` - Function to apply to each item
/// * `progress` - Optional progress callback (current, total)
///
/// # Returns
/// Vector of results in the same order as input items
pub fn process_in_chunks<T, R, F, P>(
    items: &[T],
    chunk_size: usize,
    processor: F,
    progress: Option<&P>,
) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
    P: Fn(usize, usize) + Sync,
{
    let total = items.len();
    if total == 0 {
        return vec![];
    }

    let effective_chunk_size = if chunk_size == 0 { total } else { chunk_size };
    let completed = AtomicUsize::new(0);
    let mut results = Vec::with_capacity(total);

    for chunk in items.chunks(effective_chunk_size) {
        // indexed collect keeps input order
        let chunk_results: Vec<R> = chunk
            .par_iter()
            .map(|item| {
                let result = processor(item);
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(cb) = progress {
                    cb(done, total);
                }
                result
            })
            .collect();

        results.extend(chunk_results);
    }

    results
}

// ============================================================
// Progress and run control
// ============================================================

/// Progress callback for pipeline steps
pub trait ProgressCallback: Send + Sync {
    /// Called when a new step starts
    fn on_step_start(&self, step: &str);
    /// Called to report progress within a step
    fn on_step_progress(&self, current: usize, total: usize);
    /// Called when a step completes
    fn on_step_complete(&self, step: &str, message: &str);
    /// Called for debug/verbose messages
    fn on_debug(&self, message: &str);
    /// Called with the run counters after each finished file
    fn on_stats(&self, _stats: &StatsSnapshot) {}
}

/// No-op progress callback (silent mode)
pub struct SilentProgress;

impl ProgressCallback for SilentProgress {
    fn on_step_start(&self, _step: &str) {}
    fn on_step_progress(&self, _current: usize, _total: usize) {}
    fn on_step_complete(&self, _step: &str, _message: &str) {}
    fn on_debug(&self, _message: &str) {}
}

#[derive(Debug, Default)]
struct PauseClock {
    started: Option<Instant>,
    total: Duration,
}

/// Run-scoped cancel and pause flags
///
/// Checked before every file and every page. Cancelling lets in-flight
/// work finish; nothing new starts. Pausing blocks workers until resumed
/// or cancelled; paused time is excluded from the run statistics.
#[derive(Debug, Default)]
pub struct RunControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    clock: Mutex<PauseClock>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            if let Ok(mut clock) = self.clock.lock() {
                clock.started = Some(Instant::now());
            }
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            if let Ok(mut clock) = self.clock.lock() {
                if let Some(started) = clock.started.take() {
                    clock.total += started.elapsed();
                }
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Total time spent paused, including a pause in progress
    pub fn paused_duration(&self) -> Duration {
        self.clock
            .lock()
            .map(|clock| clock.total + clock.started.map_or(Duration::ZERO, |s| s.elapsed()))
            .unwrap_or_default()
    }

    /// Block while paused
    ///
    /// Returns `false` when the run has been cancelled.
    pub fn wait_if_paused(&self) -> bool {
        while self.is_paused() && !self.is_cancelled() {
            std::thread::sleep(PAUSE_POLL);
        }
        !self.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct StatsState {
    total_files: usize,
    files_done: usize,
    records: usize,
    succeeded: usize,
    failed: usize,
    flagged: usize,
    last_sample: Option<(Duration, usize)>,
    rates: VecDeque<f64>,
}

impl StatsState {
    /// Push the rate since the previous update into the moving window
    fn update_rate(&mut self, now: Duration) {
        let (since, done_before) = self.last_sample.unwrap_or((Duration::ZERO, 0));
        let dt = now.saturating_sub(since).as_secs_f64();
        if dt > 0.0 {
            self.rates
                .push_back((self.files_done - done_before) as f64 / dt);
            if self.rates.len() > RATE_WINDOW {
                self.rates.pop_front();
            }
        }
        self.last_sample = Some((now, self.files_done));
    }

    fn rate(&self) -> f64 {
        if self.rates.is_empty() {
            0.0
        } else {
            self.rates.iter().sum::<f64>() / self.rates.len() as f64
        }
    }
}

/// Point-in-time view of [`ProcessingStats`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub total_files: usize,
    pub files_done: usize,
    pub records: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records with content in a margin
    pub flagged: usize,
    /// Wall time minus paused time
    pub elapsed: Duration,
    /// Files per second over the last few updates
    pub rate: f64,
    pub eta: Option<Duration>,
}

/// Thread-safe run counters and timing
pub struct ProcessingStats {
    control: Arc<RunControl>,
    started: Instant,
    state: Mutex<StatsState>,
}

impl ProcessingStats {
    pub fn new(total_files: usize, control: Arc<RunControl>) -> Self {
        Self {
            control,
            started: Instant::now(),
            state: Mutex::new(StatsState {
                total_files,
                ..Default::default()
            }),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started
            .elapsed()
            .saturating_sub(self.control.paused_duration())
    }

    /// Count a finished file; returns the number of files done
    pub fn record_file(&self) -> usize {
        let now = self.elapsed();
        match self.state.lock() {
            Ok(mut state) => {
                state.files_done += 1;
                state.update_rate(now);
                state.files_done
            }
            Err(_) => 0,
        }
    }

    /// Count one analysis record
    pub fn record_result(&self, record: &AnalysisRecord) {
        if let Ok(mut state) = self.state.lock() {
            state.records += 1;
            if record.is_error() {
                state.failed += 1;
            } else {
                state.succeeded += 1;
                if record.content_status != WITHIN_MARGINS {
                    state.flagged += 1;
                }
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.elapsed();
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rate = state.rate();
        let remaining = state.total_files.saturating_sub(state.files_done);
        let eta = (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate));

        StatsSnapshot {
            total_files: state.total_files,
            files_done: state.files_done,
            records: state.records,
            succeeded: state.succeeded,
            failed: state.failed,
            flagged: state.flagged,
            elapsed,
            rate,
            eta,
        }
    }
}

// ============================================================
// Errors, plan and summary
// ============================================================

/// Pipeline processing error
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Invalid analyzer configuration: {0}")]
    Margin(#[from] MarginError),

    #[error("Enumeration failed: {0}")]
    Enumerate(#[from] EnumerateError),

    #[error("Sampling failed: {0}")]
    Sampling(#[from] SamplingError),

    #[error("Output failed: {0}")]
    Output(#[from] OutputError),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

/// Enumerated and sampled input of a run
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub root: PathBuf,
    pub population: EnumeratedFiles,
    pub selection: SamplingOutcome<SourceFile>,
    pub metadata: AnalysisMetadata,
}

impl RunPlan {
    pub fn selected(&self) -> &[SourceFile] {
        &self.selection.selected
    }

    pub fn selected_pdfs(&self) -> usize {
        self.selected().iter().filter(|f| f.kind == FileType::Pdf).count()
    }

    pub fn selected_images(&self) -> usize {
        self.selected().iter().filter(|f| f.kind == FileType::Image).count()
    }
}

/// Sampling part of a run report
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSummary {
    pub method: &'static str,
    pub population_size: usize,
    pub selected: usize,
    pub sample_size: Option<usize>,
    pub random_n_size: Option<usize>,
    pub confidence_level: Option<f64>,
    pub margin_of_error: Option<f64>,
    /// Informational only
    pub estimated_margin_of_error: Option<f64>,
}

impl SamplingSummary {
    fn new(mode: &SamplingMode, selection: &SamplingOutcome<SourceFile>) -> Self {
        let (confidence_level, margin_of_error) = match *mode {
            SamplingMode::Statistical {
                confidence_level,
                margin_of_error,
            } => (Some(confidence_level), Some(margin_of_error)),
            _ => (None, None),
        };
        Self {
            method: mode.method_name(),
            population_size: selection.population_size,
            selected: selection.selected.len(),
            sample_size: selection.sample_size,
            random_n_size: selection.random_n_size,
            confidence_level,
            margin_of_error,
            estimated_margin_of_error: selection.estimated_margin_of_error,
        }
    }
}

/// Final report of a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub output_format: OutputFormat,
    pub output_paths: Vec<PathBuf>,
    pub files_found: usize,
    pub files_selected: usize,
    pub files_processed: usize,
    pub records_written: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    /// Records with content in a margin
    pub flagged_records: usize,
    pub skipped_directories: usize,
    pub sampling: SamplingSummary,
    pub errors: ErrorSummary,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub rate: f64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cancelled {
            writeln!(f, "Analysis cancelled")?;
        } else {
            writeln!(f, "Analysis complete")?;
        }
        writeln!(f, "  Files found:    {}", self.files_found)?;
        writeln!(
            f,
            "  Files analysed: {} of {} selected",
            self.files_processed, self.files_selected
        )?;
        writeln!(
            f,
            "  Records:        {} ({} succeeded, {} failed)",
            self.records_written, self.successful_records, self.failed_records
        )?;
        writeln!(
            f,
            "  Margin issues:  {} ({:.1}% of analysed records)",
            self.flagged_records,
            percentage(self.flagged_records, self.successful_records)
        )?;
        if self.skipped_directories > 0 {
            writeln!(f, "  Skipped dirs:   {}", self.skipped_directories)?;
        }
        writeln!(
            f,
            "  Elapsed:        {} ({})",
            format_duration(self.elapsed),
            format_rate(self.rate)
        )?;

        if self.sampling.method != "none" {
            writeln!(f, "Sampling: {}", self.sampling.method)?;
            writeln!(
                f,
                "  Population: {}, selected: {}",
                self.sampling.population_size, self.sampling.selected
            )?;
            if let (Some(conf), Some(margin)) =
                (self.sampling.confidence_level, self.sampling.margin_of_error)
            {
                writeln!(
                    f,
                    "  Confidence: {:.0}%, margin of error: {:.1}%",
                    conf * 100.0,
                    margin * 100.0
                )?;
            }
            if let Some(estimated) = self.sampling.estimated_margin_of_error {
                writeln!(f, "  Estimated margin of error: {:.2}%", estimated * 100.0)?;
            }
        }

        writeln!(f, "Output ({}):", self.output_format)?;
        for path in &self.output_paths {
            writeln!(f, "  {}", path.display())?;
        }
        write!(f, "{}", self.errors)
    }
}

// ============================================================
// Pipeline
// ============================================================

/// Margin analysis pipeline
pub struct AnalysisPipeline {
    settings: AnalysisSettings,
    analyzer: MarginAnalyzer,
    renderer: Arc<dyn PageRenderer>,
    control: Arc<RunControl>,
}

impl AnalysisPipeline {
    /// Create a pipeline using the Poppler renderer
    pub fn new(settings: AnalysisSettings) -> Result<Self, PipelineError> {
        settings.validate()?;
        let analyzer = settings.analyzer()?;
        Ok(Self {
            settings,
            analyzer,
            renderer: Arc::new(PopplerRenderer::new()),
            control: Arc::new(RunControl::new()),
        })
    }

    /// Replace the page renderer
    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// Shared handle for cancelling or pausing the run
    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    /// Enumerate and sample without analysing anything
    pub fn plan<P: ProgressCallback>(&self, root: &Path, progress: &P) -> Result<RunPlan, PipelineError> {
        progress.on_step_start("Enumerating files...");
        let population = self
            .settings
            .enumerator()
            .enumerate(root, |message: &str| progress.on_debug(message))?;
        progress.on_step_complete(
            "Enumerating files",
            &format!(
                "{} files ({} PDF, {} images)",
                population.len(),
                population.pdf_count(),
                population.image_count()
            ),
        );

        let mut rng = sampling_rng(self.settings.seed);
        let mut selection = self.settings.sampling.apply(&population.files, &mut rng)?;
        selection.selected.sort();
        if self.settings.sampling.is_enabled() {
            progress.on_step_complete(
                "Sampling",
                &format!(
                    "{} of {} files selected ({})",
                    selection.selected.len(),
                    population.len(),
                    self.settings.sampling.method_name()
                ),
            );
        }

        let metadata = AnalysisMetadata::new(self.settings.threshold, &self.settings.sampling)
            .with_population(population.len(), selection.sample_size, selection.random_n_size);

        Ok(RunPlan {
            root: root.to_path_buf(),
            population,
            selection,
            metadata,
        })
    }

    /// Plan and execute a full run
    pub fn run<P: ProgressCallback>(
        &self,
        root: &Path,
        output: &Path,
        progress: &P,
    ) -> Result<RunSummary, PipelineError> {
        let plan = self.plan(root, progress)?;
        self.execute(&plan, output, progress)
    }

    /// Analyse a planned selection and write it to `output`
    pub fn execute<P: ProgressCallback>(
        &self,
        plan: &RunPlan,
        output: &Path,
        progress: &P,
    ) -> Result<RunSummary, PipelineError> {
        let options = self.settings.processing_options();
        let threads = if options.parallel { self.settings.workers } else { 1 };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;

        let sink = create_sink(
            self.settings.output_format,
            output,
            &self.settings.sink_options(),
            plan.metadata.clone(),
        )?;
        let accumulator = ResultAccumulator::new(sink, options.batch_size);
        let errors = ErrorLog::new();
        let (pdfs, images) = partition(plan.selected());
        let stats = ProcessingStats::new(pdfs.len() + images.len(), Arc::clone(&self.control));

        tracing::info!(
            pdfs = pdfs.len(),
            images = images.len(),
            workers = threads,
            format = %self.settings.output_format,
            "starting analysis"
        );
        progress.on_step_start("Analysing files...");

        let processed = pool.install(|| -> Result<(), OutputError> {
            let ctx = RunContext {
                accumulator: &accumulator,
                errors: &errors,
                stats: &stats,
                progress,
            };
            self.process_pdfs(&pdfs, &ctx)?;
            self.process_images(&images, &ctx)
        });

        // always finalize, even after cancellation or a failed batch
        let flushed = accumulator.flush(true);
        let cleaned = accumulator.cleanup();
        processed?;
        flushed?;
        cleaned?;

        let snapshot = stats.snapshot();
        let mut output_paths = accumulator.output_paths();
        if output_paths.is_empty() {
            output_paths.extend(accumulator.output_path());
        }
        let summary = RunSummary {
            run_id: plan.metadata.run_id.clone(),
            output_format: self.settings.output_format,
            output_paths,
            files_found: plan.population.len(),
            files_selected: plan.selected().len(),
            files_processed: snapshot.files_done,
            records_written: accumulator.written(),
            successful_records: snapshot.succeeded,
            failed_records: snapshot.failed,
            flagged_records: snapshot.flagged,
            skipped_directories: plan.population.skipped.len(),
            sampling: SamplingSummary::new(&self.settings.sampling, &plan.selection),
            errors: errors.summary(),
            cancelled: self.control.is_cancelled(),
            elapsed: snapshot.elapsed,
            rate: snapshot.rate,
        };

        progress.on_step_complete(
            "Analysing files",
            &format!(
                "{} records, {} with margin content",
                summary.records_written, summary.flagged_records
            ),
        );
        tracing::info!(
            records = summary.records_written,
            flagged = summary.flagged_records,
            errors = summary.errors.total,
            cancelled = summary.cancelled,
            "analysis finished"
        );
        Ok(summary)
    }

    fn process_pdfs<P: ProgressCallback>(&self, pdfs: &[PathBuf], ctx: &RunContext<'_, P>) -> Result<(), OutputError> {
        for path in pdfs {
            if !self.control.wait_if_paused() {
                break;
            }
            for record in self.analyze_pdf(path) {
                self.handle_record(record, ctx)?;
            }
            ctx.file_done();
        }
        Ok(())
    }

    fn process_images<P: ProgressCallback>(
        &self,
        images: &[PathBuf],
        ctx: &RunContext<'_, P>,
    ) -> Result<(), OutputError> {
        images.par_iter().try_for_each(|path| {
            if !self.control.wait_if_paused() {
                return Ok(());
            }
            self.handle_record(self.analyze_image_file(path), ctx)?;
            ctx.file_done();
            Ok(())
        })
    }

    /// Analyse every page of a PDF, in page order
    ///
    /// Failures become records; pages skipped because of cancellation are
    /// omitted.
    pub fn analyze_pdf(&self, path: &Path) -> Vec<AnalysisRecord> {
        let page_count = match self.renderer.page_count(path) {
            Ok(count) => count,
            Err(e @ DocumentError::Encrypted(_)) => {
                return vec![AnalysisRecord::encrypted(path, e.to_string())];
            }
            Err(e) => return vec![AnalysisRecord::failed_file(path, FileType::Pdf, e.descriptor())],
        };
        tracing::debug!(file = %path.display(), pages = page_count, "analysing PDF");

        let pages: Vec<usize> = (0..page_count).collect();
        let chunk_size = calculate_optimal_chunk_size(
            page_count,
            0,
            self.settings.workers,
            estimated_page_memory_mb(self.settings.dpi),
        );

        process_in_chunks(
            &pages,
            chunk_size,
            |&index| {
                if !self.control.wait_if_paused() {
                    return None;
                }
                let record = self.analyze_page(path, index);
                self.cancel_on_critical(&record);
                Some(record)
            },
            None::<&fn(usize, usize)>,
        )
        .into_iter()
        .flatten()
        .collect()
    }

    fn analyze_page(&self, path: &Path, index: usize) -> AnalysisRecord {
        let page = index as u32 + 1;
        match self.measure_page(path, index) {
            Ok((text, image)) => AnalysisRecord::pdf_page(path, page, text, image),
            Err(e) => AnalysisRecord::failed_page(path, page, e.descriptor()),
        }
    }

    fn measure_page(
        &self,
        path: &Path,
        index: usize,
    ) -> Result<(MarginAnalysisResult, MarginAnalysisResult), DocumentError> {
        let dpi = self.settings.dpi;
        let gray = self.renderer.render_page(path, index, dpi)?;
        let measurements = self.analyzer.measure(gray.width(), gray.height());
        let image = self.analyzer.analyze_image(&gray, &measurements);

        let blocks = self.renderer.text_blocks(path, index, dpi)?;
        let text = self.analyzer.analyze_text_blocks(&blocks, &measurements);
        tracing::trace!(file = %path.display(), page = index + 1, blocks = blocks.len(), "page analysed");
        Ok((text, image))
    }

    /// Analyse a standalone image file
    pub fn analyze_image_file(&self, path: &Path) -> AnalysisRecord {
        match crate::document::load_image(path) {
            Ok(gray) => {
                let measurements = self.analyzer.measure(gray.width(), gray.height());
                AnalysisRecord::image(path, self.analyzer.analyze_image(&gray, &measurements))
            }
            Err(e) => AnalysisRecord::failed_file(path, FileType::Image, e.descriptor()),
        }
    }

    /// Stop starting new pages and files once a record carries a CRITICAL error
    fn cancel_on_critical(&self, record: &AnalysisRecord) {
        let critical = record
            .error
            .as_ref()
            .is_some_and(|error| error.severity.is_critical());
        if critical && !self.control.is_cancelled() {
            tracing::error!(file = %record.file.display(), "critical error, cancelling the run");
            self.control.cancel();
        }
    }

    fn handle_record<P: ProgressCallback>(
        &self,
        record: AnalysisRecord,
        ctx: &RunContext<'_, P>,
    ) -> Result<(), OutputError> {
        if let Some(error) = &record.error {
            let page = (record.content_status != PROCESSING_FAILED).then_some(record.page);
            ctx.errors.record(&record.file, page, error);
        }
        self.cancel_on_critical(&record);
        ctx.stats.record_result(&record);

        let record = if self.settings.minimal_output {
            record.into_minimal()
        } else {
            record
        };
        if let Some(path) = ctx.accumulator.add(record)? {
            ctx.progress
                .on_debug(&format!("Batch written to {}", path.display()));
        }
        Ok(())
    }
}

/// Shared per-run state handed to the workers
struct RunContext<'a, P: ProgressCallback> {
    accumulator: &'a ResultAccumulator,
    errors: &'a ErrorLog,
    stats: &'a ProcessingStats,
    progress: &'a P,
}

impl<P: ProgressCallback> RunContext<'_, P> {
    fn file_done(&self) {
        let done = self.stats.record_file();
        let snapshot = self.stats.snapshot();
        self.progress.on_step_progress(done, snapshot.total_files);
        self.progress.on_stats(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorCategory, ErrorSeverity};
    use crate::margin::{BoundingBox, TextBlock};
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    const TEST_DPI: u32 = 36;

    #[derive(Clone, Copy)]
    enum Behaviour {
        HeaderTextOn(usize),
        Encrypted,
        MissingTool,
    }

    struct FakeRenderer {
        pages: usize,
        behaviour: Behaviour,
        renders: AtomicUsize,
    }

    impl FakeRenderer {
        fn new(pages: usize, behaviour: Behaviour) -> Self {
            Self {
                pages,
                behaviour,
                renders: AtomicUsize::new(0),
            }
        }
    }

    impl PageRenderer for FakeRenderer {
        fn page_count(&self, path: &Path) -> crate::document::Result<usize> {
            match self.behaviour {
                Behaviour::Encrypted => Err(DocumentError::Encrypted(path.to_path_buf())),
                _ => Ok(self.pages),
            }
        }

        fn render_page(&self, _path: &Path, _index: usize, _dpi: u32) -> crate::document::Result<GrayImage> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::MissingTool => Err(DocumentError::ToolNotFound("pdftoppm".into())),
                _ => Ok(GrayImage::from_pixel(306, 396, Luma([255]))),
            }
        }

        fn text_blocks(&self, _path: &Path, index: usize, _dpi: u32) -> crate::document::Result<Vec<TextBlock>> {
            let mut blocks = vec![TextBlock::new(BoundingBox::new(40.0, 150.0, 260.0, 200.0), "body")];
            if let Behaviour::HeaderTextOn(page) = self.behaviour {
                if page == index {
                    // a sliver inside the 18 px header band
                    blocks.push(TextBlock::new(BoundingBox::new(40.0, 17.0, 60.0, 30.0), "Chapter 1"));
                }
            }
            Ok(blocks)
        }
    }

    fn settings(format: OutputFormat) -> AnalysisSettings {
        AnalysisSettings::builder()
            .dpi(TEST_DPI)
            .workers(2)
            .batch_size(2)
            .output_format(format)
            .build()
            .unwrap()
    }

    fn pipeline(settings: AnalysisSettings, pages: usize, behaviour: Behaviour) -> AnalysisPipeline {
        AnalysisPipeline::new(settings)
            .unwrap()
            .with_renderer(Arc::new(FakeRenderer::new(pages, behaviour)))
    }

    fn write_png(path: &Path, dark_top_rows: u32) {
        let mut img = GrayImage::from_pixel(100, 100, Luma([255]));
        for y in 0..dark_top_rows {
            for x in 0..100 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        img.save(path).unwrap();
    }

    fn read_csv(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect()
    }

    #[test]
    fn test_pdf_pages_written_in_order() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(input.path().join("book.pdf"), b"%PDF").unwrap();

        let p = pipeline(settings(OutputFormat::Csv), 5, Behaviour::HeaderTextOn(1));
        let summary = p
            .run(input.path(), &out.path().join("report.csv"), &SilentProgress)
            .unwrap();

        assert_eq!(summary.records_written, 5);
        assert_eq!(summary.flagged_records, 1);
        assert!(!summary.cancelled);

        let rows = read_csv(&out.path().join("report.csv"));
        let pages: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(pages, vec!["1", "2", "3", "4", "5"]);
        assert_eq!(rows[1][2], "Content found in header");
        assert_eq!(rows[1][3], "Text found in header");
        assert_eq!(rows[0][2], WITHIN_MARGINS);
    }

    #[test]
    fn test_images_to_sqlite() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_png(&input.path().join("clean.png"), 0);
        write_png(&input.path().join("dirty.png"), 18);
        write_png(&input.path().join("speck.png"), 0);
        std::fs::write(input.path().join("notes.txt"), b"ignored").unwrap();

        let p = pipeline(settings(OutputFormat::Sqlite), 0, Behaviour::HeaderTextOn(0));
        let summary = p
            .run(input.path(), &out.path().join("report"), &SilentProgress)
            .unwrap();

        assert_eq!(summary.files_found, 3);
        assert_eq!(summary.files_processed, 3);
        assert_eq!(summary.records_written, 3);
        assert_eq!(summary.flagged_records, 1);
        assert_eq!(summary.output_paths, vec![out.path().join("report.db")]);

        let conn = rusqlite::Connection::open(out.path().join("report.db")).unwrap();
        let status: String = conn
            .query_row(
                "SELECT content_status FROM analysis_results WHERE file_path LIKE '%dirty.png'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "Content found in header");

        // batch size 2: one full batch, then the final remainder
        let batches: i64 = conn
            .query_row("SELECT COUNT(*) FROM processing_stats", [], |row| row.get(0))
            .unwrap();
        assert_eq!(batches, 2);
    }

    #[test]
    fn test_encrypted_pdf_is_reported_and_run_continues() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(input.path().join("a_locked.pdf"), b"%PDF").unwrap();
        write_png(&input.path().join("b.png"), 0);

        let p = pipeline(settings(OutputFormat::Csv), 3, Behaviour::Encrypted);
        let summary = p
            .run(input.path(), &out.path().join("r.csv"), &SilentProgress)
            .unwrap();

        assert!(!summary.cancelled);
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.failed_records, 1);
        assert_eq!(summary.errors.by_category.get(&ErrorCategory::Encryption), Some(&1));
        assert_eq!(summary.errors.by_severity.get(&ErrorSeverity::Warning), Some(&1));

        let rows = read_csv(&out.path().join("r.csv"));
        let locked = rows.iter().find(|r| r[0].ends_with("a_locked.pdf")).unwrap();
        assert_eq!(locked[2], PROCESSING_FAILED);
        assert_eq!(locked[8], "WARNING");
    }

    #[test]
    fn test_critical_error_cancels_but_still_finalizes() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(input.path().join("one.pdf"), b"%PDF").unwrap();
        std::fs::write(input.path().join("two.pdf"), b"%PDF").unwrap();

        // one worker runs the pages in order, so page 1 is the only one started
        let settings = AnalysisSettings::builder()
            .dpi(TEST_DPI)
            .workers(1)
            .batch_size(2)
            .output_format(OutputFormat::Parquet)
            .build()
            .unwrap();
        let renderer = Arc::new(FakeRenderer::new(20, Behaviour::MissingTool));
        let p = AnalysisPipeline::new(settings)
            .unwrap()
            .with_renderer(renderer.clone());
        let summary = p
            .run(input.path(), &out.path().join("r.parquet"), &SilentProgress)
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(renderer.renders.load(Ordering::SeqCst), 1);
        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.errors.critical.len(), 1);
        assert!(out.path().join("r.parquet").exists());
        assert!(out.path().join("r_metadata.json").exists());
    }

    #[derive(Default)]
    struct StatsRecorder {
        snapshots: Mutex<Vec<StatsSnapshot>>,
    }

    impl ProgressCallback for StatsRecorder {
        fn on_step_start(&self, _step: &str) {}
        fn on_step_progress(&self, _current: usize, _total: usize) {}
        fn on_step_complete(&self, _step: &str, _message: &str) {}
        fn on_debug(&self, _message: &str) {}
        fn on_stats(&self, stats: &StatsSnapshot) {
            self.snapshots.lock().unwrap().push(stats.clone());
        }
    }

    #[test]
    fn test_stats_reported_per_file_and_summary_shows_share() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_png(&input.path().join("a.png"), 0);
        write_png(&input.path().join("b.png"), 18);

        let progress = StatsRecorder::default();
        let p = pipeline(settings(OutputFormat::Csv), 0, Behaviour::HeaderTextOn(0));
        let summary = p
            .run(input.path(), &out.path().join("r.csv"), &progress)
            .unwrap();

        let snapshots = progress.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.total_files == 2));
        assert_eq!(snapshots.iter().map(|s| s.files_done).max(), Some(2));

        let report = summary.to_string();
        assert!(report.contains("Margin issues:  1 (50.0% of analysed records)"));
    }

    #[test]
    fn test_random_n_plan_is_reproducible() {
        let input = TempDir::new().unwrap();
        for i in 0..10 {
            write_png(&input.path().join(format!("img_{}.png", i)), 0);
        }

        let settings = AnalysisSettings::builder()
            .dpi(TEST_DPI)
            .random_n(3)
            .seed(Some(7))
            .build()
            .unwrap();
        let p = AnalysisPipeline::new(settings).unwrap();

        let first = p.plan(input.path(), &SilentProgress).unwrap();
        let second = p.plan(input.path(), &SilentProgress).unwrap();
        assert_eq!(first.selected().len(), 3);
        assert_eq!(first.selected(), second.selected());
        assert_eq!(first.metadata.random_n_size, Some(3));
        assert_eq!(first.metadata.total_files, Some(10));
        assert_eq!(first.selected_images(), 3);
    }

    #[test]
    fn test_statistical_plan_for_500_files() {
        let input = TempDir::new().unwrap();
        for i in 0..500 {
            std::fs::write(input.path().join(format!("scan_{:03}.png", i)), b"").unwrap();
        }

        let settings = AnalysisSettings::builder()
            .statistical_sampling(0.95, 0.05)
            .build()
            .unwrap();
        let plan = AnalysisPipeline::new(settings)
            .unwrap()
            .plan(input.path(), &SilentProgress)
            .unwrap();

        assert_eq!(plan.selected().len(), 218);
        let mut paths: Vec<_> = plan.selected().iter().map(|f| f.path.clone()).collect();
        paths.dedup();
        assert_eq!(paths.len(), 218);
        assert_eq!(plan.metadata.sample_size, Some(218));
        assert!(plan.selection.estimated_margin_of_error.unwrap() <= 0.05);
    }

    #[test]
    fn test_empty_input_still_produces_output() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let summary = pipeline(settings(OutputFormat::Csv), 1, Behaviour::HeaderTextOn(0))
            .run(input.path(), &out.path().join("empty.csv"), &SilentProgress)
            .unwrap();

        assert_eq!(summary.records_written, 0);
        assert!(out.path().join("empty.csv").exists());
        assert!(summary.to_string().contains("No errors"));
    }

    #[test]
    fn test_cancel_before_run_processes_nothing() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_png(&input.path().join("a.png"), 0);

        let p = pipeline(settings(OutputFormat::Csv), 1, Behaviour::HeaderTextOn(0));
        p.control().cancel();
        let summary = p
            .run(input.path(), &out.path().join("r.csv"), &SilentProgress)
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.files_processed, 0);
        assert!(read_csv(&out.path().join("r.csv")).is_empty());
    }

    #[test]
    fn test_run_control_pause_resume() {
        let control = Arc::new(RunControl::new());
        control.pause();
        assert!(control.is_paused());

        let worker = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.wait_if_paused())
        };
        std::thread::sleep(Duration::from_millis(150));
        control.resume();
        assert!(worker.join().unwrap());
        assert!(control.paused_duration() >= Duration::from_millis(150));

        control.pause();
        control.cancel();
        assert!(!control.wait_if_paused());
    }

    #[test]
    fn test_stats_rate_window() {
        let mut state = StatsState {
            total_files: 100,
            ..Default::default()
        };
        for i in 1..=8u64 {
            state.files_done = (i * 2) as usize;
            state.update_rate(Duration::from_secs(i));
        }
        assert_eq!(state.rates.len(), RATE_WINDOW);
        assert!((state.rate() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_counts_and_eta() {
        let stats = ProcessingStats::new(4, Arc::new(RunControl::new()));
        let ok = AnalysisRecord::image(Path::new("/a.png"), MarginAnalysisResult::default());
        let flagged = AnalysisRecord::image(
            Path::new("/b.png"),
            MarginAnalysisResult {
                has_bottom_content: true,
                ..Default::default()
            },
        );
        stats.record_result(&ok);
        stats.record_result(&flagged);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.record_file(), 1);

        let snap = stats.snapshot();
        assert_eq!(snap.records, 2);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.flagged, 1);
        assert!(snap.rate > 0.0);
        assert!(snap.eta.is_some());
    }

    #[test]
    fn test_estimated_page_memory() {
        assert_eq!(estimated_page_memory_mb(36), 1);
        assert!(estimated_page_memory_mb(200) >= 7);
        assert!(estimated_page_memory_mb(600) > estimated_page_memory_mb(300));
    }

    #[test]
    fn test_calculate_optimal_chunk_size_basic() {
        let chunk = calculate_optimal_chunk_size(100, 4096, 8, 8);
        assert!(chunk >= MIN_CHUNK_SIZE);
        assert!(chunk <= 100);
    }

    #[test]
    fn test_calculate_optimal_chunk_size_small_batch() {
        let chunk = calculate_optimal_chunk_size(3, 4096, 8, 8);
        assert!((1..=3).contains(&chunk));
    }

    #[test]
    fn test_calculate_optimal_chunk_size_zero_items() {
        let chunk = calculate_optimal_chunk_size(0, 4096, 8, 8);
        assert_eq!(chunk, 1); // At least 1 to prevent division by zero
    }

    #[test]
    fn test_calculate_optimal_chunk_size_limited_memory() {
        // usable = 100MB, 60MB pages: capacity 1, so MIN_CHUNK_SIZE
        let chunk = calculate_optimal_chunk_size(100, 200, 8, 60);
        assert_eq!(chunk, MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_process_in_chunks_empty() {
        let items: Vec<i32> = vec![];
        let results: Vec<i32> = process_in_chunks(&items, 4, |x| *x * 2, None::<&fn(usize, usize)>);
        assert!(results.is_empty());
    }

    #[test]
    fn test_process_in_chunks_maintains_order() {
        let items: Vec<i32> = (0..20).collect();
        let results: Vec<i32> = process_in_chunks(&items, 4, |x| *x * 2, None::<&fn(usize, usize)>);

        let expected: Vec<i32> = (0..20).map(|x| x * 2).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn test_process_in_chunks_with_progress() {
        let items: Vec<i32> = (0..10).collect();
        let progress_count = Arc::new(AtomicUsize::new(0));
        let progress_count_clone = progress_count.clone();

        let progress_fn = move |_current: usize, _total: usize| {
            progress_count_clone.fetch_add(1, Ordering::Relaxed);
        };

        let results: Vec<i32> = process_in_chunks(&items, 4, |x| *x * 2, Some(&progress_fn));

        assert_eq!(results.len(), 10);
        assert_eq!(progress_count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_process_in_chunks_chunk_size_zero() {
        // chunk_size 0 means process all at once
        let items: Vec<i32> = (0..10).collect();
        let results: Vec<i32> = process_in_chunks(&items, 0, |x| *x + 1, None::<&fn(usize, usize)>);

        let expected: Vec<i32> = (1..11).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn test_pipeline_rejects_invalid_settings() {
        let mut settings = settings(OutputFormat::Csv);
        settings.threshold = 50.0;
        assert!(matches!(
            AnalysisPipeline::new(settings),
            Err(PipelineError::Settings(SettingsError::InvalidThreshold(_)))
        ));
    }
}
