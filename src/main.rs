//! margin-scan - header/footer margin checker
//!
//! CLI entry point

use clap::Parser;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use margin_scan::{
    ensure_dir_writable, AnalysisPipeline, AnalysisSettings, Cli, CliProgress, Commands, Config,
    ExitCode, PopplerRenderer, RunPlan, ScanArgs,
};

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Scan(args) => {
            init_tracing(args.log_level());
            run_scan(&args)
        }
        Commands::Info => run_info(),
    };
    code.into()
}

/// `RUST_LOG` wins over the verbosity flags
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("margin_scan={}", default_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

// ============ Scan Command ============

fn run_scan(args: &ScanArgs) -> ExitCode {
    if !args.input.is_dir() {
        eprintln!("Error: Input directory does not exist: {}", args.input.display());
        return ExitCode::InputNotFound;
    }

    let file_config = match Config::load_or_search(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) if args.config.is_some() => {
            eprintln!("Error: Failed to load config file: {}", e);
            return ExitCode::InvalidArgs;
        }
        Err(e) => {
            tracing::warn!("ignoring config file: {}", e);
            Config::default()
        }
    };

    // CLI takes precedence over the config file
    let settings = match file_config.merge_with_cli(&args.to_overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::InvalidArgs;
        }
    };
    let output = settings.output_format.resolve_path(&args.output);

    let pipeline = match AnalysisPipeline::new(settings) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(&e);
        }
    };

    let progress = CliProgress::new(args.verbose, args.quiet);
    let plan = match pipeline.plan(&args.input, &progress) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(&e);
        }
    };

    if args.dry_run {
        print_execution_plan(&plan, pipeline.settings(), &output);
        return ExitCode::Success;
    }

    if plan.selected_pdfs() > 0 && !PopplerRenderer::new().is_available() {
        eprintln!("Error: pdftoppm and pdftotext (Poppler) are required to analyse PDF files");
        eprintln!("       Install poppler-utils, or rerun with --no-pdf");
        return ExitCode::ExternalToolError;
    }

    let output_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if let Err(e) = ensure_dir_writable(output_dir) {
        eprintln!("Error: {}", e);
        return ExitCode::OutputError;
    }

    let summary = match pipeline.execute(&plan, &output, &progress) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(&e);
        }
    };

    if !args.quiet {
        println!();
        print!("{}", summary);
    }

    if summary.cancelled {
        ExitCode::Cancelled
    } else {
        ExitCode::Success
    }
}

fn print_execution_plan(plan: &RunPlan, settings: &AnalysisSettings, output: &Path) {
    println!("=== Dry Run - Execution Plan ===");
    println!();
    println!("Input: {}", plan.root.display());
    println!("Output: {} ({})", output.display(), settings.output_format);
    println!(
        "Files found: {} ({} PDF, {} images)",
        plan.population.len(),
        plan.population.pdf_count(),
        plan.population.image_count()
    );
    if !plan.population.skipped.is_empty() {
        println!("Unreadable directories: {}", plan.population.skipped.len());
    }
    println!();
    println!("Analysis:");
    println!("  Threshold: {}%", settings.threshold);
    println!("  DPI: {}", settings.dpi);
    println!("  Workers: {}", settings.workers);
    println!("  Batch size: {}", settings.batch_size);
    println!(
        "  Output mode: {}",
        if settings.minimal_output { "minimal" } else { "full" }
    );
    println!();
    println!("Sampling: {}", settings.sampling.method_name());
    if let Some(n) = plan.selection.sample_size {
        println!("  Sample size: {}", n);
    }
    if let Some(n) = plan.selection.random_n_size {
        println!("  Random N: {}", n);
    }
    if let Some(seed) = settings.seed {
        println!("  Seed: {}", seed);
    }
    println!(
        "  Selected: {} ({} PDF, {} images)",
        plan.selected().len(),
        plan.selected_pdfs(),
        plan.selected_images()
    );
    println!();
    println!("Files:");
    for (i, file) in plan.selected().iter().enumerate() {
        println!("  {}. {}", i + 1, file.path.display());
    }
}

// ============ Info Command ============

fn run_info() -> ExitCode {
    println!("margin-scan v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("System Information:");
    println!("  Platform: {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);
    println!("  CPUs: {}", num_cpus::get());

    // Memory info (Linux)
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(line) = meminfo.lines().find(|l| l.starts_with("MemTotal:")) {
            if let Some(kb) = line.split_whitespace().nth(1) {
                if let Ok(kb_val) = kb.parse::<u64>() {
                    println!("  Memory: {:.1} GB", kb_val as f64 / 1_048_576.0);
                }
            }
        }
    }

    println!();
    println!("PDF Tools:");
    check_tool("pdftoppm", "Poppler pdftoppm");
    check_tool("pdftotext", "Poppler pdftotext");

    println!();
    println!("Config File Locations:");
    for path in Config::search_paths() {
        println!("  {}", path.display());
    }

    ExitCode::Success
}

fn check_tool(cmd: &str, name: &str) {
    match which::which(cmd) {
        Ok(path) => println!("  {}: {} (found)", name, path.display()),
        Err(_) => println!("  {}: Not found", name),
    }
}
