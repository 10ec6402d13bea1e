//! Processing error taxonomy
//!
//! Per-page and per-file failures are caught where they happen, tagged with
//! an [`ErrorCategory`] and [`ErrorSeverity`] chosen by the catching code,
//! and travel to the sink as part of an [`crate::AnalysisRecord`]. The
//! [`ErrorLog`] keeps a copy of each for the end-of-run summary.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Number of critical errors listed individually in a summary
pub const CRITICAL_PREVIEW: usize = 5;

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    FileAccess,
    PdfProcessing,
    ImageProcessing,
    Memory,
    Permission,
    Encryption,
    Format,
    Output,
    System,
    Unknown,
}

impl ErrorCategory {
    pub fn label(self) -> &'static str {
        match self {
            ErrorCategory::FileAccess => "File Access Error",
            ErrorCategory::PdfProcessing => "PDF Processing Error",
            ErrorCategory::ImageProcessing => "Image Processing Error",
            ErrorCategory::Memory => "Memory Error",
            ErrorCategory::Permission => "Permission Error",
            ErrorCategory::Encryption => "Encryption Error",
            ErrorCategory::Format => "Format Error",
            ErrorCategory::Output => "Output Error",
            ErrorCategory::System => "System Error",
            ErrorCategory::Unknown => "Unknown Error",
        }
    }

    /// Category for an I/O failure while reading an input file
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
            std::io::ErrorKind::OutOfMemory => ErrorCategory::Memory,
            _ => ErrorCategory::FileAccess,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error severity
///
/// Only [`ErrorSeverity::Critical`] stops a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn label(self) -> &'static str {
        match self {
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }

    pub fn is_critical(self) -> bool {
        self == ErrorSeverity::Critical
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error attached to an analysis record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(category: ErrorCategory, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
        }
    }

    /// "Category: message" as written to the Error column
    pub fn display_message(&self) -> String {
        format!("{}: {}", self.category.label(), self.message)
    }
}

/// One logged failure
#[derive(Debug, Clone)]
pub struct ProcessingError {
    pub file: PathBuf,
    pub page: Option<u32>,
    pub descriptor: ErrorDescriptor,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(page) = self.page {
            write!(f, " (page {})", page)?;
        }
        write!(f, ": {}", self.descriptor.display_message())
    }
}

/// Thread-safe collection of failures for one run
#[derive(Debug, Default)]
pub struct ErrorLog {
    errors: Mutex<Vec<ProcessingError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and emit it as a tracing event
    pub fn record(&self, file: &Path, page: Option<u32>, descriptor: &ErrorDescriptor) {
        match descriptor.severity {
            ErrorSeverity::Critical => tracing::error!(
                file = %file.display(),
                page,
                category = descriptor.category.label(),
                "critical: {}",
                descriptor.message
            ),
            ErrorSeverity::Error => tracing::error!(
                file = %file.display(),
                page,
                category = descriptor.category.label(),
                "{}",
                descriptor.message
            ),
            _ => tracing::warn!(
                file = %file.display(),
                page,
                category = descriptor.category.label(),
                "{}",
                descriptor.message
            ),
        }

        let entry = ProcessingError {
            file: file.to_path_buf(),
            page,
            descriptor: descriptor.clone(),
            timestamp: Local::now(),
        };
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.errors.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_critical(&self) -> bool {
        self.errors
            .lock()
            .map(|e| e.iter().any(|err| err.descriptor.severity.is_critical()))
            .unwrap_or(false)
    }

    /// Condensed summary grouped by category and severity
    pub fn summary(&self) -> ErrorSummary {
        let errors = match self.errors.lock() {
            Ok(errors) => errors,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut critical = Vec::new();
        let mut critical_total = 0;

        for err in errors.iter() {
            *by_category.entry(err.descriptor.category).or_insert(0) += 1;
            *by_severity.entry(err.descriptor.severity).or_insert(0) += 1;
            if err.descriptor.severity.is_critical() {
                critical_total += 1;
                if critical.len() < CRITICAL_PREVIEW {
                    critical.push(err.clone());
                }
            }
        }

        ErrorSummary {
            total: errors.len(),
            by_category,
            by_severity,
            remaining_critical: critical_total - critical.len(),
            critical,
        }
    }
}

/// End-of-run error report
#[derive(Debug, Clone, Default)]
pub struct ErrorSummary {
    pub total: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<ErrorSeverity, usize>,
    /// First few critical errors
    pub critical: Vec<ProcessingError>,
    /// Critical errors not listed in `critical`
    pub remaining_critical: usize,
}

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return writeln!(f, "No errors");
        }

        writeln!(f, "Errors: {}", self.total)?;
        writeln!(f, "By category:")?;
        for (category, count) in &self.by_category {
            writeln!(f, "  {}: {}", category, count)?;
        }
        writeln!(f, "By severity:")?;
        for (severity, count) in self.by_severity.iter().rev() {
            writeln!(f, "  {}: {}", severity, count)?;
        }

        if !self.critical.is_empty() {
            writeln!(f, "Critical errors:")?;
            for err in &self.critical {
                writeln!(f, "  - {}", err)?;
            }
            if self.remaining_critical > 0 {
                writeln!(f, "  (and {} more...)", self.remaining_critical)?;
            }
        }
        Ok(())
    }
}
