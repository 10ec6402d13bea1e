//! Common utilities for margin-scan
//!
//! Formatting helpers shared by the pipeline report and the CLI.

use std::path::Path;
use std::time::Duration;

/// Check if a directory exists and is writable, creating it if needed
pub fn ensure_dir_writable<P: AsRef<Path>>(path: P) -> Result<(), String> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| format!("Failed to create directory: {}", e))?;
    }

    // Test writability
    let test_file = path.join(".write_test");
    std::fs::write(&test_file, b"test")
        .map_err(|_| format!("Directory not writable: {}", path.display()))?;
    let _ = std::fs::remove_file(test_file);

    Ok(())
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else if secs >= 60 {
        let mins = secs / 60;
        let remaining_secs = secs % 60;
        format!("{}m {}s", mins, remaining_secs)
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}

/// Remaining-time estimate, `--` when unknown
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) if d.as_secs() >= 60 => format_duration(Duration::from_secs(d.as_secs())),
        Some(d) => format!("{}s", d.as_secs()),
        None => "--".to_string(),
    }
}

/// Processing rate in items per second
pub fn format_rate(per_second: f64) -> String {
    if per_second <= 0.0 || !per_second.is_finite() {
        "--".to_string()
    } else if per_second < 1.0 {
        format!("{:.1}/min", per_second * 60.0)
    } else {
        format!("{:.1}/s", per_second)
    }
}

/// Calculate percentage
#[inline]
pub fn percentage(current: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        (current as f32 / total as f32) * 100.0
    }
}
