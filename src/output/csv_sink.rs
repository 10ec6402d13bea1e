use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use super::{
    metadata_path, write_metadata_json, AnalysisMetadata, OutputError, OutputFormat, OutputSink,
    Result, SinkOptions, FULL_COLUMNS, MINIMAL_COLUMNS,
};
use crate::record::AnalysisRecord;

/// Row-table sink
///
/// Appends to `name.csv` until the row limit is reached, then continues in
/// `name__2.csv`, `name__3.csv`, ... Batches are split across files so that
/// every file except the last holds exactly `max_rows_per_file` rows. The
/// header is written once per file. The metadata companion is written at
/// construction and never rewritten.
pub struct CsvSink {
    base_path: PathBuf,
    options: SinkOptions,
    metadata: AnalysisMetadata,
    file_number: usize,
    rows_in_file: usize,
    writer: Option<csv::Writer<File>>,
    total_rows: usize,
}

impl CsvSink {
    pub fn new(path: &Path, options: SinkOptions, metadata: AnalysisMetadata) -> Result<Self> {
        let options = SinkOptions {
            max_rows_per_file: options.max_rows_per_file.max(1),
            ..options
        };

        write_metadata_json(&metadata_path(path), &metadata.to_map())?;

        Ok(Self {
            base_path: path.to_path_buf(),
            options,
            metadata,
            file_number: 1,
            rows_in_file: 0,
            writer: None,
            total_rows: 0,
        })
    }

    /// Path of the n-th file (1-based)
    pub fn numbered_path(&self, number: usize) -> PathBuf {
        if number <= 1 {
            return self.base_path.clone();
        }
        let stem = self
            .base_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.base_path.extension() {
            Some(ext) => format!("{}__{}.{}", stem, number, ext.to_string_lossy()),
            None => format!("{}__{}", stem, number),
        };
        self.base_path.with_file_name(name)
    }

    pub fn current_path(&self) -> PathBuf {
        self.numbered_path(self.file_number)
    }

    /// Number of files created so far
    pub fn file_count(&self) -> usize {
        if self.writer.is_some() || self.rows_in_file > 0 {
            self.file_number
        } else {
            self.file_number - 1
        }
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    fn header(&self) -> &'static [&'static str] {
        if self.options.minimal_output {
            &MINIMAL_COLUMNS
        } else {
            &FULL_COLUMNS
        }
    }

    fn row(&self, record: &AnalysisRecord) -> Vec<String> {
        let mut row = vec![
            record.file_display(),
            record.page.to_string(),
            record.content_status.clone(),
        ];
        if self.options.minimal_output {
            return row;
        }

        let details = if record.details.is_empty() {
            String::new()
        } else {
            record.details.to_json()
        };
        row.extend([
            record.text_status.clone().unwrap_or_default(),
            record.image_status.clone().unwrap_or_default(),
            record.file_type.label().to_string(),
            details,
            record.error_message().unwrap_or_default(),
            record.error_severity().unwrap_or_default().to_string(),
        ]);
        row
    }

    /// Writer for the current file, creating it with a header if needed
    fn writer(&mut self) -> Result<&mut csv::Writer<File>> {
        if self.writer.is_none() {
            let path = self.current_path();
            let file = if self.rows_in_file == 0 {
                File::create(&path)?
            } else {
                // reopened after cleanup
                OpenOptions::new().append(true).open(&path)?
            };
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            if self.rows_in_file == 0 {
                writer.write_record(self.header())?;
                tracing::debug!(path = %path.display(), "created CSV file");
            }
            self.writer = Some(writer);
        }
        self.writer.as_mut().ok_or(OutputError::Closed)
    }

    fn roll_over(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.file_number += 1;
        self.rows_in_file = 0;
        Ok(())
    }
}

impl OutputSink for CsvSink {
    fn write_batch(&mut self, records: &[AnalysisRecord], is_final: bool) -> Result<Option<PathBuf>> {
        if records.is_empty() {
            if !is_final {
                return Ok(None);
            }
            // an empty run still leaves a file with a header
            if self.rows_in_file == 0 {
                self.writer()?;
            }
            if let Some(writer) = self.writer.as_mut() {
                writer.flush()?;
            }
            return Ok(Some(self.current_path()));
        }

        let max_rows = self.options.max_rows_per_file;
        let mut remaining = records;

        while !remaining.is_empty() {
            if self.rows_in_file >= max_rows {
                self.roll_over()?;
            }

            let room = max_rows - self.rows_in_file;
            let (chunk, rest) = remaining.split_at(room.min(remaining.len()));
            let rows: Vec<Vec<String>> = chunk.iter().map(|r| self.row(r)).collect();

            let writer = self.writer()?;
            for row in &rows {
                writer.write_record(row)?;
            }
            writer.flush()?;

            self.rows_in_file += chunk.len();
            self.total_rows += chunk.len();
            remaining = rest;
        }

        let path = self.current_path();
        tracing::info!(rows = records.len(), path = %path.display(), "CSV batch written");
        Ok(Some(path))
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn metadata(&self) -> &AnalysisMetadata {
        &self.metadata
    }

    fn output_path(&self) -> &Path {
        &self.base_path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Csv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorCategory, ErrorDescriptor, ErrorSeverity};
    use crate::margin::MarginAnalysisResult;
    use crate::sampling::SamplingMode;
    use tempfile::TempDir;

    fn records(n: usize) -> Vec<AnalysisRecord> {
        (0..n)
            .map(|i| {
                AnalysisRecord::image(
                    Path::new(&format!("/scans/img_{:04}.png", i)),
                    MarginAnalysisResult::default(),
                )
            })
            .collect()
    }

    fn sink(dir: &Path, max_rows: usize, minimal: bool) -> CsvSink {
        let options = SinkOptions {
            minimal_output: minimal,
            max_rows_per_file: max_rows,
        };
        CsvSink::new(
            &dir.join("results.csv"),
            options,
            AnalysisMetadata::new(1.0, &SamplingMode::None),
        )
        .unwrap()
    }

    fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let header = reader.headers().unwrap().iter().map(String::from).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        (header, rows)
    }

    #[test]
    fn test_metadata_written_at_construction() {
        let tmp = TempDir::new().unwrap();
        let _sink = sink(tmp.path(), 10, false);

        let meta = std::fs::read_to_string(tmp.path().join("results_metadata.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(value["sampling_method"], "none");
        assert_eq!(value["threshold"], 1.0);
    }

    #[test]
    fn test_numbered_paths() {
        let tmp = TempDir::new().unwrap();
        let s = sink(tmp.path(), 10, false);
        assert_eq!(s.numbered_path(1), tmp.path().join("results.csv"));
        assert_eq!(s.numbered_path(2), tmp.path().join("results__2.csv"));
        assert_eq!(s.numbered_path(13), tmp.path().join("results__13.csv"));
    }

    #[test]
    fn test_rollover_file_count_and_no_loss() {
        let tmp = TempDir::new().unwrap();
        let mut s = sink(tmp.path(), 7, true);
        let all = records(30);

        // uneven batch sizes crossing file boundaries
        let mut offset = 0;
        for size in [3, 5, 1, 9, 4, 8] {
            s.write_batch(&all[offset..offset + size], false).unwrap();
            offset += size;
        }
        s.write_batch(&[], true).unwrap();
        s.cleanup().unwrap();

        assert_eq!(s.file_count(), 5); // ceil(30 / 7)
        assert!(!tmp.path().join("results__6.csv").exists());

        let mut seen = Vec::new();
        for n in 1..=5 {
            let (header, rows) = read_rows(&s.numbered_path(n));
            assert_eq!(header, MINIMAL_COLUMNS);
            assert!(rows.len() <= 7);
            if n < 5 {
                assert_eq!(rows.len(), 7);
            }
            seen.extend(rows.into_iter().map(|r| r[0].clone()));
        }

        let expected: Vec<String> = all.iter().map(|r| r.file_display()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_exact_multiple_does_not_create_empty_file() {
        let tmp = TempDir::new().unwrap();
        let mut s = sink(tmp.path(), 5, true);
        s.write_batch(&records(10), false).unwrap();
        s.write_batch(&[], true).unwrap();

        assert_eq!(s.file_count(), 2);
        assert!(!tmp.path().join("results__3.csv").exists());
    }

    #[test]
    fn test_full_mode_columns() {
        let tmp = TempDir::new().unwrap();
        let mut s = sink(tmp.path(), 100, false);

        let failed = AnalysisRecord::failed_page(
            Path::new("/scans/book.pdf"),
            4,
            ErrorDescriptor::new(ErrorCategory::PdfProcessing, ErrorSeverity::Error, "bad xref"),
        );
        let mut batch = records(1);
        batch.push(failed);
        let written = s.write_batch(&batch, true).unwrap();
        assert_eq!(written, Some(tmp.path().join("results.csv")));
        s.cleanup().unwrap();

        let (header, rows) = read_rows(&tmp.path().join("results.csv"));
        assert_eq!(header, FULL_COLUMNS);
        assert_eq!(rows[0][5], "Image");
        assert!(rows[0][6].contains("\"Top Content\":\"0.0%\""));
        assert_eq!(rows[1][2], "Page 4 Processing Failed");
        assert_eq!(rows[1][6], "");
        assert_eq!(rows[1][7], "PDF Processing Error: bad xref");
        assert_eq!(rows[1][8], "ERROR");
    }

    #[test]
    fn test_empty_final_leaves_header_only_file() {
        let tmp = TempDir::new().unwrap();
        let mut s = sink(tmp.path(), 10, true);
        assert_eq!(s.write_batch(&[], false).unwrap(), None);
        assert!(!tmp.path().join("results.csv").exists());

        s.write_batch(&[], true).unwrap();
        s.cleanup().unwrap();
        let (header, rows) = read_rows(&tmp.path().join("results.csv"));
        assert_eq!(header, MINIMAL_COLUMNS);
        assert!(rows.is_empty());
    }
}
