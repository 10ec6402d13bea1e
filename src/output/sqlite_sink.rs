use chrono::Local;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::{AnalysisMetadata, OutputError, OutputFormat, OutputSink, Result, SinkOptions};
use crate::record::AnalysisRecord;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS analysis_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    page_number INTEGER,
    content_status TEXT NOT NULL,
    text_status TEXT,
    image_status TEXT,
    file_type TEXT NOT NULL,
    error_message TEXT,
    error_severity TEXT,
    relative_path TEXT,
    file_size INTEGER,
    processed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    batch_id INTEGER
);
CREATE TABLE IF NOT EXISTS analysis_details (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    result_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    detail_type TEXT NOT NULL,
    detail_value TEXT,
    numeric_value REAL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY(result_id) REFERENCES analysis_results(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS processing_stats (
    batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time TIMESTAMP,
    end_time TIMESTAMP,
    records_processed INTEGER,
    success_count INTEGER,
    error_count INTEGER
);
CREATE TABLE IF NOT EXISTS analysis_metadata (
    key TEXT NOT NULL,
    value TEXT,
    version INTEGER DEFAULT 1,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (key, version)
);
CREATE INDEX IF NOT EXISTS idx_file_path ON analysis_results(file_path);
CREATE INDEX IF NOT EXISTS idx_content_status ON analysis_results(content_status);
CREATE INDEX IF NOT EXISTS idx_details_result ON analysis_details(result_id);
";

/// Created once at the end of a run
const FINAL_INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_processed_at ON analysis_results(processed_at);
CREATE INDEX IF NOT EXISTS idx_batch_id ON analysis_results(batch_id);
CREATE INDEX IF NOT EXISTS idx_details_category ON analysis_details(category);
";

/// Embedded relational sink
///
/// Every batch runs in one transaction. Metadata keys are versioned: each
/// store inserts a new row per key with the next version number.
pub struct SqliteSink {
    path: PathBuf,
    options: SinkOptions,
    metadata: AnalysisMetadata,
    conn: Mutex<Option<Connection>>,
    total_records: usize,
}

impl SqliteSink {
    pub fn new(path: &Path, options: SinkOptions, metadata: AnalysisMetadata) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        let sink = Self {
            path: path.to_path_buf(),
            options,
            metadata,
            conn: Mutex::new(None),
            total_records: 0,
        };
        sink.store_metadata(&conn, false)?;
        *sink.conn.lock().map_err(|_| OutputError::Closed)? = Some(conn);

        tracing::debug!(path = %path.display(), "SQLite database initialised");
        Ok(sink)
    }

    pub fn total_records(&self) -> usize {
        self.total_records
    }

    fn store_metadata(&self, conn: &Connection, is_final: bool) -> Result<()> {
        let mut map = self.metadata.to_map();
        map.insert("total_records".into(), serde_json::json!(self.total_records));
        let completed_at = is_final.then(|| Local::now().to_rfc3339());
        map.insert("completed_at".into(), serde_json::json!(completed_at));

        let mut stmt = conn.prepare(
            "INSERT INTO analysis_metadata (key, value, version)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(version), 0) + 1 FROM analysis_metadata WHERE key = ?1))",
        )?;
        for (key, value) in &map {
            stmt.execute(params![key, serde_json::to_string(value)?])?;
        }
        Ok(())
    }

    /// Path relative to the database directory, or the full path when the
    /// file lives elsewhere
    fn relative_path(&self, file: &Path) -> String {
        let base = self.path.parent().unwrap_or_else(|| Path::new(""));
        file.strip_prefix(base)
            .unwrap_or(file)
            .display()
            .to_string()
    }

    fn insert_record(&self, conn: &Connection, record: &AnalysisRecord, batch_id: i64) -> rusqlite::Result<()> {
        // NULL when the source is missing or unreadable
        let file_size: Option<i64> = std::fs::metadata(&record.file)
            .ok()
            .map(|m| m.len() as i64);

        conn.execute(
            "INSERT INTO analysis_results (
                file_path, page_number, content_status, text_status, image_status,
                file_type, error_message, error_severity, relative_path, file_size, batch_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.file_display(),
                record.page,
                record.content_status,
                record.text_status,
                record.image_status,
                record.file_type.label(),
                record.error_message(),
                record.error_severity(),
                self.relative_path(&record.file),
                file_size,
                batch_id,
            ],
        )?;
        let result_id = conn.last_insert_rowid();

        if self.options.minimal_output {
            return Ok(());
        }
        let mut stmt = conn.prepare_cached(
            "INSERT INTO analysis_details (result_id, category, detail_type, detail_value, numeric_value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for row in record.details.detail_rows() {
            stmt.execute(params![
                result_id,
                row.category,
                row.detail_type,
                row.value,
                row.numeric_value()
            ])?;
        }
        Ok(())
    }
}

impl OutputSink for SqliteSink {
    fn write_batch(&mut self, records: &[AnalysisRecord], is_final: bool) -> Result<Option<PathBuf>> {
        let mut guard = self.conn.lock().map_err(|_| OutputError::Closed)?;
        let conn = guard.as_mut().ok_or(OutputError::Closed)?;

        if !records.is_empty() {
            let mut tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO processing_stats (start_time, records_processed) VALUES (?1, ?2)",
                params![Local::now().to_rfc3339(), records.len()],
            )?;
            let batch_id = tx.last_insert_rowid();

            let mut success_count = 0usize;
            let mut error_count = 0usize;
            for record in records {
                let mut sp = tx.savepoint()?;
                match self.insert_record(&sp, record, batch_id) {
                    Ok(()) => {
                        sp.commit()?;
                        success_count += 1;
                    }
                    Err(e) => {
                        sp.rollback()?;
                        error_count += 1;
                        tracing::warn!(file = %record.file.display(), error = %e, "failed to insert record");
                    }
                }
            }

            tx.execute(
                "UPDATE processing_stats SET end_time = ?1, success_count = ?2, error_count = ?3
                 WHERE batch_id = ?4",
                params![Local::now().to_rfc3339(), success_count, error_count, batch_id],
            )?;
            tx.commit()?;

            self.total_records += records.len();
            tracing::info!(
                batch_id,
                rows = success_count,
                errors = error_count,
                path = %self.path.display(),
                "SQLite batch written"
            );
        }

        if is_final {
            self.store_metadata(conn, true)?;
            conn.execute_batch(FINAL_INDEXES)?;
            tracing::debug!(total = self.total_records, "SQLite run finalised");
        }

        Ok(Some(self.path.clone()))
    }

    fn cleanup(&mut self) -> Result<()> {
        let mut guard = self.conn.lock().map_err(|_| OutputError::Closed)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }

    fn metadata(&self) -> &AnalysisMetadata {
        &self.metadata
    }

    fn output_path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Sqlite
    }
}
