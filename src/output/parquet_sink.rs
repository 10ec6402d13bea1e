use arrow_array::{Array, ArrayRef, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    metadata_path, write_metadata_json, AnalysisMetadata, OutputError, OutputFormat, OutputSink,
    Result, SinkOptions,
};
use crate::record::AnalysisRecord;

/// Rows per Parquet row group
pub const ROW_GROUP_SIZE: usize = 100_000;

const PAGE_COLUMN: &str = "Page";

/// Column values accumulated before building Arrow arrays
#[derive(Debug, Clone, PartialEq)]
enum ColumnData {
    Int(Vec<Option<i32>>),
    Str(Vec<Option<String>>),
}

impl ColumnData {
    fn empty_like(name: &str) -> Self {
        if name == PAGE_COLUMN {
            ColumnData::Int(Vec::new())
        } else {
            ColumnData::Str(Vec::new())
        }
    }

    fn pad_to(&mut self, len: usize) {
        match self {
            ColumnData::Int(v) => v.resize(len, None),
            ColumnData::Str(v) => v.resize(len, None),
        }
    }

    fn push(&mut self, value: Option<String>) {
        match self {
            ColumnData::Int(v) => v.push(value.and_then(|s| s.parse().ok())),
            ColumnData::Str(v) => v.push(value),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            ColumnData::Int(_) => DataType::Int32,
            ColumnData::Str(_) => DataType::Utf8,
        }
    }

    fn into_array(self) -> ArrayRef {
        match self {
            ColumnData::Int(v) => Arc::new(Int32Array::from(v)),
            ColumnData::Str(v) => Arc::new(StringArray::from(v)),
        }
    }
}

/// Ordered set of named columns
#[derive(Debug, Default)]
struct Table {
    columns: Vec<(String, ColumnData)>,
    rows: usize,
}

impl Table {
    fn column_mut(&mut self, name: &str) -> &mut ColumnData {
        let idx = match self.columns.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                let mut data = ColumnData::empty_like(name);
                data.pad_to(self.rows);
                self.columns.push((name.to_string(), data));
                self.columns.len() - 1
            }
        };
        &mut self.columns[idx].1
    }

    /// Append one row; columns missing from `row` become null
    fn push_row(&mut self, row: Vec<(String, Option<String>)>) {
        let rows = self.rows;
        for (name, value) in row {
            let column = self.column_mut(&name);
            column.pad_to(rows);
            column.push(value);
        }
        self.rows += 1;
        for (_, column) in &mut self.columns {
            column.pad_to(self.rows);
        }
    }

    fn append_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let schema = batch.schema();
        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            let name = field.name().as_str();
            let rows = self.rows;
            let column = self.column_mut(name);
            column.pad_to(rows);

            match column {
                ColumnData::Int(values) => {
                    let ints = array
                        .as_any()
                        .downcast_ref::<Int32Array>()
                        .ok_or_else(|| OutputError::ColumnType(name.to_string()))?;
                    values.extend((0..ints.len()).map(|i| ints.is_valid(i).then(|| ints.value(i))));
                }
                ColumnData::Str(values) => {
                    let strings = array
                        .as_any()
                        .downcast_ref::<StringArray>()
                        .ok_or_else(|| OutputError::ColumnType(name.to_string()))?;
                    values.extend(
                        (0..strings.len())
                            .map(|i| strings.is_valid(i).then(|| strings.value(i).to_string())),
                    );
                }
            }
        }
        self.rows += batch.num_rows();
        for (_, column) in &mut self.columns {
            column.pad_to(self.rows);
        }
        Ok(())
    }

    fn into_record_batch(self) -> Result<RecordBatch> {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|(name, data)| Field::new(name, data.data_type(), true))
            .collect();
        let arrays: Vec<ArrayRef> = self
            .columns
            .into_iter()
            .map(|(_, data)| data.into_array())
            .collect();
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }
}

/// Columnar sink
///
/// Nested analysis details are flattened into `Category_Key` columns and the
/// page column is a nullable 32-bit integer. Each batch after the first reads
/// the existing file back, appends, and rewrites it in full, so the cost of a
/// batch grows with the number of rows already written. The metadata
/// companion is only written on the final call.
pub struct ParquetSink {
    path: PathBuf,
    options: SinkOptions,
    metadata: AnalysisMetadata,
    rows_written: usize,
    created: bool,
}

impl ParquetSink {
    pub fn new(path: &Path, options: SinkOptions, metadata: AnalysisMetadata) -> Self {
        Self {
            path: path.to_path_buf(),
            options,
            metadata,
            rows_written: 0,
            created: false,
        }
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    fn flatten(&self, record: &AnalysisRecord) -> Vec<(String, Option<String>)> {
        let mut row = vec![
            ("File".to_string(), Some(record.file_display())),
            (PAGE_COLUMN.to_string(), Some(record.page.to_string())),
            ("Content Status".to_string(), Some(record.content_status.clone())),
        ];
        if self.options.minimal_output {
            return row;
        }

        row.extend([
            ("Text Status".to_string(), record.text_status.clone()),
            ("Image Status".to_string(), record.image_status.clone()),
            ("Type".to_string(), Some(record.file_type.label().to_string())),
            ("Error".to_string(), record.error_message()),
            (
                "Error Severity".to_string(),
                record.error_severity().map(str::to_string),
            ),
        ]);
        row.extend(
            record
                .details
                .flatten()
                .into_iter()
                .map(|(key, value)| (key, Some(value))),
        );
        row
    }

    fn read_existing(&self) -> Result<Table> {
        let mut table = Table::default();
        let file = File::open(&self.path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            table.append_batch(&batch?)?;
        }
        Ok(table)
    }

    fn write_table(&self, table: Table) -> Result<()> {
        let batch = table.into_record_batch()?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(ROW_GROUP_SIZE)
            .build();

        // write next to the target and swap in, so a failed rewrite keeps
        // the previous file intact
        let tmp_path = self.path.with_extension("parquet.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn write_metadata(&self) -> Result<()> {
        let mut map = self.metadata.to_map();
        map.insert("compression".into(), serde_json::json!("snappy"));
        map.insert("row_group_size".into(), serde_json::json!(ROW_GROUP_SIZE));
        map.insert("total_records".into(), serde_json::json!(self.rows_written));
        write_metadata_json(&metadata_path(&self.path), &map)
    }
}

impl OutputSink for ParquetSink {
    fn write_batch(&mut self, records: &[AnalysisRecord], is_final: bool) -> Result<Option<PathBuf>> {
        if records.is_empty() && !is_final {
            return Ok(None);
        }

        if !records.is_empty() || !self.created {
            let mut table = if self.created {
                self.read_existing()?
            } else {
                let mut table = Table::default();
                // keep the base columns even for an empty file
                for name in ["File", PAGE_COLUMN, "Content Status"] {
                    table.column_mut(name);
                }
                table
            };

            for record in records {
                table.push_row(self.flatten(record));
            }
            self.write_table(table)?;
            self.created = true;
            self.rows_written += records.len();
            tracing::info!(
                rows = records.len(),
                total = self.rows_written,
                path = %self.path.display(),
                "Parquet batch written"
            );
        }

        if is_final {
            self.write_metadata()?;
            return Ok(Some(self.path.clone()));
        }
        Ok(None)
    }

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    fn metadata(&self) -> &AnalysisMetadata {
        &self.metadata
    }

    fn output_path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Parquet
    }
}
