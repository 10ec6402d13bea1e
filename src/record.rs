//! Analysis records
//!
//! [`AnalysisRecord`] is the unit that flows from the analysers through the
//! accumulator into an output sink. It is created once per page (or image)
//! and never modified afterwards.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{ErrorCategory, ErrorDescriptor, ErrorSeverity};
use crate::margin::{MarginAnalysisResult, PageAssessment};

/// Status used for files that could not be analysed at all
pub const PROCESSING_FAILED: &str = "Processing Failed";

/// Source file type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileType {
    Pdf,
    Image,
}

impl FileType {
    pub fn label(self) -> &'static str {
        match self {
            FileType::Pdf => "PDF",
            FileType::Image => "Image",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of [`AnalysisDetails`]
#[derive(Debug, Clone, PartialEq)]
pub enum DetailNode {
    /// Scalar detail, e.g. `"Top Content" => "0.4%"`
    Value(String),
    /// Named group of scalar details, e.g. `"Text" => {...}`
    Group(Vec<(String, String)>),
}

/// Long-format detail row (one per flattened key)
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRow {
    pub category: String,
    pub detail_type: String,
    pub value: String,
}

impl DetailRow {
    /// Numeric interpretation of the value, ignoring a `%` suffix
    pub fn numeric_value(&self) -> Option<f64> {
        self.value.replace('%', "").trim().parse().ok()
    }
}

/// Ordered, optionally nested per-category detail values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisDetails {
    entries: Vec<(String, DetailNode)>,
}

impl AnalysisDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), DetailNode::Value(value.into())));
        self
    }

    pub fn with_group<K, V>(mut self, name: impl Into<String>, values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let group = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.entries.push((name.into(), DetailNode::Group(group)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DetailNode)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Column-style flattening: `Category_Key`, spaces replaced with `_`
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (key, node) in &self.entries {
            match node {
                DetailNode::Value(value) => out.push((column_name(key), value.clone())),
                DetailNode::Group(values) => {
                    for (detail_key, value) in values {
                        out.push((column_name(&format!("{}_{}", key, detail_key)), value.clone()));
                    }
                }
            }
        }
        out
    }

    /// Long-format rows; scalar details use the detail type `value`
    pub fn detail_rows(&self) -> Vec<DetailRow> {
        let mut rows = Vec::new();
        for (key, node) in &self.entries {
            match node {
                DetailNode::Value(value) => rows.push(DetailRow {
                    category: key.clone(),
                    detail_type: "value".to_string(),
                    value: value.clone(),
                }),
                DetailNode::Group(values) => {
                    rows.extend(values.iter().map(|(detail_key, value)| DetailRow {
                        category: key.clone(),
                        detail_type: detail_key.clone(),
                        value: value.clone(),
                    }))
                }
            }
        }
        rows
    }

    /// Compact JSON rendering for text outputs
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Serialize for AnalysisDetails {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, node) in &self.entries {
            match node {
                DetailNode::Value(value) => map.serialize_entry(key, value)?,
                DetailNode::Group(values) => map.serialize_entry(key, &GroupRef(values))?,
            }
        }
        map.end()
    }
}

struct GroupRef<'a>(&'a [(String, String)]);

impl Serialize for GroupRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

fn column_name(key: &str) -> String {
    key.replace(' ', "_")
}

fn percent(value: f64) -> String {
    format!("{:.1}%", value)
}

fn band_details(result: &MarginAnalysisResult) -> [(&'static str, String); 2] {
    [
        ("Top Content", percent(result.top_content_percentage)),
        ("Bottom Content", percent(result.bottom_content_percentage)),
    ]
}

/// Result of analysing one page or image
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    /// Absolute path of the source file
    pub file: PathBuf,
    /// 1-based page number (always 1 for images)
    pub page: u32,
    pub content_status: String,
    pub text_status: Option<String>,
    pub image_status: Option<String>,
    pub file_type: FileType,
    pub details: AnalysisDetails,
    pub error: Option<ErrorDescriptor>,
}

impl AnalysisRecord {
    /// Record for an analysed PDF page
    pub fn pdf_page(file: &Path, page: u32, text: MarginAnalysisResult, image: MarginAnalysisResult) -> Self {
        let assessment = PageAssessment::pdf(text, image);
        Self {
            file: file.to_path_buf(),
            page,
            content_status: assessment.content_status(),
            text_status: assessment.text_status(),
            image_status: assessment.image_status(),
            file_type: FileType::Pdf,
            details: AnalysisDetails::new()
                .with_group("Text", band_details(&text))
                .with_group("Image", band_details(&image)),
            error: None,
        }
    }

    /// Record for an analysed standalone image
    pub fn image(file: &Path, result: MarginAnalysisResult) -> Self {
        let assessment = PageAssessment::image_only(result);
        Self {
            file: file.to_path_buf(),
            page: 1,
            content_status: assessment.content_status(),
            text_status: None,
            image_status: assessment.image_status(),
            file_type: FileType::Image,
            details: AnalysisDetails::new()
                .with_value("Top Content", percent(result.top_content_percentage))
                .with_value("Bottom Content", percent(result.bottom_content_percentage))
                .with_value("Total Margin Content", percent(result.total_content_percentage)),
            error: None,
        }
    }

    /// Record for a PDF page that failed
    pub fn failed_page(file: &Path, page: u32, error: ErrorDescriptor) -> Self {
        Self {
            file: file.to_path_buf(),
            page,
            content_status: format!("Page {} Processing Failed", page),
            text_status: None,
            image_status: None,
            file_type: FileType::Pdf,
            details: AnalysisDetails::new(),
            error: Some(error),
        }
    }

    /// Record for a file that failed before any page could be analysed
    pub fn failed_file(file: &Path, file_type: FileType, error: ErrorDescriptor) -> Self {
        Self {
            file: file.to_path_buf(),
            page: 1,
            content_status: PROCESSING_FAILED.to_string(),
            text_status: None,
            image_status: None,
            file_type,
            details: AnalysisDetails::new(),
            error: Some(error),
        }
    }

    /// Encrypted PDFs are reported, not analysed
    pub fn encrypted(file: &Path, message: impl Into<String>) -> Self {
        Self::failed_file(
            file,
            FileType::Pdf,
            ErrorDescriptor::new(ErrorCategory::Encryption, ErrorSeverity::Warning, message),
        )
    }

    /// Keep only file, page and content status
    pub fn into_minimal(self) -> Self {
        Self {
            text_status: None,
            image_status: None,
            details: AnalysisDetails::new(),
            error: None,
            ..self
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ErrorDescriptor::display_message)
    }

    pub fn error_severity(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.severity.label())
    }

    pub fn file_display(&self) -> String {
        self.file.display().to_string()
    }
}
