//! Document rendering
//!
//! Page rasterisation and text extraction are delegated to external tools.
//! [`PageRenderer`] is the seam the pipeline talks to; [`PopplerRenderer`]
//! implements it with lopdf for structure and the Poppler command line
//! tools for pixels and text boxes.

use image::{GrayImage, ImageError, ImageFormat};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

use crate::errors::{ErrorCategory, ErrorDescriptor, ErrorSeverity};
use crate::margin::{BoundingBox, TextBlock};

/// PDF user-space units per inch
pub const POINTS_PER_INCH: f64 = 72.0;

/// Document error types
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("PDF is encrypted: {0}")]
    Encrypted(PathBuf),

    #[error("Invalid PDF: {0}")]
    InvalidPdf(String),

    #[error("Page {page} out of range (document has {count} pages)")]
    PageOutOfRange { page: usize, count: usize },

    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

impl DocumentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DocumentError::NotFound(_) => ErrorCategory::FileAccess,
            DocumentError::Encrypted(_) => ErrorCategory::Encryption,
            DocumentError::InvalidPdf(_)
            | DocumentError::PageOutOfRange { .. }
            | DocumentError::ToolFailed { .. } => ErrorCategory::PdfProcessing,
            DocumentError::ToolNotFound(_) => ErrorCategory::System,
            DocumentError::Image(ImageError::Limits(_)) => ErrorCategory::Memory,
            DocumentError::Image(ImageError::IoError(e)) => ErrorCategory::from_io(e),
            DocumentError::Image(ImageError::Decoding(_) | ImageError::Unsupported(_)) => {
                ErrorCategory::Format
            }
            DocumentError::Image(_) => ErrorCategory::ImageProcessing,
            DocumentError::Io(e) => ErrorCategory::from_io(e),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Memory | ErrorCategory::System => ErrorSeverity::Critical,
            ErrorCategory::Encryption => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor::new(self.category(), self.severity(), self.to_string())
    }
}

/// Source of page pixels and text for PDF documents
///
/// Page indices are 0-based. Text block coordinates are returned in the
/// pixel space of a raster rendered at the same `dpi`.
pub trait PageRenderer: Send + Sync {
    fn page_count(&self, path: &Path) -> Result<usize>;

    fn render_page(&self, path: &Path, index: usize, dpi: u32) -> Result<GrayImage>;

    fn text_blocks(&self, path: &Path, index: usize, dpi: u32) -> Result<Vec<TextBlock>>;
}

/// Decode an image file and convert it to luminance
pub fn load_image(path: &Path) -> Result<GrayImage> {
    if !path.exists() {
        return Err(DocumentError::NotFound(path.to_path_buf()));
    }
    Ok(image::open(path)?.to_luma8())
}

/// Page count via lopdf, detecting encrypted documents
pub fn pdf_page_count(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Err(DocumentError::NotFound(path.to_path_buf()));
    }

    let document = lopdf::Document::load(path).map_err(|e| {
        // lopdf reports encryption only through its message
        let message = e.to_string();
        if message.to_ascii_lowercase().contains("encrypt") {
            DocumentError::Encrypted(path.to_path_buf())
        } else {
            DocumentError::InvalidPdf(message)
        }
    })?;

    if document.is_encrypted() {
        return Err(DocumentError::Encrypted(path.to_path_buf()));
    }
    Ok(document.get_pages().len())
}

/// Poppler-based renderer (`pdftoppm`, `pdftotext`)
#[derive(Debug, Clone)]
pub struct PopplerRenderer {
    pdftoppm: String,
    pdftotext: String,
}

impl Default for PopplerRenderer {
    fn default() -> Self {
        Self {
            pdftoppm: "pdftoppm".to_string(),
            pdftotext: "pdftotext".to_string(),
        }
    }
}

impl PopplerRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit tool names or paths
    pub fn with_tools(pdftoppm: impl Into<String>, pdftotext: impl Into<String>) -> Self {
        Self {
            pdftoppm: pdftoppm.into(),
            pdftotext: pdftotext.into(),
        }
    }

    /// Whether both tools can be found
    pub fn is_available(&self) -> bool {
        which::which(&self.pdftoppm).is_ok() && which::which(&self.pdftotext).is_ok()
    }

    fn run(tool: &str, args: &[String]) -> Result<Vec<u8>> {
        let program = which::which(tool).map_err(|_| DocumentError::ToolNotFound(tool.to_string()))?;
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(DocumentError::ToolFailed {
                tool: tool.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn page_args(path: &Path, index: usize) -> Vec<String> {
        let page = (index + 1).to_string();
        vec![
            "-f".to_string(),
            page.clone(),
            "-l".to_string(),
            page,
            path.display().to_string(),
        ]
    }
}

impl PageRenderer for PopplerRenderer {
    fn page_count(&self, path: &Path) -> Result<usize> {
        pdf_page_count(path)
    }

    fn render_page(&self, path: &Path, index: usize, dpi: u32) -> Result<GrayImage> {
        let mut args = vec![
            "-png".to_string(),
            "-gray".to_string(),
            "-r".to_string(),
            dpi.to_string(),
        ];
        args.extend(Self::page_args(path, index));

        let png = Self::run(&self.pdftoppm, &args)?;
        if png.is_empty() {
            return Err(DocumentError::ToolFailed {
                tool: self.pdftoppm.clone(),
                message: format!("no output for page {}", index + 1),
            });
        }
        tracing::trace!(page = index + 1, bytes = png.len(), "page rasterised");
        Ok(image::load_from_memory_with_format(&png, ImageFormat::Png)?.to_luma8())
    }

    fn text_blocks(&self, path: &Path, index: usize, dpi: u32) -> Result<Vec<TextBlock>> {
        let mut args = vec!["-bbox-layout".to_string(), "-enc".to_string(), "UTF-8".to_string()];
        args.extend(Self::page_args(path, index));
        args.push("-".to_string());

        let xhtml = Self::run(&self.pdftotext, &args)?;
        Ok(parse_bbox_layout(
            &String::from_utf8_lossy(&xhtml),
            dpi as f64 / POINTS_PER_INCH,
        ))
    }
}

lazy_static! {
    static ref BLOCK_RE: Regex = Regex::new(
        r#"(?s)<block xMin="([-\d.]+)" yMin="([-\d.]+)" xMax="([-\d.]+)" yMax="([-\d.]+)">(.*?)</block>"#
    )
    .unwrap();
    static ref WORD_RE: Regex = Regex::new(r"(?s)<word[^>]*>(.*?)</word>").unwrap();
}

/// Parse `pdftotext -bbox-layout` output into text blocks
///
/// Coordinates are in points with a top-left origin and are multiplied by
/// `scale`. Blocks must carry their attributes in the order Poppler emits
/// them (`xMin`, `yMin`, `xMax`, `yMax`) with nothing in between; any other
/// `<block>` shape is skipped.
pub fn parse_bbox_layout(xhtml: &str, scale: f64) -> Vec<TextBlock> {
    BLOCK_RE
        .captures_iter(xhtml)
        .filter_map(|caps| {
            let coord = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());
            let bbox = BoundingBox::new(coord(1)?, coord(2)?, coord(3)?, coord(4)?).scaled(scale);
            let words: Vec<String> = WORD_RE
                .captures_iter(caps.get(5).map_or("", |m| m.as_str()))
                .filter_map(|w| w.get(1).map(|m| unescape(m.as_str())))
                .collect();
            Some(TextBlock::new(bbox, words.join(" ")))
        })
        .collect()
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
