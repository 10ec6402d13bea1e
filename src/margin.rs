//! Margin Analysis module
//!
//! Decides whether a rendered page (or a standalone image) carries content
//! inside its header and footer bands.
//!
//! Two detection paths exist and they intentionally use different policies:
//!
//! - **Image path**: pixels darker than [`NON_WHITE_CUTOFF`] are counted per
//!   band and a band only violates when its non-white fraction strictly
//!   exceeds the configured threshold.
//! - **Text path**: any non-empty text block overlapping a band violates it,
//!   regardless of threshold. Percentages are still computed for reporting.
//!
//! A page is flagged when either path reports either band ([`PageAssessment`]).

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// Luminance below this value counts as content (0-255 scale)
pub const NON_WHITE_CUTOFF: u8 = 250;

/// Header/footer band height in inches
pub const MARGIN_INCHES: f64 = 0.5;

/// Lowest accepted threshold (percent)
pub const MIN_THRESHOLD: f64 = 0.1;

/// Highest accepted threshold (percent)
pub const MAX_THRESHOLD: f64 = 10.0;

/// Default threshold (percent)
pub const DEFAULT_THRESHOLD: f64 = 1.0;

/// Default rasterization DPI
pub const DEFAULT_DPI: u32 = 200;

/// Margin analysis error types
#[derive(Debug, Error, PartialEq)]
pub enum MarginError {
    #[error("Threshold must be between {MIN_THRESHOLD}% and {MAX_THRESHOLD}%, got {0}%")]
    InvalidThreshold(f64),

    #[error("DPI must be greater than zero")]
    InvalidDpi,
}

pub type Result<T> = std::result::Result<T, MarginError>;

/// Validate a threshold percentage
pub fn validate_threshold(threshold: f64) -> Result<f64> {
    if threshold.is_finite() && (MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(MarginError::InvalidThreshold(threshold))
    }
}

/// Band thickness in pixels for a DPI (`ceil(0.5in * dpi)`, at least 1)
pub fn margin_pixels(dpi: u32) -> u32 {
    ((MARGIN_INCHES * dpi as f64).ceil() as u32).max(1)
}

/// Page geometry derived for one analysis pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginMeasurements {
    /// Page width in pixels
    pub width: u32,
    /// Page height in pixels
    pub height: u32,
    /// Rasterization DPI
    pub dpi: u32,
    /// Band thickness in pixels
    pub margin_px: u32,
    /// Violation threshold in percent
    pub threshold: f64,
}

impl MarginMeasurements {
    /// Derive measurements for a page, validating DPI and threshold
    pub fn new(width: u32, height: u32, dpi: u32, threshold: f64) -> Result<Self> {
        if dpi == 0 {
            return Err(MarginError::InvalidDpi);
        }
        let threshold = validate_threshold(threshold)?;

        Ok(Self {
            width,
            height,
            dpi,
            margin_px: margin_pixels(dpi),
            threshold,
        })
    }

    /// Header rows `[0, margin_px)`
    pub fn top_band(&self) -> Range<u32> {
        0..self.margin_px
    }

    /// Footer rows `[height - margin_px, height)`
    ///
    /// On pages shorter than the band, the start saturates at row 0.
    pub fn bottom_band(&self) -> Range<u32> {
        self.height.saturating_sub(self.margin_px)..self.height
    }

    /// Area of one band in pixels (`width * margin_px`)
    pub fn band_area(&self) -> u64 {
        self.width as u64 * self.margin_px as u64
    }

    /// True when the header and footer bands overlap
    ///
    /// Such pages are still analysed; pixels in the overlap are counted for
    /// both bands.
    pub fn bands_overlap(&self) -> bool {
        (self.height as u64) < 2 * self.margin_px as u64
    }

    /// Threshold as a fraction (0.0-1.0)
    pub fn threshold_fraction(&self) -> f64 {
        self.threshold / 100.0
    }
}

/// Result of one analysis pass over a page or image
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginAnalysisResult {
    pub has_top_content: bool,
    pub has_bottom_content: bool,
    /// Header content ratio (0-100)
    pub top_content_percentage: f64,
    /// Footer content ratio (0-100)
    pub bottom_content_percentage: f64,
    /// Combined ratio over both bands (0-100)
    pub total_content_percentage: f64,
}

impl MarginAnalysisResult {
    /// Either band violates
    pub fn has_content(&self) -> bool {
        self.has_top_content || self.has_bottom_content
    }
}

/// Axis-aligned box in page pixel space (origin top-left)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        (self.x1 - self.x0).max(0.0)
    }

    /// Scale every coordinate by `factor`
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            x0: self.x0 * factor,
            y0: self.y0 * factor,
            x1: self.x1 * factor,
            y1: self.y1 * factor,
        }
    }

    /// Area of the intersection with the horizontal strip `[start, end)`
    pub fn overlap_area(&self, start: f64, end: f64) -> f64 {
        let overlap_height = self.y1.min(end) - self.y0.max(start);
        if overlap_height <= 0.0 {
            return 0.0;
        }
        overlap_height * self.width()
    }
}

/// Text block extracted from a PDF page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub bbox: BoundingBox,
    pub text: String,
}

impl TextBlock {
    pub fn new(bbox: BoundingBox, text: impl Into<String>) -> Self {
        Self {
            bbox,
            text: text.into(),
        }
    }

    /// Whitespace-only blocks never count as content
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Margin analyzer
///
/// Holds a validated threshold and the DPI used to derive band sizes. The
/// analyzer itself is stateless and can be shared across worker threads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginAnalyzer {
    threshold: f64,
    dpi: u32,
}

impl Default for MarginAnalyzer {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            dpi: DEFAULT_DPI,
        }
    }
}

impl MarginAnalyzer {
    /// Create an analyzer with the default DPI
    pub fn new(threshold: f64) -> Result<Self> {
        Self::with_dpi(threshold, DEFAULT_DPI)
    }

    /// Create an analyzer with an explicit DPI
    pub fn with_dpi(threshold: f64, dpi: u32) -> Result<Self> {
        if dpi == 0 {
            return Err(MarginError::InvalidDpi);
        }
        Ok(Self {
            threshold: validate_threshold(threshold)?,
            dpi,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Derive measurements for a page of the given pixel size
    pub fn measure(&self, width: u32, height: u32) -> MarginMeasurements {
        MarginMeasurements {
            width,
            height,
            dpi: self.dpi,
            margin_px: margin_pixels(self.dpi),
            threshold: self.threshold,
        }
    }

    /// Threshold-gated pixel analysis of a luminance image
    pub fn analyze_image(
        &self,
        gray: &GrayImage,
        measurements: &MarginMeasurements,
    ) -> MarginAnalysisResult {
        let top_count = count_non_white(gray, measurements.top_band());
        let bottom_count = count_non_white(gray, measurements.bottom_band());
        let band_area = measurements.band_area();

        if band_area == 0 {
            return MarginAnalysisResult::default();
        }

        let area = band_area as f64;
        let top_fraction = top_count as f64 / area;
        let bottom_fraction = bottom_count as f64 / area;
        let cutoff = measurements.threshold_fraction();

        MarginAnalysisResult {
            has_top_content: top_fraction > cutoff,
            has_bottom_content: bottom_fraction > cutoff,
            top_content_percentage: top_fraction * 100.0,
            bottom_content_percentage: bottom_fraction * 100.0,
            total_content_percentage: (top_count + bottom_count) as f64 / (2.0 * area) * 100.0,
        }
    }

    /// Convert a decoded image to luminance and analyse it
    pub fn analyze_dynamic_image(&self, image: &DynamicImage) -> MarginAnalysisResult {
        let gray = image.to_luma8();
        let measurements = self.measure(gray.width(), gray.height());
        self.analyze_image(&gray, &measurements)
    }

    /// Zero-tolerance text analysis
    ///
    /// Block coordinates must already be in the same pixel space as
    /// `measurements`.
    pub fn analyze_text_blocks(
        &self,
        blocks: &[TextBlock],
        measurements: &MarginMeasurements,
    ) -> MarginAnalysisResult {
        let top = measurements.top_band();
        let bottom = measurements.bottom_band();

        let mut has_top_content = false;
        let mut has_bottom_content = false;
        let mut top_area = 0.0;
        let mut bottom_area = 0.0;

        for block in blocks.iter().filter(|b| b.has_text()) {
            let overlap_top = block.bbox.overlap_area(top.start as f64, top.end as f64);
            if overlap_top > 0.0 {
                has_top_content = true;
                top_area += overlap_top;
            }

            let overlap_bottom = block
                .bbox
                .overlap_area(bottom.start as f64, bottom.end as f64);
            if overlap_bottom > 0.0 {
                has_bottom_content = true;
                bottom_area += overlap_bottom;
            }
        }

        let band_area = measurements.band_area() as f64;
        let (top_pct, bottom_pct, total_pct) = if band_area > 0.0 {
            (
                top_area / band_area * 100.0,
                bottom_area / band_area * 100.0,
                (top_area + bottom_area) / (2.0 * band_area) * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        MarginAnalysisResult {
            has_top_content,
            has_bottom_content,
            top_content_percentage: top_pct,
            bottom_content_percentage: bottom_pct,
            total_content_percentage: total_pct,
        }
    }
}

fn count_non_white(gray: &GrayImage, rows: Range<u32>) -> u64 {
    let end = rows.end.min(gray.height());
    let start = rows.start.min(end);

    gray.rows()
        .skip(start as usize)
        .take((end - start) as usize)
        .map(|row| row.filter(|p| p.0[0] < NON_WHITE_CUTOFF).count() as u64)
        .sum()
}

/// Build a "<prefix> header and footer" style location message
fn describe_locations(prefix: &str, top: bool, bottom: bool) -> String {
    match (top, bottom) {
        (true, true) => format!("{} header and footer", prefix),
        (true, false) => format!("{} header", prefix),
        (false, true) => format!("{} footer", prefix),
        (false, false) => WITHIN_MARGINS.to_string(),
    }
}

/// Status for pages with no violation
pub const WITHIN_MARGINS: &str = "All content within margins";

/// Combined verdict for one page
///
/// Text results dominate: any text in a band flags the page even when the
/// pixel path stays below threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PageAssessment {
    pub text: Option<MarginAnalysisResult>,
    pub image: Option<MarginAnalysisResult>,
}

impl PageAssessment {
    /// Assessment of a PDF page (text + raster)
    pub fn pdf(text: MarginAnalysisResult, image: MarginAnalysisResult) -> Self {
        Self {
            text: Some(text),
            image: Some(image),
        }
    }

    /// Assessment of a standalone image (raster only)
    pub fn image_only(image: MarginAnalysisResult) -> Self {
        Self {
            text: None,
            image: Some(image),
        }
    }

    pub fn has_top_content(&self) -> bool {
        self.text.is_some_and(|t| t.has_top_content)
            || self.image.is_some_and(|i| i.has_top_content)
    }

    pub fn has_bottom_content(&self) -> bool {
        self.text.is_some_and(|t| t.has_bottom_content)
            || self.image.is_some_and(|i| i.has_bottom_content)
    }

    /// Page-level flag
    pub fn is_flagged(&self) -> bool {
        self.has_top_content() || self.has_bottom_content()
    }

    /// "Content found in ..." / "All content within margins"
    pub fn content_status(&self) -> String {
        describe_locations(
            "Content found in",
            self.has_top_content(),
            self.has_bottom_content(),
        )
    }

    pub fn text_status(&self) -> Option<String> {
        self.text
            .map(|t| describe_locations("Text found in", t.has_top_content, t.has_bottom_content))
    }

    pub fn image_status(&self) -> Option<String> {
        self.image.map(|i| {
            describe_locations(
                "Image content found in",
                i.has_top_content,
                i.has_bottom_content,
            )
        })
    }
}
