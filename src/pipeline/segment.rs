//! Segment planning: cut a page image into overlapping horizontal strips.
//!
//! ```text
//!   0 ┌──────────────┐
//!     │  segment 0   │
//! 450 ├──────────────┤ ┐
//!     │ overlap band │ │ both segments see these rows
//! 550 ├──────────────┤ ┘
//!     │  segment 1   │
//! 1000└──────────────┘        H=1000, num_splits=2, overlap_ratio=0.1
//! ```
//!
//! The base strip height is `H / num_splits`. Every shared edge is pushed
//! outwards by `floor(base × overlap_ratio)` pixels, so the band two
//! neighbours have in common is twice that tall. The last strip always ends
//! at `H`, absorbing the integer-division remainder.
//!
//! The plan records each band explicitly; the merger reads the bands instead
//! of re-deriving them from ratios.

use crate::config::validate_split_params;
use crate::error::ExtractError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One horizontal strip of a page, `[top, bottom)` in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// 0-indexed position, top to bottom.
    pub index: usize,
    pub top: u32,
    pub bottom: u32,
    /// Band shared with the previous segment, if any.
    pub leading_overlap: Option<OverlapBand>,
    /// Band shared with the next segment, if any.
    pub trailing_overlap: Option<OverlapBand>,
}

impl Segment {
    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// The pixel rows `[top, bottom)` covered by two adjacent segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapBand {
    /// Index of the upper segment; the lower one is `upper + 1`.
    pub upper: usize,
    pub top: u32,
    pub bottom: u32,
}

impl OverlapBand {
    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Ordered segments for one page plus the bands between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub page_height: u32,
    pub segments: Vec<Segment>,
    /// `bands[i]` sits between `segments[i]` and `segments[i + 1]`.
    pub bands: Vec<OverlapBand>,
}

impl SegmentPlan {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Plan the segments for a page of `page_height` pixels.
///
/// # Errors
/// [`ExtractError::Configuration`] if `num_splits == 0` or `overlap_ratio`
/// is outside `[0, 1)`.
pub fn plan(page_height: u32, num_splits: usize, overlap_ratio: f64) -> Result<SegmentPlan, ExtractError> {
    validate_split_params(num_splits, overlap_ratio)?;

    // A strip must be at least one pixel tall.
    let max_splits = page_height.max(1) as usize;
    let splits = if num_splits > max_splits {
        warn!(
            "Page is only {} px tall; using {} segments instead of {}",
            page_height, max_splits, num_splits
        );
        max_splits
    } else {
        num_splits
    };

    let splits_u32 = splits as u32;
    let base = page_height / splits_u32;
    let overlap_px = (f64::from(base) * overlap_ratio).floor() as u32;

    let mut segments = Vec::with_capacity(splits);
    for i in 0..splits_u32 {
        let first = i == 0;
        let last = i == splits_u32 - 1;

        let top = if first { 0 } else { (i * base).saturating_sub(overlap_px) };
        let bottom = if last {
            page_height
        } else {
            ((i + 1) * base + overlap_px).min(page_height)
        };

        segments.push(Segment {
            index: i as usize,
            top,
            bottom,
            leading_overlap: None,
            trailing_overlap: None,
        });
    }

    let bands: Vec<OverlapBand> = segments
        .windows(2)
        .map(|pair| OverlapBand {
            upper: pair[0].index,
            top: pair[1].top,
            bottom: pair[0].bottom,
        })
        .collect();

    for band in &bands {
        segments[band.upper].trailing_overlap = Some(*band);
        segments[band.upper + 1].leading_overlap = Some(*band);
    }

    Ok(SegmentPlan {
        page_height,
        segments,
        bands,
    })
}

/// Crop the full-width strip for `segment` out of a page image.
pub fn crop_segment(page: &DynamicImage, segment: &Segment) -> DynamicImage {
    page.crop_imm(0, segment.top, page.width(), segment.height())
}
