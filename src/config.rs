//! Configuration layer for the counting pipeline.
//!
//! Every recognized inference parameter is an explicit, named field with a
//! documented default. There is no pass-through of unvalidated options to
//! the inference backend: if a knob is not listed here, the backend never
//! sees it.

use crate::detection::BoundingBox;
use crate::overlay::ColorMap;
use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Event name sent to the size-policy callback after a fresh inference.
pub const SET_SIZE_EVENT: &str = "set_size";

/// Default location of the rendered overlay, overwritten on every call.
pub const DEFAULT_OVERLAY_PATH: &str = ".cache/cytoseg_overlay.png";

/// Objective magnification the input image was acquired at. Selects the
/// inference strategy: x20 fields are resolved with a single dense pass,
/// x10 fields are sliced into overlapping tiles first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Magnification {
    X10,
    X20,
}

impl Magnification {
    /// Default user-facing confidence cutoff. The tiled path keeps a much
    /// lower floor because per-tile scores on small objects run low.
    pub fn default_min_score(&self) -> f32 {
        match self {
            Magnification::X20 => 0.05,
            Magnification::X10 => 0.01,
        }
    }
}

impl std::str::FromStr for Magnification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x10" | "10" => Ok(Magnification::X10),
            "x20" | "20" => Ok(Magnification::X20),
            _ => Err(format!("Unknown magnification: {s} (expected x10 or x20)")),
        }
    }
}

impl fmt::Display for Magnification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Magnification::X10 => write!(f, "x10"),
            Magnification::X20 => write!(f, "x20"),
        }
    }
}

/// Parameters forwarded to the inference backend for a single pass.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceParams {
    /// Minimum model confidence for a raw candidate to survive decoding.
    /// Applied before caching; user-facing filtering happens later.
    pub confidence_floor: f32,
    /// IoU threshold above which overlapping candidates of the same class
    /// are merged away.
    pub overlap_suppression: f32,
    /// Rasterize mask boundaries at full image resolution instead of
    /// upscaling the coarse prototype grid.
    pub retina_masks: bool,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence_floor: 0.2,
            overlap_suppression: 0.6,
            retina_masks: true,
        }
    }
}

impl InferenceParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            bail!(
                "confidence_floor must be within [0,1], got {}",
                self.confidence_floor
            );
        }
        if !(0.0..=1.0).contains(&self.overlap_suppression) {
            bail!(
                "overlap_suppression must be within [0,1], got {}",
                self.overlap_suppression
            );
        }
        Ok(())
    }
}

/// Tiling geometry for the sliced (x10) inference path.
#[derive(Debug, Clone, Serialize)]
pub struct TilingParams {
    pub slice_width: u32,
    pub slice_height: u32,
    /// Fraction of the slice width shared between horizontal neighbours.
    pub overlap_width_ratio: f32,
    /// Fraction of the slice height shared between vertical neighbours.
    pub overlap_height_ratio: f32,
}

impl Default for TilingParams {
    fn default() -> Self {
        Self {
            slice_width: 128,
            slice_height: 128,
            overlap_width_ratio: 0.1,
            overlap_height_ratio: 0.1,
        }
    }
}

impl TilingParams {
    pub fn validate(&self) -> Result<()> {
        if self.slice_width == 0 || self.slice_height == 0 {
            bail!("slice dimensions must be non-zero");
        }
        if !(0.0..1.0).contains(&self.overlap_width_ratio)
            || !(0.0..1.0).contains(&self.overlap_height_ratio)
        {
            bail!("overlap ratios must be within [0,1)");
        }
        Ok(())
    }
}

/// Callback a host registers to be told about fresh inference results.
/// Invoked with an event name and the full unfiltered box set.
pub type SizeSignal = Box<dyn Fn(&str, &[BoundingBox])>;

/// Caller-supplied object-size policy: the size bounds applied by the
/// size filter, the palette used for overlays, and an optional signal the
/// host uses to calibrate its size-range controls.
pub struct SizePolicy {
    pub min_size: f32,
    pub max_size: f32,
    pub color_map: ColorMap,
    pub signal: Option<SizeSignal>,
}

impl SizePolicy {
    pub fn new(min_size: f32, max_size: f32) -> Self {
        Self {
            min_size,
            max_size,
            color_map: ColorMap::default(),
            signal: None,
        }
    }

    pub fn with_color_map(mut self, color_map: ColorMap) -> Self {
        self.color_map = color_map;
        self
    }

    pub fn with_signal(mut self, signal: SizeSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub(crate) fn emit(&self, event: &str, boxes: &[BoundingBox]) {
        if let Some(signal) = &self.signal {
            signal(event, boxes);
        }
    }
}

impl fmt::Debug for SizePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizePolicy")
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("color_map", &self.color_map)
            .field("signal", &self.signal.is_some())
            .finish()
    }
}

/// Per-call options for `Segmenter::count`.
#[derive(Debug, Clone)]
pub struct CountOptions {
    /// Confidence cutoff for this call. `None` resolves to the operating
    /// mode's default (0.05 dense, 0.01 tiled).
    pub min_score: Option<f32>,
    /// Keep a binary mask per row when the table is first built. Off by
    /// default: counting does not need rasters in memory.
    pub store_bin_mask: bool,
    /// Render the surviving rows to `overlay_path`.
    pub render: bool,
    pub overlay_path: PathBuf,
    /// Overlay blend opacity.
    pub alpha: f32,
}

impl Default for CountOptions {
    fn default() -> Self {
        Self {
            min_score: None,
            store_bin_mask: false,
            render: true,
            overlay_path: PathBuf::from(DEFAULT_OVERLAY_PATH),
            alpha: 0.75,
        }
    }
}

/// Parse probability value (must be between 0.0 and 1.0)
pub fn parse_probability(s: &str) -> Result<f32, String> {
    let val = s
        .parse::<f32>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !(0.0..=1.0).contains(&val) {
        return Err(format!("Must be between 0.0 and 1.0, got {val}"));
    }
    Ok(val)
}
