//! Inference capability contract.
//!
//! The two operating modes (dense whole-image pass, sliced tiled pass)
//! produce structurally different native results. Both are modeled here as
//! variants of `RawOutput` behind the single `InferenceEngine` trait, so
//! the orchestration layer dispatches on operating mode without duplicated
//! code paths. Everything downstream of `infer` treats these results as
//! opaque input to the format converters.

use crate::detection::{BinaryMask, BoundingBox};
use anyhow::Result;
use image::DynamicImage;
use std::path::Path;

/// One instance decoded from the dense pass. The box is in normalized
/// [0,1] coordinates of the source image; the converter denormalizes it.
#[derive(Debug, Clone)]
pub struct DenseInstance {
    pub bbox: BoundingBox,
    pub mask: Option<BinaryMask>,
    pub confidence: f32,
    pub class_id: u32,
}

/// Native result bundle of the dense pass: decoded instances plus the
/// original image as the backend loaded it.
#[derive(Debug)]
pub struct DenseOutput {
    pub instances: Vec<DenseInstance>,
    pub image: DynamicImage,
}

/// COCO-style per-instance prediction from the sliced pass. The bbox is
/// `[x, y, width, height]` in absolute pixels of the full image.
#[derive(Debug, Clone)]
pub struct TilePrediction {
    pub bbox_xywh: [f32; 4],
    pub score: f32,
    pub category_id: u32,
    pub mask: Option<BinaryMask>,
}

impl TilePrediction {
    pub fn corner_box(&self) -> BoundingBox {
        let [x, y, w, h] = self.bbox_xywh;
        BoundingBox::new(x, y, x + w, y + h)
    }
}

/// Heterogeneous native output of a single inference call.
#[derive(Debug)]
pub enum RawOutput {
    Dense(DenseOutput),
    Tiled {
        predictions: Vec<TilePrediction>,
        image: DynamicImage,
    },
}

impl RawOutput {
    pub fn image(&self) -> &DynamicImage {
        match self {
            RawOutput::Dense(out) => &out.image,
            RawOutput::Tiled { image, .. } => image,
        }
    }
}

/// A loaded inference backend for one operating mode.
///
/// Implementations run to completion synchronously; a slow model call
/// blocks the caller. Failures propagate unmodified.
pub trait InferenceEngine {
    /// Run inference on the image at `image_path` and return the native
    /// result bundle, including the image itself.
    fn infer(&mut self, image_path: &Path) -> Result<RawOutput>;

    /// Default user-facing confidence cutoff for this operating mode.
    fn default_min_score(&self) -> f32;
}
