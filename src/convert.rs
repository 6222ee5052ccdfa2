//! Format converters between native inference results and the table.

use image::{DynamicImage, GenericImageView};

use crate::detection::{Detection, DetectionTable};
use crate::engine::{DenseOutput, RawOutput, TilePrediction};

/// Convert the dense pass's native result into a table, denormalizing
/// boxes to pixel units of the original image. Binary masks are copied
/// into rows only when `store_bin_mask` is set; counting does not need
/// them resident.
pub fn dense_to_table(output: &DenseOutput, store_bin_mask: bool) -> DetectionTable {
    let (width, height) = output.image.dimensions();

    let rows = output
        .instances
        .iter()
        .map(|inst| Detection {
            bbox: inst
                .bbox
                .scaled(width as f32, height as f32)
                .clamped(width as f32, height as f32),
            mask: if store_bin_mask {
                inst.mask.clone()
            } else {
                None
            },
            confidence: inst.confidence,
            class_id: inst.class_id,
        })
        .collect();

    DetectionTable {
        rows,
        image_width: width,
        image_height: height,
    }
}

/// Convert merged COCO-style tile predictions (already in absolute
/// pixels) into a table, clamping boxes to the image bounds.
pub fn tiled_to_table(
    predictions: &[TilePrediction],
    image_width: u32,
    image_height: u32,
) -> DetectionTable {
    let rows = predictions
        .iter()
        .map(|pred| Detection {
            bbox: pred
                .corner_box()
                .clamped(image_width as f32, image_height as f32),
            mask: pred.mask.clone(),
            confidence: pred.score,
            class_id: pred.category_id,
        })
        .collect();

    DetectionTable {
        rows,
        image_width,
        image_height,
    }
}

/// Convert whichever native result an engine produced, handing back the
/// original image alongside the table for caching.
pub fn raw_to_table(raw: RawOutput, store_bin_mask: bool) -> (DetectionTable, DynamicImage) {
    match raw {
        RawOutput::Dense(output) => {
            let table = dense_to_table(&output, store_bin_mask);
            (table, output.image)
        }
        RawOutput::Tiled { predictions, image } => {
            let (width, height) = image.dimensions();
            let table = tiled_to_table(&predictions, width, height);
            (table, image)
        }
    }
}

/// Everything the renderer needs for one overlay pass.
pub struct OverlayScene<'a> {
    pub image: &'a DynamicImage,
    pub rows: &'a [Detection],
}

/// Inverse mapping: rebuild a renderable structure from a table subset.
/// Returns `None` for an empty subset, signaling "nothing to render".
pub fn table_to_overlay<'a>(
    table: &'a DetectionTable,
    image: &'a DynamicImage,
) -> Option<OverlayScene<'a>> {
    if table.is_empty() {
        return None;
    }
    Some(OverlayScene {
        image,
        rows: &table.rows,
    })
}
