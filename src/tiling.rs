//! Sliced inference for low-magnification fields.
//!
//! An x10 field of view holds many more, smaller objects than a single
//! dense pass resolves cleanly, so the image is split into overlapping
//! fixed-size tiles, each tile is inferred separately, and the tile-local
//! results are merged back into absolute image coordinates.

use anyhow::Result;
use image::{DynamicImage, GenericImageView};
use log::debug;
use std::path::Path;

use crate::config::{InferenceParams, Magnification, TilingParams};
use crate::detection::BinaryMask;
use crate::engine::{DenseInstance, InferenceEngine, RawOutput, TilePrediction};
use crate::model::SegModel;
use crate::postprocessing::nms;

/// One tile of the slicing grid, in absolute pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

fn axis_positions(extent: u32, slice: u32, overlap_ratio: f32) -> Vec<u32> {
    if extent <= slice {
        return vec![0];
    }

    let step = ((slice as f32) * (1.0 - overlap_ratio)).round().max(1.0) as u32;
    let mut positions = Vec::new();
    let mut pos = 0u32;
    loop {
        if pos + slice >= extent {
            // Final tile sits flush with the image edge
            positions.push(extent - slice);
            break;
        }
        positions.push(pos);
        pos += step;
    }
    positions.dedup();
    positions
}

/// Overlapping tile grid covering the whole image. Tiles are clipped to
/// the image when it is smaller than one slice.
pub fn tile_grid(image_width: u32, image_height: u32, params: &TilingParams) -> Vec<Tile> {
    let xs = axis_positions(image_width, params.slice_width, params.overlap_width_ratio);
    let ys = axis_positions(image_height, params.slice_height, params.overlap_height_ratio);

    let mut tiles = Vec::with_capacity(xs.len() * ys.len());
    for &y in &ys {
        for &x in &xs {
            tiles.push(Tile {
                x,
                y,
                width: params.slice_width.min(image_width - x),
                height: params.slice_height.min(image_height - y),
            });
        }
    }
    tiles
}

/// Lift tile-local instances (normalized within the tile) into COCO-style
/// predictions in absolute pixels of the full image.
pub fn to_absolute(
    instances: Vec<DenseInstance>,
    tile: &Tile,
    image_width: u32,
    image_height: u32,
) -> Vec<TilePrediction> {
    instances
        .into_iter()
        .map(|inst| {
            let local = inst.bbox.scaled(tile.width as f32, tile.height as f32);
            let x = (tile.x as f32 + local.x1).clamp(0.0, image_width as f32);
            let y = (tile.y as f32 + local.y1).clamp(0.0, image_height as f32);
            let w = local.width().min(image_width as f32 - x);
            let h = local.height().min(image_height as f32 - y);

            let mask = inst
                .mask
                .map(|m| blit_mask(&m, tile, image_width, image_height));

            TilePrediction {
                bbox_xywh: [x, y, w, h],
                score: inst.confidence,
                category_id: inst.class_id,
                mask,
            }
        })
        .collect()
}

/// Place a tile-sized mask into a full-image raster at the tile offset.
fn blit_mask(local: &BinaryMask, tile: &Tile, image_width: u32, image_height: u32) -> BinaryMask {
    let mut full = BinaryMask::new(image_width, image_height);
    for y in 0..local.height.min(tile.height) {
        for x in 0..local.width.min(tile.width) {
            if local.get(x, y) != 0 {
                let gx = tile.x + x;
                let gy = tile.y + y;
                if gx < image_width && gy < image_height {
                    full.set(gx, gy, 1);
                }
            }
        }
    }
    full
}

/// Merge predictions from all tiles: objects straddling an overlap region
/// are detected by both neighbours, so duplicates are suppressed by IoU.
pub fn merge_predictions(
    predictions: Vec<TilePrediction>,
    iou_threshold: f32,
) -> Vec<TilePrediction> {
    nms(
        predictions,
        iou_threshold,
        |p| p.corner_box(),
        |p| p.category_id,
        |p| p.score,
    )
}

/// Low-magnification engine: sliced inference with fixed tile size and
/// per-axis overlap ratios, merged before conversion.
pub struct TiledEngine {
    model: SegModel,
    tiling: TilingParams,
    params: InferenceParams,
}

impl TiledEngine {
    pub fn new(model: SegModel, tiling: TilingParams, params: InferenceParams) -> Result<Self> {
        tiling.validate()?;
        params.validate()?;
        Ok(Self {
            model,
            tiling,
            params,
        })
    }

    pub fn from_path(model_path: &Path, device: &str) -> Result<Self> {
        Self::new(
            SegModel::load(model_path, device)?,
            TilingParams::default(),
            InferenceParams::default(),
        )
    }

    fn run_tiles(&mut self, image: &DynamicImage) -> Result<Vec<TilePrediction>> {
        let (width, height) = image.dimensions();
        let tiles = tile_grid(width, height, &self.tiling);
        debug!(
            "Slicing {width}x{height} image into {} tile(s) of {}x{}",
            tiles.len(),
            self.tiling.slice_width,
            self.tiling.slice_height
        );

        let mut predictions = Vec::new();
        for tile in &tiles {
            let view = image.crop_imm(tile.x, tile.y, tile.width, tile.height);
            let instances = self.model.infer_image(&view, &self.params)?;
            predictions.extend(to_absolute(instances, tile, width, height));
        }

        Ok(merge_predictions(
            predictions,
            self.params.overlap_suppression,
        ))
    }
}

impl InferenceEngine for TiledEngine {
    fn infer(&mut self, image_path: &Path) -> Result<RawOutput> {
        let image = image::open(image_path)?;
        let predictions = self.run_tiles(&image)?;
        Ok(RawOutput::Tiled { predictions, image })
    }

    fn default_min_score(&self) -> f32 {
        Magnification::X10.default_min_score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;

    #[test]
    fn test_axis_positions_for_256_with_10_percent_overlap() {
        // 128-wide slices stepping by 115 pixels, final slice edge-flush
        assert_eq!(axis_positions(256, 128, 0.1), vec![0, 115, 128]);
    }

    #[test]
    fn test_axis_positions_small_image_single_tile() {
        assert_eq!(axis_positions(100, 128, 0.1), vec![0]);
    }

    #[test]
    fn test_tile_grid_covers_every_pixel() {
        let params = TilingParams::default();
        let tiles = tile_grid(300, 200, &params);

        let mut covered = vec![false; 300 * 200];
        for t in &tiles {
            for y in t.y..t.y + t.height {
                for x in t.x..t.x + t.width {
                    covered[(y * 300 + x) as usize] = true;
                }
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn test_tile_grid_clips_to_small_images() {
        let params = TilingParams::default();
        let tiles = tile_grid(100, 60, &params);
        assert_eq!(tiles.len(), 1);
        assert_eq!(
            tiles[0],
            Tile {
                x: 0,
                y: 0,
                width: 100,
                height: 60
            }
        );
    }

    fn instance(bbox: BoundingBox, confidence: f32) -> DenseInstance {
        DenseInstance {
            bbox,
            mask: None,
            confidence,
            class_id: 0,
        }
    }

    #[test]
    fn test_to_absolute_offsets_into_image_coordinates() {
        let tile = Tile {
            x: 115,
            y: 0,
            width: 128,
            height: 128,
        };
        // Tile-normalized box in the middle of the tile
        let preds = to_absolute(
            vec![instance(BoundingBox::new(0.25, 0.25, 0.75, 0.75), 0.9)],
            &tile,
            256,
            256,
        );
        assert_eq!(preds.len(), 1);
        let [x, y, w, h] = preds[0].bbox_xywh;
        assert!((x - 147.0).abs() < 1e-3);
        assert!((y - 32.0).abs() < 1e-3);
        assert!((w - 64.0).abs() < 1e-3);
        assert!((h - 64.0).abs() < 1e-3);
        // Absolute, not tile-local: x exceeds the tile-local range
        assert!(x > 128.0);
    }

    #[test]
    fn test_merge_suppresses_cross_tile_duplicates() {
        // The same object seen by two overlapping tiles
        let a = TilePrediction {
            bbox_xywh: [110.0, 40.0, 30.0, 30.0],
            score: 0.9,
            category_id: 0,
            mask: None,
        };
        let b = TilePrediction {
            bbox_xywh: [111.0, 41.0, 30.0, 30.0],
            score: 0.7,
            category_id: 0,
            mask: None,
        };
        let merged = merge_predictions(vec![a, b], 0.6);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_blit_mask_places_tile_foreground_at_offset() {
        let mut local = BinaryMask::new(4, 4);
        local.set(1, 2, 1);
        let tile = Tile {
            x: 10,
            y: 20,
            width: 4,
            height: 4,
        };
        let full = blit_mask(&local, &tile, 32, 32);
        assert_eq!(full.get(11, 22), 1);
        assert_eq!(full.coverage(), 1);
    }
}
