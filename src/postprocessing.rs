//! Decoding of the segmentation model's raw output tensors.
//!
//! The detection head emits `[1, 4 + num_classes + num_coeffs, N]`: box
//! center/size in model pixels, per-class scores, then mask coefficients
//! matched against the prototype tensor `[1, num_coeffs, ph, pw]`.

use crate::config::InferenceParams;
use crate::detection::{BinaryMask, BoundingBox};
use crate::engine::DenseInstance;
use crate::preprocessing::Letterbox;
use anyhow::Result;
use ndarray::{Array, Array2};

struct Candidate {
    bbox: BoundingBox,
    confidence: f32,
    class_id: u32,
    coeffs: Vec<f32>,
}

/// Greedy per-class non-maximum suppression, highest confidence first.
pub fn nms<T>(
    items: Vec<T>,
    iou_threshold: f32,
    bbox: impl Fn(&T) -> BoundingBox,
    class_id: impl Fn(&T) -> u32,
    confidence: impl Fn(&T) -> f32,
) -> Vec<T> {
    if items.is_empty() {
        return items;
    }

    use std::collections::HashMap;
    let mut class_groups: HashMap<u32, Vec<T>> = HashMap::new();
    for item in items {
        class_groups.entry(class_id(&item)).or_default().push(item);
    }

    let mut all_results = Vec::new();

    for (_, mut group) in class_groups {
        group.sort_by(|a, b| {
            confidence(b)
                .partial_cmp(&confidence(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut suppressed = vec![false; group.len()];
        let boxes: Vec<BoundingBox> = group.iter().map(&bbox).collect();

        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..group.len() {
                if !suppressed[j] && boxes[i].iou(&boxes[j]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }

        for (item, dropped) in group.into_iter().zip(suppressed) {
            if !dropped {
                all_results.push(item);
            }
        }
    }

    all_results
}

/// Decode one forward pass into instances with normalized boxes and,
/// when prototypes are available, binary masks at original resolution.
pub fn decode_output(
    output: &Array<f32, ndarray::IxDyn>,
    protos: Option<&Array<f32, ndarray::IxDyn>>,
    letterbox: &Letterbox,
    params: &InferenceParams,
) -> Result<Vec<DenseInstance>> {
    let shape = output.shape();
    if shape.len() != 3 {
        return Err(anyhow::anyhow!("Expected 3D output, got {}D", shape.len()));
    }

    let num_coeffs = protos.map(|p| p.shape()[1]).unwrap_or(0);
    if shape[1] < 5 + num_coeffs {
        return Err(anyhow::anyhow!(
            "Output channel count {} too small for {} mask coefficients",
            shape[1],
            num_coeffs
        ));
    }
    let num_classes = shape[1] - 4 - num_coeffs;
    let num_boxes = shape[2];

    let mut candidates = Vec::new();

    for i in 0..num_boxes {
        let x_center = output[[0, 0, i]];
        let y_center = output[[0, 1, i]];
        let width = output[[0, 2, i]];
        let height = output[[0, 3, i]];

        let mut max_confidence = 0.0;
        let mut best_class_id = 0;
        for class_idx in 0..num_classes {
            let class_confidence = output[[0, 4 + class_idx, i]];
            if class_confidence > max_confidence {
                max_confidence = class_confidence;
                best_class_id = class_idx as u32;
            }
        }

        if max_confidence <= params.confidence_floor {
            continue;
        }

        // Corners in model pixels, then back to normalized image coords
        let (x1, y1) = letterbox.to_normalized(x_center - width / 2.0, y_center - height / 2.0);
        let (x2, y2) = letterbox.to_normalized(x_center + width / 2.0, y_center + height / 2.0);

        let coeffs = (0..num_coeffs)
            .map(|k| output[[0, 4 + num_classes + k, i]])
            .collect();

        candidates.push(Candidate {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            confidence: max_confidence,
            class_id: best_class_id,
            coeffs,
        });
    }

    let mut kept = nms(
        candidates,
        params.overlap_suppression,
        |c| c.bbox,
        |c| c.class_id,
        |c| c.confidence,
    );
    kept.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let instances = kept
        .into_iter()
        .map(|c| {
            let mask = protos
                .map(|p| rasterize_mask(&c.coeffs, p, &c.bbox, letterbox, params.retina_masks));
            DenseInstance {
                bbox: c.bbox,
                mask,
                confidence: c.confidence,
                class_id: c.class_id,
            }
        })
        .collect();

    Ok(instances)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Bilinear interpolation for smooth upscaling. Samples a 2D array at
/// fractional coordinates (u, v).
pub fn bilinear_sample(data: &Array2<f32>, u: f32, v: f32) -> f32 {
    let (rows, cols) = data.dim();

    let u = u.clamp(0.0, (cols - 1) as f32);
    let v = v.clamp(0.0, (rows - 1) as f32);

    let u0 = u.floor() as usize;
    let v0 = v.floor() as usize;
    let u1 = (u0 + 1).min(cols - 1);
    let v1 = (v0 + 1).min(rows - 1);

    let fu = u - u0 as f32;
    let fv = v - v0 as f32;

    let val00 = data[[v0, u0]];
    let val10 = data[[v0, u1]];
    let val01 = data[[v1, u0]];
    let val11 = data[[v1, u1]];

    let val0 = val00 * (1.0 - fu) + val10 * fu;
    let val1 = val01 * (1.0 - fu) + val11 * fu;

    val0 * (1.0 - fv) + val1 * fv
}

/// Combine mask coefficients with the prototype tensor and rasterize a
/// binary mask at the original image resolution, cropped to the box.
/// `retina` selects bilinear sampling of the prototype grid; otherwise
/// nearest-neighbour is used.
fn rasterize_mask(
    coeffs: &[f32],
    protos: &Array<f32, ndarray::IxDyn>,
    bbox: &BoundingBox,
    letterbox: &Letterbox,
    retina: bool,
) -> BinaryMask {
    let proto_h = protos.shape()[2];
    let proto_w = protos.shape()[3];

    let mut lowres = Array2::<f32>::zeros((proto_h, proto_w));
    for y in 0..proto_h {
        for x in 0..proto_w {
            let mut acc = 0.0;
            for (k, &c) in coeffs.iter().enumerate() {
                acc += c * protos[[0, k, y, x]];
            }
            lowres[[y, x]] = sigmoid(acc);
        }
    }

    let orig_w = letterbox.orig_width;
    let orig_h = letterbox.orig_height;
    let mut mask = BinaryMask::new(orig_w, orig_h);

    // Pixel bounds of the (normalized) box in the original image
    let px1 = (bbox.x1 * orig_w as f32).floor().max(0.0) as u32;
    let py1 = (bbox.y1 * orig_h as f32).floor().max(0.0) as u32;
    let px2 = (bbox.x2 * orig_w as f32).ceil().min(orig_w as f32) as u32;
    let py2 = (bbox.y2 * orig_h as f32).ceil().min(orig_h as f32) as u32;

    let u_scale = proto_w as f32 / letterbox.target_size as f32;
    let v_scale = proto_h as f32 / letterbox.target_size as f32;

    for y in py1..py2 {
        for x in px1..px2 {
            let (mx, my) = letterbox.to_model(x as f32 + 0.5, y as f32 + 0.5);
            let u = mx * u_scale - 0.5;
            let v = my * v_scale - 0.5;

            let value = if retina {
                bilinear_sample(&lowres, u, v)
            } else {
                let ui = u.round().clamp(0.0, (proto_w - 1) as f32) as usize;
                let vi = v.round().clamp(0.0, (proto_h - 1) as f32) as usize;
                lowres[[vi, ui]]
            };

            if value > 0.5 {
                mask.set(x, y, 1);
            }
        }
    }

    mask
}
