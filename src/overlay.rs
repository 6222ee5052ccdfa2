//! Overlay rendering: color palettes, mask blending and box drawing.

use anyhow::Result;
use image::Rgba;
use imageproc::drawing::draw_hollow_rect_mut;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::convert::OverlayScene;
use crate::detection::{BinaryMask, BoundingBox};

/// Named color palette used to distinguish object instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum ColorMap {
    Tab10,
    #[default]
    Tab20,
    Viridis,
    Turbo,
    Grayscale,
}

impl std::str::FromStr for ColorMap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tab10" => Ok(ColorMap::Tab10),
            "tab20" => Ok(ColorMap::Tab20),
            "viridis" => Ok(ColorMap::Viridis),
            "turbo" => Ok(ColorMap::Turbo),
            "grayscale" | "gray" => Ok(ColorMap::Grayscale),
            _ => Err(format!("Unknown colormap: {s}")),
        }
    }
}

impl fmt::Display for ColorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColorMap::Tab10 => "tab10",
            ColorMap::Tab20 => "tab20",
            ColorMap::Viridis => "viridis",
            ColorMap::Turbo => "turbo",
            ColorMap::Grayscale => "grayscale",
        };
        write!(f, "{name}")
    }
}

const TAB10: [[u8; 3]; 10] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
    [148, 103, 189],
    [140, 86, 75],
    [227, 119, 194],
    [127, 127, 127],
    [188, 189, 34],
    [23, 190, 207],
];

const TAB20: [[u8; 3]; 20] = [
    [31, 119, 180],
    [174, 199, 232],
    [255, 127, 14],
    [255, 187, 120],
    [44, 160, 44],
    [152, 223, 138],
    [214, 39, 40],
    [255, 152, 150],
    [148, 103, 189],
    [197, 176, 213],
    [140, 86, 75],
    [196, 156, 148],
    [227, 119, 194],
    [247, 182, 210],
    [127, 127, 127],
    [199, 199, 199],
    [188, 189, 34],
    [219, 219, 141],
    [23, 190, 207],
    [158, 218, 229],
];

// Viridis colormap (approximation)
fn viridis_colormap(t: f32) -> Rgba<u8> {
    let r = ((-4.5 * t + 11.0) * t - 4.5).clamp(0.0, 1.0);
    let g = ((5.0 * t - 9.5) * t + 4.5).clamp(0.0, 1.0);
    let b = ((-1.5 * t + 1.0) * t + 0.5).clamp(0.0, 1.0);

    Rgba([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8, 255])
}

// Turbo colormap (approximation)
fn turbo_colormap(t: f32) -> Rgba<u8> {
    let r = ((6.0 * t - 3.0) * t * t).clamp(0.0, 1.0);
    let g = (-4.0 * (t - 0.5).powi(2) + 1.0).clamp(0.0, 1.0);
    let b = ((-6.0 * t + 3.0) * (1.0 - t)).clamp(0.0, 1.0);

    Rgba([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8, 255])
}

impl ColorMap {
    /// Color for instance `index` out of `total` rendered instances.
    /// Categorical palettes cycle; continuous maps spread instances
    /// evenly over the ramp.
    pub fn instance_color(&self, index: usize, total: usize) -> Rgba<u8> {
        match self {
            ColorMap::Tab10 => {
                let [r, g, b] = TAB10[index % TAB10.len()];
                Rgba([r, g, b, 255])
            }
            ColorMap::Tab20 => {
                let [r, g, b] = TAB20[index % TAB20.len()];
                Rgba([r, g, b, 255])
            }
            ColorMap::Viridis => viridis_colormap(ramp_position(index, total)),
            ColorMap::Turbo => turbo_colormap(ramp_position(index, total)),
            ColorMap::Grayscale => {
                let intensity = (ramp_position(index, total) * 255.0) as u8;
                Rgba([intensity, intensity, intensity, 255])
            }
        }
    }
}

fn ramp_position(index: usize, total: usize) -> f32 {
    if total <= 1 {
        0.5
    } else {
        index as f32 / (total - 1) as f32
    }
}

/// Delete a stale overlay at `path`. A missing file is a no-op; any other
/// failure propagates.
pub fn remove_stale_overlay(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Alpha-blend `color` over the base image wherever the mask is set.
fn blend_mask(rgba_img: &mut image::RgbaImage, mask: &BinaryMask, color: Rgba<u8>, alpha: f32) {
    let width = rgba_img.width().min(mask.width);
    let height = rgba_img.height().min(mask.height);
    let alpha = alpha.clamp(0.0, 1.0);

    for y in 0..height {
        for x in 0..width {
            if mask.get(x, y) == 0 {
                continue;
            }
            let base = rgba_img.get_pixel(x, y);
            let blended = Rgba([
                ((1.0 - alpha) * base[0] as f32 + alpha * color[0] as f32) as u8,
                ((1.0 - alpha) * base[1] as f32 + alpha * color[1] as f32) as u8,
                ((1.0 - alpha) * base[2] as f32 + alpha * color[2] as f32) as u8,
                255,
            ]);
            rgba_img.put_pixel(x, y, blended);
        }
    }
}

/// Draw a 3-pixel hollow rectangle, used for rows without a mask.
fn draw_box(rgba_img: &mut image::RgbaImage, bbox: &BoundingBox, color: Rgba<u8>) {
    let x1 = bbox.x1.max(0.0) as u32;
    let y1 = bbox.y1.max(0.0) as u32;
    let x2 = bbox.x2.min(rgba_img.width() as f32) as u32;
    let y2 = bbox.y2.min(rgba_img.height() as f32) as u32;
    if x2 <= x1 || y2 <= y1 {
        return;
    }

    for thickness_offset in 0..3i32 {
        let rect = imageproc::rect::Rect::at(
            (x1 as i32) - thickness_offset,
            (y1 as i32) - thickness_offset,
        )
        .of_size(
            (x2 - x1) + (thickness_offset * 2) as u32,
            (y2 - y1) + (thickness_offset * 2) as u32,
        );
        draw_hollow_rect_mut(rgba_img, rect, color);
    }
}

/// Render the scene over a fresh copy of its image and write the result
/// to `path`. Rows with masks are alpha-blended; mask-less rows fall back
/// to hollow boxes.
pub fn render_overlay(
    scene: &OverlayScene<'_>,
    color_map: ColorMap,
    alpha: f32,
    path: &Path,
) -> Result<()> {
    let mut rgba_img = scene.image.to_rgba8();
    let total = scene.rows.len();

    for (index, row) in scene.rows.iter().enumerate() {
        let color = color_map.instance_color(index, total);
        match &row.mask {
            Some(mask) => blend_mask(&mut rgba_img, mask, color, alpha),
            None => draw_box(&mut rgba_img, &row.bbox, color),
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    rgba_img.save(path)?;

    log::debug!("Overlay written to {}", path.display());
    Ok(())
}
