//! Image-to-tensor preparation for the segmentation model.

use anyhow::Result;
use image::DynamicImage;
use ndarray::Array;

/// Geometry of a letterbox resize. Kept alongside the tensor so that
/// model-space coordinates can be mapped back into normalized coordinates
/// of the original image.
#[derive(Debug, Clone, Copy)]
pub struct Letterbox {
    pub scale: f32,
    pub x_offset: f32,
    pub y_offset: f32,
    pub target_size: u32,
    pub orig_width: u32,
    pub orig_height: u32,
}

impl Letterbox {
    pub fn compute(orig_width: u32, orig_height: u32, target_size: u32) -> Self {
        let max_dim = orig_width.max(orig_height);
        let scale = target_size as f32 / max_dim as f32;
        let new_width = (orig_width as f32 * scale) as u32;
        let new_height = (orig_height as f32 * scale) as u32;

        Self {
            scale,
            x_offset: ((target_size - new_width) / 2) as f32,
            y_offset: ((target_size - new_height) / 2) as f32,
            target_size,
            orig_width,
            orig_height,
        }
    }

    /// Map a point in letterboxed model pixels to normalized [0,1]
    /// coordinates of the original image.
    pub fn to_normalized(&self, x: f32, y: f32) -> (f32, f32) {
        let nx = ((x - self.x_offset) / self.scale) / self.orig_width as f32;
        let ny = ((y - self.y_offset) / self.scale) / self.orig_height as f32;
        (nx.clamp(0.0, 1.0), ny.clamp(0.0, 1.0))
    }

    /// Map a point in original-image pixels into letterboxed model pixels.
    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.x_offset,
            y * self.scale + self.y_offset,
        )
    }
}

/// Letterbox-resize `img` to a square `target_size` input and convert to a
/// normalized NCHW float tensor.
pub fn preprocess_image(
    img: &DynamicImage,
    target_size: u32,
) -> Result<(Array<f32, ndarray::IxDyn>, Letterbox)> {
    let rgb_img = img.to_rgb8();
    let (orig_width, orig_height) = rgb_img.dimensions();
    let letterbox = Letterbox::compute(orig_width, orig_height, target_size);

    let new_width = (orig_width as f32 * letterbox.scale) as u32;
    let new_height = (orig_height as f32 * letterbox.scale) as u32;

    let resized = image::imageops::resize(
        &rgb_img,
        new_width,
        new_height,
        image::imageops::FilterType::Lanczos3,
    );

    // Gray padding (114, 114, 114) around the centered image
    let mut letterboxed = image::RgbImage::new(target_size, target_size);
    for pixel in letterboxed.pixels_mut() {
        *pixel = image::Rgb([114, 114, 114]);
    }

    let x_offset = letterbox.x_offset as u32;
    let y_offset = letterbox.y_offset as u32;
    for y in 0..new_height {
        for x in 0..new_width {
            let src_pixel = resized.get_pixel(x, y);
            letterboxed.put_pixel(x + x_offset, y + y_offset, *src_pixel);
        }
    }

    // NCHW order, normalized to [0,1]
    let mut input_data = Vec::with_capacity((3 * target_size * target_size) as usize);
    for c in 0..3 {
        for y in 0..target_size {
            for x in 0..target_size {
                let pixel = letterboxed.get_pixel(x, y);
                input_data.push(pixel[c] as f32 / 255.0);
            }
        }
    }

    let input = Array::from_shape_vec(
        ndarray::IxDyn(&[1, 3, target_size as usize, target_size as usize]),
        input_data,
    )?;

    Ok((input, letterbox))
}
