//! Segmentation model wrapper and the dense (x20) inference engine.

use anyhow::Result;
use image::DynamicImage;
use log::debug;
use ndarray::Array;
use ort::{session::Session, value::Value};
use std::path::Path;
use std::time::Instant;

use crate::config::{InferenceParams, Magnification};
use crate::engine::{DenseInstance, DenseOutput, InferenceEngine, RawOutput};
use crate::postprocessing::decode_output;
use crate::preprocessing::preprocess_image;

/// A loaded ONNX segmentation model: owns the session and composes
/// preprocessing, the forward pass, and output decoding.
pub struct SegModel {
    session: Session,
    model_size: u32,
    input_name: String,
    output_name: String,
    /// Name of the prototype-mask tensor, absent for detect-only models.
    protos_name: Option<String>,
}

impl SegModel {
    pub fn load(model_path: &Path, device: &str) -> Result<Self> {
        let session = crate::onnx_session::create_session(model_path, device)?;

        let input_md = &session.inputs[0];
        let dimensions = match &input_md.input_type {
            ort::value::ValueType::Tensor {
                ty: _,
                shape,
                dimension_symbols: _,
            } => shape.to_vec(),
            _ => {
                debug!(
                    "Unexpected input type: {:?}. Defaulting to 640x640",
                    input_md.input_type
                );
                vec![1, 3, 640, 640]
            }
        };
        debug!("Input: {}, shape: {:?}", input_md.name, dimensions);

        // Assume square input; fall back when the dimension is dynamic
        let model_size = if dimensions.len() == 4 && dimensions[3] > 0 {
            dimensions[3] as u32
        } else {
            640
        };

        let input_name = input_md.name.clone();
        let output_name = session.outputs[0].name.clone();
        let protos_name = session.outputs.get(1).map(|o| o.name.clone());

        debug!(
            "Loaded model from {} (input {model_size}x{model_size}, masks: {})",
            model_path.display(),
            protos_name.is_some()
        );

        Ok(Self {
            session,
            model_size,
            input_name,
            output_name,
            protos_name,
        })
    }

    pub fn has_masks(&self) -> bool {
        self.protos_name.is_some()
    }

    /// Run one forward pass over `img` and decode the result.
    pub fn infer_image(
        &mut self,
        img: &DynamicImage,
        params: &InferenceParams,
    ) -> Result<Vec<DenseInstance>> {
        let (input_tensor, letterbox) = preprocess_image(img, self.model_size)?;

        let inference_start = Instant::now();
        let input_value = Value::from_array(input_tensor)
            .map_err(|e| anyhow::anyhow!("Failed to create input value: {}", e))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;
        let inference_time = inference_start.elapsed();

        let output_view = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to extract output array: {}", e))?;
        let output_array =
            Array::from_shape_vec(output_view.shape(), output_view.iter().cloned().collect())?;

        let protos_array = match &self.protos_name {
            Some(name) => {
                let view = outputs[name.as_str()]
                    .try_extract_array::<f32>()
                    .map_err(|e| anyhow::anyhow!("Failed to extract prototype array: {}", e))?;
                Some(Array::from_shape_vec(
                    view.shape(),
                    view.iter().cloned().collect(),
                )?)
            }
            None => None,
        };

        let instances = decode_output(&output_array, protos_array.as_ref(), &letterbox, params)?;

        debug!(
            "Inference found {} instance(s) in {:.1} ms",
            instances.len(),
            inference_time.as_secs_f64() * 1000.0
        );

        Ok(instances)
    }
}

/// High-magnification engine: a single dense forward pass over the image.
pub struct DenseEngine {
    model: SegModel,
    params: InferenceParams,
}

impl DenseEngine {
    pub fn new(model: SegModel, params: InferenceParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { model, params })
    }

    pub fn from_path(model_path: &Path, device: &str) -> Result<Self> {
        Self::new(SegModel::load(model_path, device)?, InferenceParams::default())
    }
}

impl InferenceEngine for DenseEngine {
    fn infer(&mut self, image_path: &Path) -> Result<RawOutput> {
        let image = image::open(image_path)?;
        let instances = self.model.infer_image(&image, &self.params)?;
        Ok(RawOutput::Dense(DenseOutput { instances, image }))
    }

    fn default_min_score(&self) -> f32 {
        Magnification::X20.default_min_score()
    }
}
