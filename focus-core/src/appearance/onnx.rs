//! Learned descriptors through ONNX Runtime.
//!
//! The model is any frozen image backbone taking a `[1, 3, 224, 224]`
//! ImageNet-normalised RGB tensor (e.g. MobileNetV3-Small `features`
//! exported to ONNX). A `[1, C, H, W]` feature map is globally
//! average-pooled here; flat `[1, C]` outputs are used as-is.

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{DescriptorExtractor, MatcherMode};

/// Backbone input size (square).
const INPUT_SIZE: u32 = 224;
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

pub struct OnnxExtractor {
    session: Mutex<Session>,
    input_name: String,
}

impl OnnxExtractor {
    /// Load the backbone and run one probe inference; any failure means the
    /// learned mode is unavailable.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        if !model_path.is_file() {
            bail!("embedding model not found: {}", model_path.display());
        }
        let session = build_ort_session(model_path)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("embedding model declares no inputs")?;

        let extractor = Self {
            session: Mutex::new(session),
            input_name,
        };
        let probe = RgbImage::from_pixel(INPUT_SIZE, INPUT_SIZE, image::Rgb([128, 128, 128]));
        let dim = extractor
            .extract(&probe)
            .context("embedding model probe inference failed")?
            .len();
        if dim == 0 {
            bail!("embedding model produced an empty feature vector");
        }
        debug!(dim, input = %extractor.input_name, "embedding model ready");
        Ok(extractor)
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn mode(&self) -> MatcherMode {
        MatcherMode::Learned
    }

    fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        let tensor_data = preprocess(crop)?;
        let shape = [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];
        let tensor = Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create embedding input tensor")?
            .into_dyn();

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("embedding session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .context("embedding inference failed")?;

        let first_value = outputs
            .iter()
            .next()
            .context("embedding model produced no outputs")?
            .1;
        let (shape, data) = first_value
            .try_extract_tensor::<f32>()
            .context("failed to extract embedding tensor")?;

        if shape.len() == 4 {
            let channels = usize::try_from(shape[1]).unwrap_or(0);
            Ok(global_average_pool(data, channels))
        } else {
            Ok(data.to_vec())
        }
    }
}

/// Resize to 224×224, scale to [0, 1], apply ImageNet mean/std, NCHW.
fn preprocess(crop: &RgbImage) -> Result<Vec<f32>> {
    let src = fr::images::ImageRef::new(crop.width(), crop.height(), crop.as_raw(), fr::PixelType::U8x3)
        .context("failed to create embedding resize source")?;
    let mut dst = fr::images::Image::new(INPUT_SIZE, INPUT_SIZE, fr::PixelType::U8x3);
    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    fr::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .context("embedding crop resize failed")?;

    let raw = dst.into_vec();
    let size = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut tensor_data = vec![0f32; 3 * size];
    for idx in 0..size {
        for c in 0..3 {
            tensor_data[c * size + idx] = (raw[idx * 3 + c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    Ok(tensor_data)
}

/// Mean over the spatial positions of each channel of a `[1, C, H, W]` map.
fn global_average_pool(data: &[f32], channels: usize) -> Vec<f32> {
    if channels == 0 || data.len() % channels != 0 {
        return Vec::new();
    }
    let spatial = data.len() / channels;
    data.chunks_exact(spatial)
        .map(|plane| plane.iter().sum::<f32>() / spatial as f32)
        .collect()
}

fn build_ort_session(model_path: &Path) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder
        .commit_from_file(model_path)
        .context("failed to load embedding ONNX model")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_averages_each_channel() {
        let data = [1.0, 3.0, 10.0, 20.0, -2.0, 2.0];
        assert_eq!(global_average_pool(&data, 3), vec![2.0, 15.0, 0.0]);
        assert!(global_average_pool(&data, 4).is_empty());
    }

    #[test]
    fn preprocess_emits_nchw_imagenet_tensor() {
        let crop = RgbImage::from_pixel(10, 30, image::Rgb([255, 0, 128]));
        let t = preprocess(&crop).unwrap();
        let size = (INPUT_SIZE * INPUT_SIZE) as usize;
        assert_eq!(t.len(), 3 * size);
        assert!((t[0] - (1.0 - MEAN[0]) / STD[0]).abs() < 0.02);
        assert!((t[size] - (0.0 - MEAN[1]) / STD[1]).abs() < 0.02);
    }

    #[test]
    fn missing_model_is_rejected() {
        assert!(OnnxExtractor::load("/nonexistent/model.onnx").is_err());
    }
}
