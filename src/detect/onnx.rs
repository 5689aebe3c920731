use anyhow::{anyhow, Context, Result};
use ndarray::{Array3, Array4, Axis};
use ort::{session::Session, value::Value};
use rayon::prelude::*;
use tracing::{info, instrument};

use crate::{
    config::{InputTensor, ModelConfig, PixelFormat, PredictorConfig},
    detect::ops::{letterbox, Letterbox},
};

/// One loaded ONNX model with its own session. Sessions are never shared
/// across detector threads; each owns its allocator and memory arena.
pub struct OnnxPredictor {
    session: Session,
    input_name: String,
    output_name: String,
    dynamic_batch: bool,
    model: ModelConfig,
}

impl OnnxPredictor {
    #[instrument(skip(config), fields(model_path = %config.model.path, ep = %config.ep), err)]
    pub fn load(config: &PredictorConfig) -> Result<OnnxPredictor> {
        let session = Session::builder()?
            .commit_from_file(&config.model.path)
            .with_context(|| format!("failed to load model {}", config.model.path))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| anyhow!("model has no inputs"))?;
        let input_name = input.name.clone();
        let dynamic_batch = input
            .input_type
            .tensor_dimensions()
            .and_then(|dims| dims.first().copied())
            .map(|batch| batch < 1)
            .unwrap_or(false);
        let output_name = session
            .outputs
            .first()
            .ok_or_else(|| anyhow!("model has no outputs"))?
            .name
            .clone();

        info!(%input_name, %output_name, dynamic_batch, "model loaded");
        Ok(OnnxPredictor {
            session,
            input_name,
            output_name,
            dynamic_batch,
            model: config.model.clone(),
        })
    }

    pub fn has_dynamic_batch(&self) -> bool {
        self.dynamic_batch
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// (model input width, model input height)
    pub fn input_size(&self) -> (usize, usize) {
        (self.model.width as usize, self.model.height as usize)
    }

    /// Letterboxes a batch of BGR images into one input tensor, normalized
    /// to `[0, 1]` and laid out per the model configuration.
    pub fn preprocess(&self, batch: &[&Array3<u8>]) -> (Array4<f32>, Vec<Letterbox>) {
        let (w, h) = self.input_size();
        let boxed: Vec<_> = batch
            .par_iter()
            .map(|&image| letterbox(image, w, h))
            .collect();

        let mut tensor = Array4::<f32>::zeros((batch.len(), 3, h, w));
        let mut params = Vec::with_capacity(batch.len());
        for (n, (image, letterboxed)) in boxed.into_iter().enumerate() {
            params.push(letterboxed);
            for y in 0..h {
                for x in 0..w {
                    for c in 0..3 {
                        // Frames are BGR; most models want RGB.
                        let src_c = match self.model.input_pixel_format {
                            PixelFormat::Rgb => 2 - c,
                            PixelFormat::Bgr => c,
                        };
                        tensor[(n, c, y, x)] = image[(y, x, src_c)] as f32 / 255.0;
                    }
                }
            }
        }
        if self.model.input_tensor == InputTensor::Nhwc {
            let nhwc = tensor.permuted_axes([0, 2, 3, 1]);
            return (nhwc.as_standard_layout().to_owned(), params);
        }
        (tensor, params)
    }

    /// Runs the whole batch in one call. Returns the primary output's shape
    /// and data.
    pub fn run(&mut self, input: Array4<f32>) -> Result<(Vec<usize>, Vec<f32>)> {
        let value = Value::from_array(input)?;
        let outputs = self.session.run(ort::inputs![self.input_name.as_str() => value])?;
        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        Ok((shape, data.to_vec()))
    }

    /// `preprocess` + `run`, splitting the batch when the model only takes
    /// a static batch of one.
    pub fn predict(
        &mut self,
        batch: &[&Array3<u8>],
    ) -> Result<Vec<((Vec<usize>, Vec<f32>), Letterbox)>> {
        let (tensor, params) = self.preprocess(batch);
        if self.dynamic_batch || batch.len() == 1 {
            let (shape, data) = self.run(tensor)?;
            return Ok(split_batch(shape, data)
                .into_iter()
                .zip(params)
                .collect());
        }

        let mut results = Vec::with_capacity(batch.len());
        for (n, param) in params.into_iter().enumerate() {
            let single = tensor.index_axis(Axis(0), n).insert_axis(Axis(0)).to_owned();
            let (shape, data) = self.run(single)?;
            for item in split_batch(shape, data) {
                results.push((item, param));
            }
        }
        Ok(results)
    }
}

/// Splits an `[N, ...]` output into per-item `[1, ...]` chunks.
fn split_batch(shape: Vec<usize>, data: Vec<f32>) -> Vec<(Vec<usize>, Vec<f32>)> {
    let Some((&n, rest)) = shape.split_first() else {
        return Vec::new();
    };
    if n == 0 {
        return Vec::new();
    }
    let stride: usize = rest.iter().product();
    let mut item_shape = vec![1];
    item_shape.extend_from_slice(rest);
    data.chunks(stride.max(1))
        .take(n)
        .map(|chunk| (item_shape.clone(), chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_batch_chunks_leading_axis() {
        let shape = vec![2, 3, 4];
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let items = split_batch(shape, data);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, vec![1, 3, 4]);
        assert_eq!(items[0].1.len(), 12);
        assert_eq!(items[1].1[0], 12.0);
    }

    #[test]
    fn split_batch_of_empty_output() {
        assert!(split_batch(vec![0, 84, 2100], Vec::new()).is_empty());
        assert!(split_batch(Vec::new(), Vec::new()).is_empty());
    }
}
