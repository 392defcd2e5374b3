use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use ndarray::{Array2, Array4};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use serde::Serialize;
use tracing::info;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const INCEPTION_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const INCEPTION_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Input geometry and output width of an image encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    /// Side of the square input crop, in pixels.
    pub input_size: u32,
    /// Length of one embedding row.
    pub embedding_width: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// Supported pretrained image encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageModel {
    Resnet152,
    #[value(name = "inception_v3")]
    InceptionV3,
    Vgg16,
}

impl ImageModel {
    pub fn spec(self) -> ModelSpec {
        match self {
            ImageModel::Resnet152 => ModelSpec {
                input_size: 224,
                embedding_width: 2048,
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
            },
            ImageModel::InceptionV3 => ModelSpec {
                input_size: 299,
                embedding_width: 2048,
                mean: INCEPTION_MEAN,
                std: INCEPTION_STD,
            },
            ImageModel::Vgg16 => ModelSpec {
                input_size: 224,
                embedding_width: 4096,
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageModel::Resnet152 => "resnet152",
            ImageModel::InceptionV3 => "inception_v3",
            ImageModel::Vgg16 => "vgg16",
        }
    }
}

impl fmt::Display for ImageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compute device the encoder session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Cpu,
    Cuda(i32),
    CoreMl,
}

impl FromStr for Accelerator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => return Ok(Accelerator::Cpu),
            "coreml" => return Ok(Accelerator::CoreMl),
            _ => {}
        }
        let device = s.strip_prefix("cuda:").unwrap_or(&s);
        device
            .parse::<i32>()
            .ok()
            .filter(|d| *d >= 0)
            .map(Accelerator::Cuda)
            .ok_or_else(|| anyhow!("Unrecognized accelerator '{}' (expected cpu, coreml, <n> or cuda:<n>)", s))
    }
}

impl Accelerator {
    fn execution_providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Accelerator::Cpu => vec![CPUExecutionProvider::default().build()],
            Accelerator::Cuda(device) => vec![
                CUDAExecutionProvider::default().with_device_id(device).build(),
                CPUExecutionProvider::default().build(),
            ],
            Accelerator::CoreMl => vec![
                CoreMLExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
        }
    }
}

/// An image encoder that maps a `[n, 3, S, S]` batch to `[n, D]` embeddings.
pub trait FrameEncoder: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    fn encode(&self, batch: Array4<f32>) -> Result<Array2<f32>>;
}

/// ONNX Runtime backed encoder. Calls are serialized through the session lock,
/// so one instance can be shared by every worker without oversubscribing the device.
pub struct InferenceEngine {
    session: Mutex<Session>,
    spec: ModelSpec,
}

impl InferenceEngine {
    pub fn new(model: ImageModel, model_path: &Path, accelerator: Accelerator) -> Result<Self> {
        let _ = ort::init().with_name("video-features").commit();

        let session = Session::builder()
            .map_err(|e| anyhow!("Failed to create session builder: {}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Failed to set optimization level: {}", e))?
            .with_execution_providers(accelerator.execution_providers())
            .map_err(|e| anyhow!("Failed to register execution providers: {}", e))?
            .commit_from_file(model_path)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Failed to load {} model from {:?}", model, model_path))?;

        info!("Loaded {} encoder from {:?} on {:?}", model, model_path, accelerator);

        Ok(Self {
            session: Mutex::new(session),
            spec: model.spec(),
        })
    }
}

impl FrameEncoder for InferenceEngine {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn encode(&self, batch: Array4<f32>) -> Result<Array2<f32>> {
        let shape = batch.shape().to_vec();
        let rows = shape[0];
        let data = batch.as_standard_layout().iter().copied().collect::<Vec<f32>>();
        let tensor = Tensor::from_array(([shape[0], shape[1], shape[2], shape[3]], data))
            .map_err(|e| anyhow!("Failed to create input tensor: {}", e))?;

        // A panic elsewhere while holding the lock leaves the session itself intact.
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| anyhow!("Encoder inference failed: {}", e))?;

        // Pooled backbones emit either [n, D] or [n, D, 1, 1].
        let embeddings = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow!("Failed to extract embeddings: {}", e))?;
        let values: Vec<f32> = embeddings.iter().copied().collect();
        if rows == 0 || values.len() % rows != 0 {
            bail!(
                "Encoder returned {} values (shape {:?}) for a batch of {}",
                values.len(),
                embeddings.shape(),
                rows
            );
        }
        let width = values.len() / rows;
        Array2::from_shape_vec((rows, width), values).context("Failed to reshape embeddings")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_specs() {
        assert_eq!(ImageModel::Resnet152.spec().input_size, 224);
        assert_eq!(ImageModel::Resnet152.spec().embedding_width, 2048);
        assert_eq!(ImageModel::InceptionV3.spec().input_size, 299);
        assert_eq!(ImageModel::InceptionV3.spec().mean, [0.5; 3]);
        assert_eq!(ImageModel::Vgg16.spec().embedding_width, 4096);
    }

    #[test]
    fn test_model_names_parse_from_cli_values() {
        for model in [ImageModel::Resnet152, ImageModel::InceptionV3, ImageModel::Vgg16] {
            assert_eq!(ImageModel::from_str(model.name(), false).unwrap(), model);
        }
        assert!(ImageModel::from_str("alexnet", false).is_err());
    }

    #[test]
    fn test_accelerator_parsing() {
        assert_eq!("cpu".parse::<Accelerator>().unwrap(), Accelerator::Cpu);
        assert_eq!("0".parse::<Accelerator>().unwrap(), Accelerator::Cuda(0));
        assert_eq!("cuda:3".parse::<Accelerator>().unwrap(), Accelerator::Cuda(3));
        assert_eq!("CoreML".parse::<Accelerator>().unwrap(), Accelerator::CoreMl);
        assert!("-1".parse::<Accelerator>().is_err());
        assert!("tpu".parse::<Accelerator>().is_err());
    }
}
