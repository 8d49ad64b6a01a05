use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    encoder::{Backbone, EncoderConfig, HybridEncoder},
    error::{Error, Result},
    preprocess::ImageProcessor,
};

/// Compute device requested on the command line.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA or Metal when compiled in and available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceChoice {
    pub fn device(self) -> Result<Device> {
        match self {
            Self::Auto => Ok(default_device()),
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => Ok(Device::new_cuda(0)?),
            Self::Metal => Ok(Device::new_metal(0)?),
        }
    }
}

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Path of the JSON sidecar holding the configuration of a weights file.
pub fn config_path(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

/// Write the trainable variables as safetensors plus the configuration
/// sidecar.
pub fn save_weights(
    varmap: &VarMap,
    config: &EncoderConfig,
    weights: &Path,
) -> Result<()> {
    if let Some(parent) = weights.parent().filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)?;
    }
    varmap.save(weights)?;
    std::fs::write(config_path(weights), serde_json::to_vec_pretty(config)?)?;
    info!(path = %weights.display(), "saved encoder weights");
    Ok(())
}

/// Read the configuration a weights file was trained with.
pub fn read_weights_config(weights: &Path) -> Result<EncoderConfig> {
    let path = config_path(weights);
    if !path.exists() {
        return Err(Error::NotFound {
            kind: "encoder configuration",
            path,
        });
    }
    let config: EncoderConfig = serde_json::from_slice(&std::fs::read(&path)?)?;
    config.validate()?;
    Ok(config)
}

/// Load an encoder from a weights file.
///
/// When `expected` is given, the stored configuration must match it
/// exactly; otherwise the stored configuration is used as-is.
pub fn load_encoder(
    weights: &Path,
    expected: Option<&EncoderConfig>,
    device: &Device,
) -> Result<HybridEncoder> {
    if !weights.exists() {
        return Err(Error::NotFound {
            kind: "encoder weights",
            path: weights.to_path_buf(),
        });
    }
    let config = read_weights_config(weights)?;
    if let Some(expected) = expected {
        expected.ensure_matches(&config)?;
    }

    let tensors = candle_core::safetensors::load(weights, device)?;
    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    let encoder = HybridEncoder::new(&config, vb)?;
    debug!(path = %weights.display(), ?config, "loaded encoder");
    Ok(encoder)
}

/// Source of ImageNet weights for the convolutional backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackboneInit {
    /// A local safetensors file with torchvision/timm tensor names.
    File(PathBuf),
    /// Download the matching `timm` checkpoint from the Hugging Face Hub.
    Hub,
}

/// Overwrite the backbone variables in `varmap` with pretrained tensors.
///
/// Returns the number of tensors copied. Tensors with no counterpart in
/// the checkpoint keep their fresh initialization; a checkpoint that
/// shares no tensor with the backbone is an error.
pub fn init_backbone(
    varmap: &VarMap,
    backbone: Backbone,
    source: &BackboneInit,
) -> Result<usize> {
    let path = match source {
        BackboneInit::File(path) => path.clone(),
        BackboneInit::Hub => fetch_backbone(backbone)?,
    };
    let pretrained = candle_core::safetensors::load(&path, &Device::Cpu)?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| Error::Config("variable map lock poisoned".into()))?;
    let mut copied = 0;
    for (name, var) in vars.iter() {
        let Some(key) = name.strip_prefix("backbone.") else {
            continue;
        };
        let Some(tensor) = pretrained.get(key) else {
            continue;
        };
        if tensor.dims() != var.dims() {
            return Err(Error::InvalidInput {
                path: path.clone(),
                reason: format!(
                    "tensor {key} has shape {:?}, expected {:?}",
                    tensor.dims(),
                    var.dims()
                ),
            });
        }
        var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
        copied += 1;
    }

    if copied == 0 {
        return Err(Error::InvalidInput {
            path,
            reason: format!("no {} backbone tensors found", backbone.name()),
        });
    }
    info!(copied, backbone = backbone.name(), "initialized pretrained backbone");
    Ok(copied)
}

fn fetch_backbone(backbone: Backbone) -> Result<PathBuf> {
    let repo = backbone.hub_repo();
    info!(repo, "downloading pretrained backbone");
    let api = hf_hub::api::sync::Api::new().map_err(|e| Error::Hub(e.to_string()))?;
    api.model(repo.to_string())
        .get("model.safetensors")
        .map_err(|e| Error::Hub(format!("{repo}: {e}")))
}

/// Manages the encoder lifecycle, loading the weights on first use.
pub struct ModelManager {
    weights: PathBuf,
    expected: Option<EncoderConfig>,
    device: Device,
    encoder: Option<HybridEncoder>,
}

impl ModelManager {
    /// The weights are not read until the first embedding call.
    pub fn new(weights: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            weights: weights.into(),
            expected: None,
            device,
            encoder: None,
        }
    }

    /// Require the stored configuration to match `config` on load.
    pub fn with_expected_config(mut self, config: EncoderConfig) -> Self {
        self.expected = Some(config);
        self
    }

    /// Use an already constructed encoder.
    pub fn from_encoder(encoder: HybridEncoder, device: Device) -> Self {
        Self {
            weights: PathBuf::new(),
            expected: None,
            device,
            encoder: Some(encoder),
        }
    }

    pub fn weights(&self) -> &Path {
        &self.weights
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns `true` if the encoder has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.encoder.is_some()
    }

    /// Ensures the encoder is loaded, reading the weights file if needed.
    pub fn ensure_loaded(&mut self) -> Result<&HybridEncoder> {
        let encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => load_encoder(&self.weights, self.expected.as_ref(), &self.device)?,
        };
        Ok(self.encoder.insert(encoder))
    }

    /// Image preprocessing matching the loaded encoder's input size.
    pub fn processor(&mut self) -> Result<ImageProcessor> {
        Ok(ImageProcessor::new(self.ensure_loaded()?.config().image_size))
    }

    /// Embed a batch of preprocessed `(3, S, S)` images into unit vectors.
    pub fn embed_images(&mut self, images: &[Tensor]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let device = self.device.clone();
        let encoder = self.ensure_loaded()?;
        let batch = Tensor::stack(images, 0)?.to_device(&device)?;
        let embeddings = encoder.forward(&batch)?.detach();
        Ok(embeddings.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }

    /// Decode, preprocess, and embed one image file.
    pub fn embed_file(&mut self, path: &Path) -> Result<Vec<f32>> {
        let image = self.processor()?.load(path, &self.device)?;
        self.embed_images(&[image])?
            .pop()
            .ok_or_else(|| Error::Config("encoder returned no embedding".into()))
    }
}
