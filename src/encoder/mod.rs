//! Hybrid convolution + self-attention page encoder.
//!
//! ```text
//! image (3, S, S)
//!   -> ResNet stem + 4 stages      (C, S/32, S/32)
//!   -> 1x1 projection              (D, S/32, S/32)
//!   -> flatten to tokens           (S²/1024, D)
//!   -> + positional signal
//!   -> transformer encoder layers  (S²/1024, D)
//!   -> mean over tokens            (D)
//!   -> layer norm -> L2 normalize  (D), unit length
//! ```

mod backbone;
mod transformer;

use candle_core::{D, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};
use serde::{Deserialize, Serialize};

pub use self::backbone::ResNetBackbone;
use self::transformer::{EncoderLayer, LayerNorm};
use crate::error::{Error, Result};

/// Total spatial downsampling of the backbone.
pub const BACKBONE_STRIDE: usize = 32;

/// Convolutional backbone variants.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    Resnet18,
    Resnet34,
    Resnet50,
}

impl Backbone {
    /// Channels of the final feature map.
    pub fn out_channels(self) -> usize {
        match self {
            Self::Resnet18 | Self::Resnet34 => 512,
            Self::Resnet50 => 2048,
        }
    }

    /// Hugging Face Hub repository holding ImageNet weights with matching
    /// tensor names.
    pub fn hub_repo(self) -> &'static str {
        match self {
            Self::Resnet18 => "timm/resnet18.a1_in1k",
            Self::Resnet34 => "timm/resnet34.a1_in1k",
            Self::Resnet50 => "timm/resnet50.a1_in1k",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Resnet18 => "resnet18",
            Self::Resnet34 => "resnet34",
            Self::Resnet50 => "resnet50",
        }
    }
}

/// Positional signal added to the spatial tokens before attention.
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
pub enum PositionalEncoding {
    /// All-zero signal: attention sees the tokens as an unordered set.
    #[default]
    Zero,
    /// A trained `(tokens, D)` table.
    Learned,
}

/// Architecture hyperparameters. Weights are only valid for the exact
/// configuration they were trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub backbone: Backbone,
    pub embed_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub image_size: u32,
    #[serde(default)]
    pub positional: PositionalEncoding,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backbone: Backbone::Resnet34,
            embed_dim: 384,
            num_layers: 3,
            num_heads: 8,
            image_size: 512,
            positional: PositionalEncoding::Zero,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 || self.num_heads == 0 {
            return Err(Error::Config(
                "embedding dimension and head count must be positive".into(),
            ));
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(Error::Config(format!(
                "embedding dimension {} is not divisible by {} heads",
                self.embed_dim, self.num_heads
            )));
        }
        let size = self.image_size as usize;
        if size == 0 || size % BACKBONE_STRIDE != 0 {
            return Err(Error::Config(format!(
                "image size {size} must be a positive multiple of {BACKBONE_STRIDE}"
            )));
        }
        Ok(())
    }

    /// Side length of the backbone's output grid.
    pub fn grid_size(&self) -> usize {
        self.image_size as usize / BACKBONE_STRIDE
    }

    /// Number of tokens fed to the transformer.
    pub fn num_tokens(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Fail with [`Error::ConfigMismatch`] on the first field where `found`
    /// differs from `self`.
    pub fn ensure_matches(&self, found: &EncoderConfig) -> Result<()> {
        fn check<T: PartialEq + std::fmt::Debug>(
            field: &'static str,
            expected: T,
            found: T,
        ) -> Result<()> {
            if expected == found {
                Ok(())
            } else {
                Err(Error::ConfigMismatch {
                    field,
                    expected: format!("{expected:?}"),
                    found: format!("{found:?}"),
                })
            }
        }

        check("backbone", self.backbone, found.backbone)?;
        check("embed_dim", self.embed_dim, found.embed_dim)?;
        check("num_layers", self.num_layers, found.num_layers)?;
        check("num_heads", self.num_heads, found.num_heads)?;
        check("image_size", self.image_size, found.image_size)?;
        check("positional", self.positional, found.positional)
    }
}

/// The page encoder network.
///
/// Tensor names under the `backbone` prefix follow the torchvision/timm
/// ResNet layout so ImageNet checkpoints load without renaming.
#[derive(Debug, Clone)]
pub struct HybridEncoder {
    config: EncoderConfig,
    backbone: ResNetBackbone,
    proj: Conv2d,
    pos_embed: Option<Tensor>,
    layers: Vec<EncoderLayer>,
    norm: LayerNorm,
}

impl HybridEncoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let dim = config.embed_dim;

        let backbone = ResNetBackbone::new(config.backbone, vb.pp("backbone"))?;
        let proj = candle_nn::conv2d(
            config.backbone.out_channels(),
            dim,
            1,
            Conv2dConfig::default(),
            vb.pp("proj"),
        )?;

        let pos_embed = match config.positional {
            PositionalEncoding::Zero => None,
            PositionalEncoding::Learned => Some(vb.get_with_hints(
                (config.num_tokens(), dim),
                "pos_embed",
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?),
        };

        let layers = (0..config.num_layers)
            .map(|i| {
                EncoderLayer::new(
                    dim,
                    config.num_heads,
                    4 * dim,
                    vb.pp(format!("transformer.layers.{i}")),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let norm = LayerNorm::new(dim, vb.pp("norm"))?;

        Ok(Self {
            config: *config,
            backbone,
            proj,
            pos_embed,
            layers,
            norm,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Embed a batch of normalized images `(B, 3, S, S)` into unit vectors
    /// `(B, D)`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let features = self.backbone.forward(images)?;
        let projected = self.proj.forward(&features)?;

        // (B, D, h, w) -> (B, h*w, D)
        let mut tokens = projected.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        // A zero signal leaves the tokens unchanged, so only the learned
        // table is actually added.
        if let Some(pos) = &self.pos_embed {
            tokens = tokens.broadcast_add(pos)?;
        }

        for layer in &self.layers {
            tokens = layer.forward(&tokens)?;
        }

        let pooled = tokens.mean(1)?;
        let normed = self.norm.forward(&pooled)?;
        Ok(l2_normalize(&normed)?)
    }
}

/// Scale each row of `x` to unit L2 norm.
pub fn l2_normalize(x: &Tensor) -> candle_core::Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    x.broadcast_div(&norm)
}

#[cfg(test)]
pub(crate) mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    pub(crate) fn tiny_config() -> EncoderConfig {
        EncoderConfig {
            backbone: Backbone::Resnet18,
            embed_dim: 16,
            num_layers: 1,
            num_heads: 2,
            image_size: 64,
            positional: PositionalEncoding::Zero,
        }
    }

    fn build(config: &EncoderConfig) -> (VarMap, HybridEncoder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = HybridEncoder::new(config, vb).unwrap();
        (varmap, encoder)
    }

    #[test]
    fn outputs_have_unit_norm() {
        let config = tiny_config();
        let (_varmap, encoder) = build(&config);
        let images =
            Tensor::randn(0f32, 1.0, (3, 3, 64, 64), &Device::Cpu).unwrap();

        let out = encoder.forward(&images).unwrap();
        assert_eq!(out.dims2().unwrap(), (3, 16));
        for row in out.to_vec2::<f32>().unwrap() {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
        }
    }

    #[test]
    fn learned_positions_register_a_table() {
        let config = EncoderConfig {
            positional: PositionalEncoding::Learned,
            ..tiny_config()
        };
        let (varmap, encoder) = build(&config);
        let names: Vec<String> = varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert!(names.iter().any(|n| n == "pos_embed"));

        let images =
            Tensor::randn(0f32, 1.0, (1, 3, 64, 64), &Device::Cpu).unwrap();
        assert_eq!(encoder.forward(&images).unwrap().dims2().unwrap(), (1, 16));
    }

    #[test]
    fn zero_positions_register_no_table() {
        let (varmap, _encoder) = build(&tiny_config());
        let has_pos = varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .any(|n| n == "pos_embed");
        assert!(!has_pos);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = EncoderConfig {
            embed_dim: 10,
            num_heads: 3,
            ..tiny_config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_unaligned_image_size() {
        let config = EncoderConfig {
            image_size: 100,
            ..tiny_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn mismatch_names_the_field() {
        let trained = tiny_config();
        let requested = EncoderConfig {
            num_heads: 4,
            ..trained
        };
        match requested.ensure_matches(&trained) {
            Err(Error::ConfigMismatch { field, .. }) => {
                assert_eq!(field, "num_heads")
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn l2_normalize_rows() {
        let x = Tensor::new(&[[3f32, 4.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let y = l2_normalize(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!((y[0][0] - 0.6).abs() < 1e-6);
        assert!((y[0][1] - 0.8).abs() < 1e-6);
        assert!((y[1][1] - 1.0).abs() < 1e-6);
    }
}
