use candle_core::{D, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

use super::Backbone;

/// Batch normalization with fixed running statistics.
///
/// The affine `weight`/`bias` are trainable; the running mean and variance
/// are detached so they never receive gradients. Training and inference
/// therefore run the exact same computation.
#[derive(Debug, Clone)]
struct FrozenBatchNorm {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    eps: f64,
}

impl FrozenBatchNorm {
    fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(channels, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(channels, "bias", Init::Const(0.0))?,
            running_mean: vb.get_with_hints(
                channels,
                "running_mean",
                Init::Const(0.0),
            )?,
            running_var: vb.get_with_hints(
                channels,
                "running_var",
                Init::Const(1.0),
            )?,
            eps: 1e-5,
        })
    }
}

impl Module for FrozenBatchNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let channels = self.weight.dim(0)?;
        let inv_std = self
            .running_var
            .detach()
            .affine(1.0, self.eps)?
            .sqrt()?
            .recip()?;
        let scale = self.weight.mul(&inv_std)?;
        let shift = self.bias.sub(&self.running_mean.detach().mul(&scale)?)?;
        xs.broadcast_mul(&scale.reshape((1, channels, 1, 1))?)?
            .broadcast_add(&shift.reshape((1, channels, 1, 1))?)
    }
}

fn conv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> candle_core::Result<Conv2d> {
    candle_nn::conv2d_no_bias(
        in_channels,
        out_channels,
        kernel,
        Conv2dConfig {
            stride,
            padding,
            ..Default::default()
        },
        vb,
    )
}

/// 1x1 convolution + batch norm on the residual path when the block
/// changes resolution or width.
#[derive(Debug, Clone)]
struct Downsample {
    conv: Conv2d,
    bn: FrozenBatchNorm,
}

impl Downsample {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            conv: conv(in_channels, out_channels, 1, stride, 0, vb.pp("0"))?,
            bn: FrozenBatchNorm::new(out_channels, vb.pp("1"))?,
        })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.conv)?.apply(&self.bn)
    }
}

#[derive(Debug, Clone)]
enum Block {
    /// Two 3x3 convolutions (ResNet-18/34).
    Basic {
        conv1: Conv2d,
        bn1: FrozenBatchNorm,
        conv2: Conv2d,
        bn2: FrozenBatchNorm,
        downsample: Option<Downsample>,
    },
    /// 1x1 reduce, 3x3, 1x1 expand (ResNet-50).
    Bottleneck {
        conv1: Conv2d,
        bn1: FrozenBatchNorm,
        conv2: Conv2d,
        bn2: FrozenBatchNorm,
        conv3: Conv2d,
        bn3: FrozenBatchNorm,
        downsample: Option<Downsample>,
    },
}

impl Block {
    fn basic(
        in_channels: usize,
        planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let downsample = (stride != 1 || in_channels != planes)
            .then(|| Downsample::new(in_channels, planes, stride, vb.pp("downsample")))
            .transpose()?;
        Ok(Self::Basic {
            conv1: conv(in_channels, planes, 3, stride, 1, vb.pp("conv1"))?,
            bn1: FrozenBatchNorm::new(planes, vb.pp("bn1"))?,
            conv2: conv(planes, planes, 3, 1, 1, vb.pp("conv2"))?,
            bn2: FrozenBatchNorm::new(planes, vb.pp("bn2"))?,
            downsample,
        })
    }

    fn bottleneck(
        in_channels: usize,
        planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let out_channels = planes * BOTTLENECK_EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| {
                Downsample::new(in_channels, out_channels, stride, vb.pp("downsample"))
            })
            .transpose()?;
        Ok(Self::Bottleneck {
            conv1: conv(in_channels, planes, 1, 1, 0, vb.pp("conv1"))?,
            bn1: FrozenBatchNorm::new(planes, vb.pp("bn1"))?,
            conv2: conv(planes, planes, 3, stride, 1, vb.pp("conv2"))?,
            bn2: FrozenBatchNorm::new(planes, vb.pp("bn2"))?,
            conv3: conv(planes, out_channels, 1, 1, 0, vb.pp("conv3"))?,
            bn3: FrozenBatchNorm::new(out_channels, vb.pp("bn3"))?,
            downsample,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (residual, downsample) = match self {
            Self::Basic {
                conv1,
                bn1,
                conv2,
                bn2,
                downsample,
            } => (
                xs.apply(conv1)?
                    .apply(bn1)?
                    .relu()?
                    .apply(conv2)?
                    .apply(bn2)?,
                downsample,
            ),
            Self::Bottleneck {
                conv1,
                bn1,
                conv2,
                bn2,
                conv3,
                bn3,
                downsample,
            } => (
                xs.apply(conv1)?
                    .apply(bn1)?
                    .relu()?
                    .apply(conv2)?
                    .apply(bn2)?
                    .relu()?
                    .apply(conv3)?
                    .apply(bn3)?,
                downsample,
            ),
        };

        let shortcut = match downsample {
            Some(ds) => xs.apply(ds)?,
            None => xs.clone(),
        };
        (residual + shortcut)?.relu()
    }
}

const BOTTLENECK_EXPANSION: usize = 4;
const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];
const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

/// 7x7/2 convolution, batch norm, ReLU, 3x3/2 max pool: `S -> S/4`.
#[derive(Debug, Clone)]
struct Stem {
    conv1: Conv2d,
    bn1: FrozenBatchNorm,
}

impl Module for Stem {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // Zero padding is equivalent to -inf padding here: the input of the
        // pool is post-ReLU and therefore non-negative.
        xs.apply(&self.conv1)?
            .apply(&self.bn1)?
            .relu()?
            .pad_with_zeros(D::Minus1, 1, 1)?
            .pad_with_zeros(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)
    }
}

/// A run of residual blocks; the first one may downsample.
#[derive(Debug, Clone)]
struct Stage {
    blocks: Vec<Block>,
}

impl Module for Stage {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.blocks
            .iter()
            .try_fold(xs.clone(), |acc, block| acc.apply(block))
    }
}

/// ResNet feature extractor as an explicit stem -> stage1..stage4 pipeline,
/// without the classification head.
#[derive(Debug, Clone)]
pub struct ResNetBackbone {
    stem: Stem,
    stages: Vec<Stage>,
}

impl ResNetBackbone {
    pub fn new(kind: Backbone, vb: VarBuilder) -> candle_core::Result<Self> {
        let stem = Stem {
            conv1: conv(3, 64, 7, 2, 3, vb.pp("conv1"))?,
            bn1: FrozenBatchNorm::new(64, vb.pp("bn1"))?,
        };

        let depths: [usize; 4] = match kind {
            Backbone::Resnet18 => [2, 2, 2, 2],
            Backbone::Resnet34 | Backbone::Resnet50 => [3, 4, 6, 3],
        };

        let mut in_channels = 64;
        let mut stages = Vec::with_capacity(4);
        for (s, &depth) in depths.iter().enumerate() {
            let vb_stage = vb.pp(format!("layer{}", s + 1));
            let planes = STAGE_PLANES[s];
            let mut blocks = Vec::with_capacity(depth);
            for b in 0..depth {
                let stride = if b == 0 { STAGE_STRIDES[s] } else { 1 };
                let block = match kind {
                    Backbone::Resnet18 | Backbone::Resnet34 => {
                        let block =
                            Block::basic(in_channels, planes, stride, vb_stage.pp(b))?;
                        in_channels = planes;
                        block
                    }
                    Backbone::Resnet50 => {
                        let block = Block::bottleneck(
                            in_channels,
                            planes,
                            stride,
                            vb_stage.pp(b),
                        )?;
                        in_channels = planes * BOTTLENECK_EXPANSION;
                        block
                    }
                };
                blocks.push(block);
            }
            stages.push(Stage { blocks });
        }

        Ok(Self { stem, stages })
    }

    /// `(B, 3, S, S) -> (B, C, S/32, S/32)`.
    pub fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        let stem = images.apply(&self.stem)?;
        self.stages
            .iter()
            .try_fold(stem, |acc, stage| acc.apply(stage))
    }
}
