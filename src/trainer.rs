//! Contrastive fine-tuning of the page encoder on crop/page pairs.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use kdam::BarExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    dataset::{BatchLoader, load_pair_batch},
    encoder::{EncoderConfig, HybridEncoder},
    error::{Error, Result},
    loss::{DEFAULT_TEMPERATURE, nt_xent},
    model_manager::{self, BackboneInit},
    preprocess::ImageProcessor,
    sampler::TrainingPair,
};

/// Optimization hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub temperature: f64,
    /// Seeds the per-epoch shuffling.
    pub seed: u64,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 8,
            learning_rate: 1e-4,
            temperature: DEFAULT_TEMPERATURE,
            seed: 0,
            progress: true,
        }
    }
}

/// Mean batch loss of every completed epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epoch_losses: Vec<f32>,
}

impl TrainingHistory {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Owns the trainable encoder and its optimizer state.
pub struct Trainer {
    config: TrainConfig,
    encoder_config: EncoderConfig,
    varmap: VarMap,
    encoder: HybridEncoder,
    optimizer: AdamW,
    processor: ImageProcessor,
    device: Device,
}

impl Trainer {
    /// Build a freshly initialized encoder for `encoder_config`.
    pub fn new(
        encoder_config: EncoderConfig,
        config: TrainConfig,
        device: Device,
    ) -> Result<Self> {
        if config.epochs == 0 {
            return Err(Error::Config("at least one epoch is required".into()));
        }
        if !(config.temperature > 0.0) {
            return Err(Error::Config("temperature must be positive".into()));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = HybridEncoder::new(&encoder_config, vb)?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;

        Ok(Self {
            config,
            encoder_config,
            varmap,
            encoder,
            optimizer,
            processor: ImageProcessor::new(encoder_config.image_size),
            device,
        })
    }

    /// Start from pretrained backbone weights instead of a random init.
    pub fn init_backbone(&self, source: &BackboneInit) -> Result<usize> {
        model_manager::init_backbone(&self.varmap, self.encoder_config.backbone, source)
    }

    pub fn encoder(&self) -> &HybridEncoder {
        &self.encoder
    }

    /// Run every configured epoch over `pairs`.
    pub fn fit(&mut self, pairs: &[TrainingPair]) -> Result<TrainingHistory> {
        if pairs.is_empty() {
            return Err(Error::Config("no training pairs".into()));
        }
        let loader = BatchLoader::new(pairs.len(), self.config.batch_size, self.config.seed)?;
        info!(
            pairs = pairs.len(),
            batches = loader.num_batches(),
            epochs = self.config.epochs,
            "starting training"
        );

        let mut history = TrainingHistory::default();
        for epoch in 0..self.config.epochs {
            let loss = self.train_epoch(pairs, &loader, epoch)?;
            info!(epoch = epoch + 1, loss, "epoch finished");
            history.epoch_losses.push(loss);
        }
        Ok(history)
    }

    /// One pass over the data; returns the mean batch loss.
    pub fn train_epoch(
        &mut self,
        pairs: &[TrainingPair],
        loader: &BatchLoader,
        epoch: usize,
    ) -> Result<f32> {
        let mut pb = kdam::tqdm!(
            total = loader.num_batches(),
            desc = format!("epoch {}/{}", epoch + 1, self.config.epochs),
            disable = !self.config.progress
        );

        let mut total = 0.0f32;
        let mut batches = 0usize;
        for (step, indices) in loader.epoch(epoch).enumerate() {
            let (crops, pages) =
                load_pair_batch(pairs, &indices, &self.processor, &self.device)?;

            let zc = self.encoder.forward(&crops)?;
            let zp = self.encoder.forward(&pages)?;
            let loss = nt_xent(&zc, &zp, self.config.temperature)?;
            self.optimizer.backward_step(&loss)?;

            let value = loss.to_scalar::<f32>()?;
            debug!(epoch = epoch + 1, step, batch = indices.len(), loss = value);
            total += value;
            batches += 1;

            pb.set_postfix(format!("loss={value:.4}"));
            pb.update(1)?;
        }

        Ok(if batches == 0 { 0.0 } else { total / batches as f32 })
    }

    /// Persist the weights and their configuration sidecar.
    pub fn save(&self, weights: &Path) -> Result<()> {
        model_manager::save_weights(&self.varmap, &self.encoder_config, weights)
    }
}
