//! Seeded mini-batching over training pairs.

use candle_core::{Device, Tensor};
use rand::{SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    preprocess::ImageProcessor,
    sampler::TrainingPair,
};

/// Produces shuffled, fixed-size batches of dataset indices.
///
/// Each epoch's order depends only on the seed and the epoch number, so
/// any epoch can be replayed without running the ones before it. The last
/// batch of an epoch holds the remainder and may be short.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    len: usize,
    batch_size: usize,
    seed: u64,
}

impl BatchLoader {
    pub fn new(len: usize, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        Ok(Self {
            len,
            batch_size,
            seed,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    /// Lazily iterate over the batches of `epoch`.
    pub fn epoch(&self, epoch: usize) -> EpochBatches {
        let mut order: Vec<usize> = (0..self.len).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(epoch_seed(self.seed, epoch));
        order.shuffle(&mut rng);
        EpochBatches {
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Iterator over one epoch's index batches.
#[derive(Debug, Clone)]
pub struct EpochBatches {
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for EpochBatches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining =
            (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EpochBatches {}

/// Decode the pairs at `indices` in parallel and stack them into
/// `(crops, pages)` tensors of shape `(B, 3, S, S)` on `device`.
///
/// The first unreadable image aborts the batch with an error naming its
/// page.
pub fn load_pair_batch(
    pairs: &[TrainingPair],
    indices: &[usize],
    processor: &ImageProcessor,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let loaded = indices
        .par_iter()
        .map(|&i| {
            let pair = &pairs[i];
            processor
                .load_pair(&pair.page.image_path, &pair.bbox, &Device::Cpu)
                .map_err(|e| e.for_page(&pair.page))
        })
        .collect::<Result<Vec<_>>>()?;

    let (crops, pages): (Vec<Tensor>, Vec<Tensor>) = loaded.into_iter().unzip();
    let crops = Tensor::stack(&crops, 0)?.to_device(device)?;
    let pages = Tensor::stack(&pages, 0)?.to_device(device)?;
    Ok((crops, pages))
}
