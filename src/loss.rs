//! NT-Xent (normalized temperature-scaled cross entropy) contrastive loss.

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Default temperature of the similarity softmax.
pub const DEFAULT_TEMPERATURE: f64 = 0.07;

/// Logit assigned to each embedding's similarity with itself, so it can
/// never be picked as the match.
const SELF_SIMILARITY_LOGIT: f32 = -1e9;

/// Contrastive loss over `N` aligned crop/page embedding pairs.
///
/// Both inputs are `(N, D)` unit vectors where row `i` of `crops` was cut
/// from row `i` of `pages`. The `2N` embeddings are compared all-pairs;
/// each row's target is its partner (`i <-> i + N`) and every other
/// embedding in the batch acts as a negative.
///
/// L = mean over rows r of -log(exp(s(r, p(r))/τ) / Σ_{j≠r} exp(s(r, j)/τ))
pub fn nt_xent(crops: &Tensor, pages: &Tensor, temperature: f64) -> Result<Tensor> {
    let n = crops.dim(0)?;
    if n == 0 || pages.dim(0)? != n {
        return Err(Error::Config(format!(
            "contrastive loss needs equal non-empty batches, got {n} crops and {} pages",
            pages.dim(0)?
        )));
    }
    let total = 2 * n;
    let device = crops.device();

    let z = Tensor::cat(&[crops, pages], 0)?;
    // Inputs are unit norm, so the inner product is the cosine similarity.
    let logits = z.matmul(&z.t()?)?.affine(1.0 / temperature, 0.0)?;

    let mut mask = vec![0f32; total * total];
    for i in 0..total {
        mask[i * total + i] = SELF_SIMILARITY_LOGIT;
    }
    let mask = Tensor::from_vec(mask, (total, total), device)?.to_dtype(logits.dtype())?;
    let logits = logits.add(&mask)?;

    let targets: Vec<u32> = (0..total).map(|i| ((i + n) % total) as u32).collect();
    let targets = Tensor::from_vec(targets, total, device)?;

    Ok(candle_nn::loss::cross_entropy(&logits.to_dtype(DType::F32)?, &targets)?)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::encoder::l2_normalize;

    fn unit(rows: &[[f32; 3]]) -> Tensor {
        let t = Tensor::new(rows.as_flattened(), &Device::Cpu)
            .unwrap()
            .reshape((rows.len(), 3))
            .unwrap();
        l2_normalize(&t).unwrap()
    }

    #[test]
    fn aligned_pairs_beat_shuffled_pairs() {
        let crops = unit(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let aligned = unit(&[[1.0, 0.1, 0.0], [0.1, 1.0, 0.0]]);
        let swapped = unit(&[[0.1, 1.0, 0.0], [1.0, 0.1, 0.0]]);

        let good = nt_xent(&crops, &aligned, DEFAULT_TEMPERATURE)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let bad = nt_xent(&crops, &swapped, DEFAULT_TEMPERATURE)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(good < bad, "aligned {good} should be below swapped {bad}");
    }

    #[test]
    fn single_pair_has_zero_loss() {
        // With N = 1 the partner is the only candidate left after masking.
        let crops = unit(&[[1.0, 2.0, 3.0]]);
        let pages = unit(&[[3.0, 2.0, 1.0]]);
        let loss = nt_xent(&crops, &pages, DEFAULT_TEMPERATURE)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.abs() < 1e-5);
    }

    #[test]
    fn matches_hand_computed_value() {
        // Orthogonal pairs: each row sees its partner at cos 1 and two
        // negatives at cos 0, so L = -log(e^{1/τ} / (e^{1/τ} + 2)).
        let crops = unit(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let pages = crops.clone();
        let tau = 0.5;
        let loss = nt_xent(&crops, &pages, tau)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64;
        let pos = (1.0f64 / tau).exp();
        let expected = -(pos / (pos + 2.0)).ln();
        assert!((loss - expected).abs() < 1e-4, "{loss} vs {expected}");
    }

    #[test]
    fn rejects_unaligned_batches() {
        let crops = unit(&[[1.0, 0.0, 0.0]]);
        let pages = unit(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert!(nt_xent(&crops, &pages, DEFAULT_TEMPERATURE).is_err());
    }
}
