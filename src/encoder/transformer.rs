use candle_core::{D, Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Layer normalization over the last dimension, built from primitive ops so
/// it stays differentiable end to end.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(dim, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(dim, "bias", Init::Const(0.0))?,
            eps: 1e-5,
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&var.affine(1.0, self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Multi-head scaled dot-product self-attention over the full sequence.
#[derive(Debug, Clone)]
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            q_proj: candle_nn::linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(dim, dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// `(B, S, D) -> (B, H, S, D/H)`
    fn split_heads(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, s, _) = xs.dims3()?;
        xs.reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for SelfAttention {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, s, d) = xs.dims3()?;
        let q = self.split_heads(&xs.apply(&self.q_proj)?)?;
        let k = self.split_heads(&xs.apply(&self.k_proj)?)?;
        let v = self.split_heads(&xs.apply(&self.v_proj)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, d))?
            .apply(&self.out_proj)
    }
}

/// One post-norm transformer encoder layer:
/// `x = norm1(x + attn(x)); x = norm2(x + ff(x))`.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    attn: SelfAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl EncoderLayer {
    pub fn new(
        dim: usize,
        num_heads: usize,
        ff_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            attn: SelfAttention::new(dim, num_heads, vb.pp("self_attn"))?,
            linear1: candle_nn::linear(dim, ff_dim, vb.pp("linear1"))?,
            linear2: candle_nn::linear(ff_dim, dim, vb.pp("linear2"))?,
            norm1: LayerNorm::new(dim, vb.pp("norm1"))?,
            norm2: LayerNorm::new(dim, vb.pp("norm2"))?,
        })
    }
}

impl Module for EncoderLayer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let attended = (xs + xs.apply(&self.attn)?)?.apply(&self.norm1)?;
        let ff = attended
            .apply(&self.linear1)?
            .relu()?
            .apply(&self.linear2)?;
        (&attended + ff)?.apply(&self.norm2)
    }
}
