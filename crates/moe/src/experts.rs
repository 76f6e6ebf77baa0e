//! Expert modules and the per-rank expert shard.
//!
//! The layer is generic over what an expert computes: anything
//! implementing [`Expert`] can be sharded. [`FeedForwardExpert`] is the
//! stock SwiGLU FFN used when the caller does not supply its own factory.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use crate::error::Result;
use crate::partition::ExpertPartition;

/// A single expert network.
///
/// `forward` maps `[n, model_dim]` to `[n, model_dim]` for any `n`,
/// including 0.
pub trait Expert: Send + Sync {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;
}

/// SwiGLU feed-forward expert: `w2(silu(w1(x)) * w3(x))`, bias-free.
pub struct FeedForwardExpert {
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl FeedForwardExpert {
    pub fn new(model_dim: usize, ffn_dim: usize, vb: VarBuilder) -> Result<Self> {
        let w1 = candle_nn::linear_no_bias(model_dim, ffn_dim, vb.pp("w1"))?;
        let w2 = candle_nn::linear_no_bias(ffn_dim, model_dim, vb.pp("w2"))?;
        let w3 = candle_nn::linear_no_bias(model_dim, ffn_dim, vb.pp("w3"))?;
        Ok(Self { w1, w2, w3 })
    }
}

impl Expert for FeedForwardExpert {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w1.forward(xs)?)?;
        let up = self.w3.forward(xs)?;
        Ok(self.w2.forward(&gate.mul(&up)?)?)
    }
}

/// The experts stored on this expert-parallel rank, indexed by local slot.
///
/// Weights load under `experts.{global_id}` so checkpoints are addressed
/// by global id regardless of how the shard is placed.
pub struct LocalExperts {
    experts: Vec<Box<dyn Expert>>,
}

impl LocalExperts {
    /// Build this rank's shard, calling `make(global_id, vb)` once per
    /// owned expert.
    pub fn build<F>(partition: &ExpertPartition, vb: VarBuilder, mut make: F) -> Result<Self>
    where
        F: FnMut(usize, VarBuilder) -> Result<Box<dyn Expert>>,
    {
        let mut experts: Vec<Box<dyn Expert>> = Vec::with_capacity(partition.local_count());
        for global_id in partition.owned_global_ids() {
            experts.push(make(global_id, vb.pp(format!("experts.{global_id}")))?);
        }
        Ok(Self { experts })
    }

    /// Shard of stock SwiGLU experts.
    pub fn feed_forward(
        partition: &ExpertPartition,
        model_dim: usize,
        ffn_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::build(partition, vb, |_, vb| {
            Ok(Box::new(FeedForwardExpert::new(model_dim, ffn_dim, vb)?))
        })
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    /// Run each received token through the expert in its assigned slot.
    ///
    /// `tokens` is `[n, model_dim]`, `slots` is `[n]` u32 of local slot
    /// indices. Tokens sharing a slot run through the expert as one batch;
    /// results scatter back to their input rows via `index_add`.
    pub fn forward_grouped(&self, tokens: &Tensor, slots: &Tensor) -> Result<Tensor> {
        let (n, model_dim) = tokens.dims2()?;
        let device = tokens.device();
        let dtype = tokens.dtype();

        if n == 0 {
            return Ok(Tensor::zeros((0, model_dim), dtype, device)?);
        }

        let slot_ids: Vec<u32> = slots.to_vec1()?;
        let mut groups: Vec<Vec<u32>> = vec![Vec::new(); self.experts.len()];
        for (row, &slot) in slot_ids.iter().enumerate() {
            if (slot as usize) < self.experts.len() {
                groups[slot as usize].push(row as u32);
            }
        }

        let mut output = Tensor::zeros((n, model_dim), dtype, device)?;
        for (slot, rows) in groups.iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let idx = Tensor::from_vec(rows.clone(), rows.len(), device)?;
            let batch = tokens.index_select(&idx, 0)?;
            let out = self.experts[slot].forward(&batch)?;
            output = output.index_add(&idx, &out, 0)?;
        }
        Ok(output)
    }
}
