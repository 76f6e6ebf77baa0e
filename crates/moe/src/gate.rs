//! Top-k gating.
//!
//! The gate scores every token against every expert with a bias-free
//! linear layer, picks the top-k experts per token, and renormalizes the
//! picked softmax probabilities so each token's weights sum to 1. It also
//! produces the load-balancing auxiliary loss and the per-expert capacity
//! for the batch; enforcement of that capacity happens in the dispatcher.
//!
//! With `noisy_gate` enabled, expert *selection* uses Gumbel-perturbed
//! logits during training while the combine weights still come from the
//! clean softmax, so exploration does not distort the mixture.

use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::error::{MoeError, Result};

/// Gate hyperparameters.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Width of incoming token embeddings.
    pub model_dim: usize,
    /// Total number of experts across the expert-parallel group.
    pub num_experts: usize,
    /// Experts activated per token.
    pub top_k: usize,
    /// Scales the per-expert token budget for a batch.
    pub capacity_factor: f64,
    /// Perturb selection logits with Gumbel noise while training.
    pub noisy_gate: bool,
}

impl GateConfig {
    /// Per-expert token budget for a batch of `num_tokens` tokens.
    ///
    /// `max(1, ceil(num_tokens * top_k * capacity_factor / num_experts))`
    pub fn capacity(&self, num_tokens: usize) -> usize {
        let raw = (num_tokens * self.top_k) as f64 * self.capacity_factor
            / self.num_experts as f64;
        (raw.ceil() as usize).max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.model_dim == 0 || self.num_experts == 0 {
            return Err(MoeError::InvalidConfig(
                "model_dim and num_experts must be > 0".to_string(),
            ));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(MoeError::InvalidConfig(format!(
                "top_k ({}) must be in 1..={}",
                self.top_k, self.num_experts
            )));
        }
        if self.capacity_factor <= 0.0 {
            return Err(MoeError::InvalidConfig(format!(
                "capacity_factor ({}) must be > 0",
                self.capacity_factor
            )));
        }
        Ok(())
    }
}

/// Routing decision for one batch.
#[derive(Debug)]
pub struct GateOutput {
    /// Combine weights, `[num_tokens, top_k]`, input dtype. Each row sums
    /// to 1.
    pub weights: Tensor,
    /// Selected global expert ids, `[num_tokens, top_k]`, u32.
    pub experts: Tensor,
    /// Scalar load-balancing loss, f32.
    pub aux_loss: Tensor,
    /// Per-expert token budget the dispatcher must enforce.
    pub capacity: usize,
    /// Assignments per expert before capacity enforcement (all k slots).
    pub expert_counts: Vec<usize>,
}

/// Learned top-k router over the global expert set.
///
/// Replicated on every expert-parallel rank so all ranks agree on the
/// routing decision without communication.
pub struct TopKGate {
    wg: Linear,
    config: GateConfig,
}

impl TopKGate {
    pub fn new(config: GateConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let wg = candle_nn::linear_no_bias(config.model_dim, config.num_experts, vb.pp("wg"))?;
        Ok(Self { wg, config })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Raw gate scores, `[num_tokens, num_experts]`.
    pub fn logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        Ok(self.wg.forward(hidden_states)?)
    }

    /// Route a flat batch of tokens `[num_tokens, model_dim]`.
    pub fn route(&self, hidden_states: &Tensor, train: bool) -> Result<GateOutput> {
        let (num_tokens, _) = hidden_states.dims2()?;
        let num_experts = self.config.num_experts;
        let top_k = self.config.top_k;

        let logits = self.wg.forward(hidden_states)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;

        // Selection may be noised; combine weights never are.
        let selection_logits = if self.config.noisy_gate && train {
            let noise = gumbel_like(&logits)?;
            logits.add(&noise)?
        } else {
            logits
        };

        let order = selection_logits.arg_sort_last_dim(false)?;
        let experts = order.narrow(1, 0, top_k)?.contiguous()?;
        let picked = probs.gather(&experts, 1)?;

        // Renormalize over k, guarding against a degenerate denominator.
        let denom = picked.sum_keepdim(1)?.clamp(1e-6f32, 1f32)?;
        let weights = picked.broadcast_div(&denom)?;

        let expert_ids: Vec<u32> = experts.flatten_all()?.to_vec1()?;
        let mut expert_counts = vec![0usize; num_experts];
        for &id in &expert_ids {
            expert_counts[id as usize] += 1;
        }

        let aux_loss = self.aux_loss(&probs, &expert_ids, num_tokens)?;

        Ok(GateOutput {
            weights,
            experts,
            aux_loss,
            capacity: self.config.capacity(num_tokens),
            expert_counts,
        })
    }

    /// GShard load-balancing loss: `num_experts * Σ_e me_e * ce_e`.
    ///
    /// `me` is the mean softmax probability per expert, `ce` the fraction
    /// of tokens whose first choice is that expert. Flat routing over E
    /// experts yields `E * E * (1/E)^2 = 1`, the minimum of the loss.
    fn aux_loss(&self, probs: &Tensor, expert_ids: &[u32], num_tokens: usize) -> Result<Tensor> {
        let num_experts = self.config.num_experts;
        let device = probs.device();

        let me = probs.to_dtype(DType::F32)?.mean(0)?;

        let mut top1_counts = vec![0f32; num_experts];
        for token in 0..num_tokens {
            let first = expert_ids[token * self.config.top_k] as usize;
            top1_counts[first] += 1.0;
        }
        let ce = Tensor::from_vec(top1_counts, num_experts, device)?
            .affine(1.0 / num_tokens as f64, 0.0)?;

        Ok(me
            .mul(&ce)?
            .sum_all()?
            .affine(num_experts as f64, 0.0)?)
    }
}

/// Standard-Gumbel sample with the shape/dtype/device of `t`.
fn gumbel_like(t: &Tensor) -> Result<Tensor> {
    // Uniform draw bounded away from 0 so the double log stays finite.
    let u = Tensor::rand(1e-6f32, 1f32, t.dims(), t.device())?.to_dtype(t.dtype())?;
    Ok(u.log()?.neg()?.log()?.neg()?)
}
