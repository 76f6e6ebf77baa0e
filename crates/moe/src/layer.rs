//! The sharded MoE layer and its public wrapper.
//!
//! [`ShardedMoELayer`] wires gate, dispatcher, and the local expert shard
//! into one forward pass:
//!
//! ```text
//! 1. Route (replicated): every rank computes the same top-k decision
//! 2. Dispatch: surviving assignments travel to expert-owning ranks
//! 3. Local compute: grouped forward through this rank's experts
//! 4. Combine: weighted reduction back into original token order
//! ```
//!
//! [`MoE`] is the client-facing module: it builds the layer, applies
//! output dropout, and hands back the hidden states together with the
//! gate's auxiliary load-balancing loss for the training objective.

use candle_core::{DType, Tensor};
use candle_nn::{Dropout, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::distributed::ExpertParallelContext;
use crate::error::{MoeError, Result};
use crate::experts::{Expert, LocalExperts};
use crate::gate::{GateConfig, TopKGate};
use crate::partition::{ExpertPartition, Placement};

fn default_num_experts() -> usize {
    1
}

fn default_top_k() -> usize {
    1
}

fn default_capacity_factor() -> f64 {
    1.0
}

/// Layer hyperparameters.
///
/// Defaults mirror the single-expert degenerate case: one expert, top-1
/// routing, capacity factor 1.0, no noise, no dropout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoEConfig {
    /// Token embedding width.
    pub hidden_size: usize,
    /// Expert FFN width (stock experts only).
    pub intermediate_size: usize,
    /// Experts across the whole expert-parallel group.
    #[serde(default = "default_num_experts")]
    pub num_experts: usize,
    /// Experts activated per token.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Scales the per-expert token budget per batch.
    #[serde(default = "default_capacity_factor")]
    pub capacity_factor: f64,
    /// Gumbel-perturbed expert selection during training.
    #[serde(default)]
    pub noisy_gate: bool,
    /// Dropout applied to the layer output while training.
    #[serde(default)]
    pub output_dropout: f32,
    /// How experts are spread over expert-parallel ranks.
    #[serde(default)]
    pub placement: Placement,
}

impl MoEConfig {
    fn gate_config(&self) -> GateConfig {
        GateConfig {
            model_dim: self.hidden_size,
            num_experts: self.num_experts,
            top_k: self.top_k,
            capacity_factor: self.capacity_factor,
            noisy_gate: self.noisy_gate,
        }
    }
}

/// Expert-parallel MoE layer: replicated gate, sharded experts.
///
/// Each rank stores `num_experts / ep_size` experts; tokens reach remote
/// experts through the context's communicator.
pub struct ShardedMoELayer {
    gate: TopKGate,
    experts: LocalExperts,
    dispatcher: Dispatcher,
    config: MoEConfig,
}

impl std::fmt::Debug for ShardedMoELayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMoELayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ShardedMoELayer {
    /// Layer with stock SwiGLU experts.
    pub fn new(config: MoEConfig, vb: VarBuilder, ctx: &ExpertParallelContext) -> Result<Self> {
        Self::with_expert_factory(config, vb, ctx, |cfg, vb| {
            Ok(Box::new(crate::experts::FeedForwardExpert::new(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb,
            )?))
        })
    }

    /// Layer with caller-supplied experts.
    ///
    /// `make` runs once per expert owned by this rank, scoped to that
    /// expert's weight prefix.
    pub fn with_expert_factory<F>(
        config: MoEConfig,
        vb: VarBuilder,
        ctx: &ExpertParallelContext,
        make: F,
    ) -> Result<Self>
    where
        F: Fn(&MoEConfig, VarBuilder) -> Result<Box<dyn Expert>>,
    {
        let partition = ExpertPartition::new(
            config.num_experts,
            ctx.ep_size(),
            ctx.ep_rank(),
            config.placement,
        )?;

        if ctx.is_coordinator() {
            info!(
                num_experts = config.num_experts,
                num_local_experts = partition.local_count(),
                expert_parallel_size = ctx.ep_size(),
                "building expert-parallel MoE layer"
            );
        }

        let gate = TopKGate::new(config.gate_config(), vb.pp("gate"))?;
        let experts = LocalExperts::build(&partition, vb, |_, expert_vb| make(&config, expert_vb))?;
        let dispatcher = Dispatcher::new(partition, ctx.communicator());

        Ok(Self {
            gate,
            experts,
            dispatcher,
            config,
        })
    }

    /// Forward pass; returns the layer output and the auxiliary loss.
    ///
    /// Accepts `[num_tokens, hidden]` or `[batch, seq, hidden]` input and
    /// restores the input shape on the way out.
    pub fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let orig_shape = hidden_states.dims().to_vec();
        let hidden_size = *orig_shape.last().ok_or_else(|| MoeError::ShapeMismatch {
            expected: vec![self.config.hidden_size],
            actual: orig_shape.clone(),
        })?;
        if hidden_size != self.config.hidden_size {
            return Err(MoeError::ShapeMismatch {
                expected: vec![self.config.hidden_size],
                actual: orig_shape,
            });
        }

        let num_tokens: usize = orig_shape[..orig_shape.len() - 1].iter().product();
        if num_tokens == 0 {
            let zero = Tensor::zeros((), DType::F32, hidden_states.device())?;
            return Ok((hidden_states.clone(), zero));
        }
        let flat = hidden_states.reshape((num_tokens, hidden_size))?;

        let routed = self.gate.route(&flat, train)?;
        let plan = self.dispatcher.dispatch(&flat, &routed)?;
        let expert_out = self
            .experts
            .forward_grouped(&plan.recv_tokens, &plan.recv_slots)?;
        let combined = self.dispatcher.combine(&expert_out, &plan)?;

        Ok((combined.reshape(orig_shape)?, routed.aux_loss))
    }

    pub fn num_experts(&self) -> usize {
        self.config.num_experts
    }

    pub fn num_local_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    pub fn ep_size(&self) -> usize {
        self.dispatcher.partition().ep_size()
    }

    pub fn ep_rank(&self) -> usize {
        self.dispatcher.partition().ep_rank()
    }

    pub fn gate(&self) -> &TopKGate {
        &self.gate
    }
}

/// Output of one [`MoE`] forward pass.
#[derive(Debug)]
pub struct MoEOutput {
    /// Mixture output, same shape as the input.
    pub hidden_states: Tensor,
    /// Scalar gate loss; add `coefficient * aux_loss` to the training
    /// objective to keep expert load balanced.
    pub aux_loss: Tensor,
}

/// Client-facing mixture-of-experts module.
///
/// Composes the sharded layer with output dropout. Requires an
/// [`ExpertParallelContext`]; for a single process use
/// [`ExpertParallelContext::single_process`].
pub struct MoE {
    layer: ShardedMoELayer,
    dropout: Dropout,
}

impl MoE {
    pub fn new(config: MoEConfig, vb: VarBuilder, ctx: &ExpertParallelContext) -> Result<Self> {
        let dropout = Dropout::new(config.output_dropout);
        let layer = ShardedMoELayer::new(config, vb, ctx)?;
        Ok(Self { layer, dropout })
    }

    /// Like [`MoE::new`] but with caller-supplied experts.
    pub fn with_expert_factory<F>(
        config: MoEConfig,
        vb: VarBuilder,
        ctx: &ExpertParallelContext,
        make: F,
    ) -> Result<Self>
    where
        F: Fn(&MoEConfig, VarBuilder) -> Result<Box<dyn Expert>>,
    {
        let dropout = Dropout::new(config.output_dropout);
        let layer = ShardedMoELayer::with_expert_factory(config, vb, ctx, make)?;
        Ok(Self { layer, dropout })
    }

    pub fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<MoEOutput> {
        let (out, aux_loss) = self.layer.forward(hidden_states, train)?;
        let hidden_states = self.dropout.forward(&out, train)?;
        Ok(MoEOutput {
            hidden_states,
            aux_loss,
        })
    }

    pub fn layer(&self) -> &ShardedMoELayer {
        &self.layer
    }
}
