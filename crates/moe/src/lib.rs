//! Expert-parallel mixture-of-experts layer.
//!
//! Sparse MoE building block for large models: a replicated top-k gate
//! decides which experts see each token, tokens travel to the ranks that
//! own those experts, and the weighted expert outputs are combined back
//! into the original token order.
//!
//! ## Modules
//!
//! - [`gate`]: top-k softmax gating, capacity, auxiliary loss
//! - [`experts`]: the [`Expert`](experts::Expert) trait and per-rank shard
//! - [`partition`]: expert-to-rank placement
//! - [`dispatch`]: capacity-constrained all-to-all dispatch/combine
//! - [`distributed`]: process groups and collectives
//! - [`layer`]: [`ShardedMoELayer`] and the [`MoE`] wrapper
//!
//! ## Quick start
//!
//! ```ignore
//! use sharded_moe::{ExpertParallelContext, MoE, MoEConfig};
//!
//! let ctx = ExpertParallelContext::single_process();
//! let moe = MoE::new(config, vb, &ctx)?;
//! let out = moe.forward(&hidden_states, /* train = */ true)?;
//! // out.hidden_states, out.aux_loss
//! ```

pub mod dispatch;
pub mod distributed;
pub mod error;
pub mod experts;
pub mod gate;
pub mod layer;
pub mod partition;

pub use dispatch::{DispatchPlan, Dispatcher};
pub use distributed::{
    Communicator, ExpertParallelContext, LocalProcessGroup, LoopbackCommunicator, ProcessGroup,
};
pub use error::{MoeError, Result};
pub use experts::{Expert, FeedForwardExpert, LocalExperts};
pub use gate::{GateConfig, GateOutput, TopKGate};
pub use layer::{MoE, MoEConfig, MoEOutput, ShardedMoELayer};
pub use partition::{ExpertPartition, Placement};
