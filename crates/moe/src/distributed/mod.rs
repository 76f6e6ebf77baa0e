//! Expert-parallel process groups and collectives.
//!
//! - [`ProcessGroup`] — rank / world-size bookkeeping
//! - [`Communicator`] — the all-to-all exchanges token dispatch needs
//! - [`ExpertParallelContext`] — the handle MoE layers are built against
//!
//! A single process uses [`ExpertParallelContext::single_process`], where
//! every collective degenerates to identity. Real multi-process transport
//! (NCCL, MPI) plugs in by implementing [`Communicator`].

mod communicator;
mod process_group;

pub use communicator::{Communicator, LoopbackCommunicator};
pub use process_group::{ExpertParallelContext, LocalProcessGroup, ProcessGroup};
