//! Process group management for expert parallelism.
//!
//! A process group is the set of ranks that participate in collective
//! operations. MoE layers only ever talk to the expert-parallel group,
//! wrapped here as [`ExpertParallelContext`]: a layer cannot be built
//! without one, which is how "the parallel groups must be initialized
//! before use" is enforced.

use std::sync::Arc;

use crate::distributed::communicator::{Communicator, LoopbackCommunicator};
use crate::error::{MoeError, Result};

/// Rank bookkeeping for one process in a group.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process (0..world_size).
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn world_size(&self) -> usize;

    /// Whether this is rank 0.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether the group has a single member.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// In-process group, used for single-process execution and for unit
/// testing multi-rank logic without real transport.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Single-member group.
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Group with a simulated rank/size, for tests.
    pub fn with_rank(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(MoeError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Handle to the expert-parallel group an MoE layer runs in.
///
/// Owns the communicator used for token dispatch. Construct once during
/// model setup and share across layers.
#[derive(Clone)]
pub struct ExpertParallelContext {
    comm: Arc<dyn Communicator>,
}

impl ExpertParallelContext {
    /// Wrap an existing communicator.
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }

    /// Context for single-process execution: every collective is a no-op.
    pub fn single_process() -> Self {
        Self::new(Arc::new(LoopbackCommunicator::new(LocalProcessGroup::new())))
    }

    /// The communicator for this group.
    pub fn communicator(&self) -> Arc<dyn Communicator> {
        Arc::clone(&self.comm)
    }

    /// This process's rank within the expert-parallel group.
    pub fn ep_rank(&self) -> usize {
        self.comm.process_group().rank()
    }

    /// Number of ranks experts are sharded over.
    pub fn ep_size(&self) -> usize {
        self.comm.process_group().world_size()
    }

    /// Whether this rank should emit group-wide log lines.
    pub fn is_coordinator(&self) -> bool {
        self.comm.process_group().is_coordinator()
    }
}

impl std::fmt::Debug for ExpertParallelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertParallelContext")
            .field("ep_rank", &self.ep_rank())
            .field("ep_size", &self.ep_size())
            .finish()
    }
}
