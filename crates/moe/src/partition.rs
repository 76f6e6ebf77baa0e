//! Expert placement across the expert-parallel group.
//!
//! With expert parallelism each rank stores only `num_experts / ep_size`
//! experts. Routing works in global expert ids, weight storage and the
//! grouped forward work in local slots; this module owns the translation
//! between the two.
//!
//! Two placements are supported:
//!
//! - `Blocked`: rank i holds the contiguous range `[i*n/ep, (i+1)*n/ep)`.
//! - `Strided`: rank i holds `{i, i+ep, i+2*ep, ...}`.

use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};

/// How experts are assigned to expert-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Contiguous block of expert ids per rank.
    #[default]
    Blocked,
    /// Round-robin striping of expert ids across ranks.
    Strided,
}

/// Mapping between global expert ids and the local shard of one rank.
#[derive(Debug, Clone)]
pub struct ExpertPartition {
    /// Global ids held by this rank, indexed by local slot.
    owned: Vec<usize>,
    /// Global id -> local slot, `None` when the expert lives elsewhere.
    slots: Vec<Option<usize>>,
    num_experts: usize,
    ep_size: usize,
    ep_rank: usize,
    placement: Placement,
}

impl ExpertPartition {
    /// Build the partition for one rank of the expert-parallel group.
    pub fn new(
        num_experts: usize,
        ep_size: usize,
        ep_rank: usize,
        placement: Placement,
    ) -> Result<Self> {
        if num_experts == 0 || ep_size == 0 {
            return Err(MoeError::InvalidConfig(
                "num_experts and ep_size must be > 0".to_string(),
            ));
        }
        if ep_rank >= ep_size {
            return Err(MoeError::InvalidRank {
                rank: ep_rank,
                world_size: ep_size,
            });
        }
        if num_experts % ep_size != 0 {
            return Err(MoeError::UnevenExpertSplit {
                num_experts,
                ep_size,
            });
        }

        let per_rank = num_experts / ep_size;
        let mut owned = Vec::with_capacity(per_rank);
        let mut slots = vec![None; num_experts];
        for slot in 0..per_rank {
            let global = match placement {
                Placement::Blocked => ep_rank * per_rank + slot,
                Placement::Strided => ep_rank + slot * ep_size,
            };
            owned.push(global);
            slots[global] = Some(slot);
        }

        Ok(Self {
            owned,
            slots,
            num_experts,
            ep_size,
            ep_rank,
            placement,
        })
    }

    /// Partition where a single rank holds every expert.
    pub fn replicated(num_experts: usize) -> Result<Self> {
        Self::new(num_experts, 1, 0, Placement::Blocked)
    }

    /// Rank that stores a global expert id.
    #[inline]
    pub fn owner_of(&self, global_id: usize) -> usize {
        debug_assert!(global_id < self.num_experts);
        match self.placement {
            Placement::Blocked => global_id / self.local_count(),
            Placement::Strided => global_id % self.ep_size,
        }
    }

    /// Slot a global expert id occupies on whichever rank owns it.
    #[inline]
    pub fn owner_slot(&self, global_id: usize) -> usize {
        debug_assert!(global_id < self.num_experts);
        match self.placement {
            Placement::Blocked => global_id % self.local_count(),
            Placement::Strided => global_id / self.ep_size,
        }
    }

    /// Local slot of a global expert id on this rank, if stored here.
    #[inline]
    pub fn local_slot(&self, global_id: usize) -> Option<usize> {
        self.slots.get(global_id).copied().flatten()
    }

    /// Global id stored in the given local slot.
    ///
    /// # Panics
    /// Panics if `slot >= local_count()`.
    #[inline]
    pub fn global_id(&self, slot: usize) -> usize {
        self.owned[slot]
    }

    /// Whether this rank stores the given global expert id.
    #[inline]
    pub fn is_local(&self, global_id: usize) -> bool {
        self.local_slot(global_id).is_some()
    }

    /// Number of experts stored on this rank.
    #[inline]
    pub fn local_count(&self) -> usize {
        self.owned.len()
    }

    /// Total number of experts across the group.
    #[inline]
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    #[inline]
    pub fn ep_size(&self) -> usize {
        self.ep_size
    }

    #[inline]
    pub fn ep_rank(&self) -> usize {
        self.ep_rank
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Global ids held by this rank, in slot order.
    pub fn owned_global_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.owned.iter().copied()
    }
}
