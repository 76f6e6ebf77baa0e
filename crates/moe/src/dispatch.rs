//! Capacity-constrained token dispatch and combine.
//!
//! Dispatch walks the gate's `(token, k)` assignments in token order,
//! drops whatever exceeds the per-expert capacity, and ships the survivors
//! to the ranks owning their experts: one fixed-size `all_to_all` to agree
//! on counts, then an `all_to_all_v` for the token rows themselves.
//! Combine reverses the exchange, applies the gate weights at the source
//! rank, and accumulates the `top_k` partial results per token back into
//! original order. Dropped assignments simply contribute nothing, so a
//! fully dropped token produces a zero row.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::distributed::Communicator;
use crate::error::Result;
use crate::gate::GateOutput;
use crate::partition::ExpertPartition;

/// Everything combine needs to undo a dispatch.
#[derive(Debug)]
pub struct DispatchPlan {
    /// Token rows received for local processing, `[n_recv, model_dim]`.
    pub recv_tokens: Tensor,
    /// Local expert slot per received row, `[n_recv]` u32.
    pub recv_slots: Tensor,
    /// Rows sent to each rank.
    pub send_counts: Vec<usize>,
    /// Rows received from each rank.
    pub recv_counts: Vec<usize>,
    /// Gate weight per sent row, send order. Applied during combine, so
    /// weights never cross ranks.
    send_weights: Vec<f32>,
    /// Original token row per sent entry, send order.
    origin_rows: Vec<u32>,
    /// Assignments dropped for exceeding expert capacity.
    pub dropped: usize,
    /// The capacity that was enforced.
    pub capacity: usize,
    num_tokens: usize,
    model_dim: usize,
    dtype: DType,
    device: Device,
}

/// Moves tokens to expert-owning ranks and back.
pub struct Dispatcher {
    partition: ExpertPartition,
    comm: Arc<dyn Communicator>,
}

impl Dispatcher {
    pub fn new(partition: ExpertPartition, comm: Arc<dyn Communicator>) -> Self {
        Self { partition, comm }
    }

    pub fn partition(&self) -> &ExpertPartition {
        &self.partition
    }

    /// Route a flat batch to the ranks owning its selected experts.
    ///
    /// `hidden_states` is `[num_tokens, model_dim]`; the routing decision
    /// comes from [`GateOutput`]. Assignments past `gate.capacity` for
    /// their expert are dropped in token order, matching capacity-based
    /// gating.
    pub fn dispatch(&self, hidden_states: &Tensor, gate: &GateOutput) -> Result<DispatchPlan> {
        let (num_tokens, model_dim) = hidden_states.dims2()?;
        let device = hidden_states.device().clone();
        let dtype = hidden_states.dtype();
        let ep_size = self.partition.ep_size();
        let top_k = if num_tokens == 0 {
            0
        } else {
            gate.experts.dims2()?.1
        };

        let expert_ids: Vec<u32> = gate.experts.flatten_all()?.to_vec1()?;
        let gate_weights: Vec<f32> = gate
            .weights
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1()?;

        // Capacity pass: keep at most `capacity` assignments per expert,
        // earliest tokens first, and bucket survivors by owner rank.
        let mut fill = vec![0usize; self.partition.num_experts()];
        let mut buckets: Vec<Vec<(u32, u32, f32)>> = vec![Vec::new(); ep_size];
        let mut dropped = 0usize;

        for token in 0..num_tokens {
            for k in 0..top_k {
                let flat = token * top_k + k;
                let expert = expert_ids[flat] as usize;
                if fill[expert] >= gate.capacity {
                    dropped += 1;
                    continue;
                }
                fill[expert] += 1;
                let owner = self.partition.owner_of(expert);
                let slot = self.partition.owner_slot(expert) as u32;
                buckets[owner].push((token as u32, slot, gate_weights[flat]));
            }
        }

        if dropped > 0 {
            debug!(dropped, capacity = gate.capacity, "assignments over expert capacity");
        }

        let send_counts: Vec<usize> = buckets.iter().map(Vec::len).collect();
        let total_send: usize = send_counts.iter().sum();

        let mut origin_rows = Vec::with_capacity(total_send);
        let mut send_weights = Vec::with_capacity(total_send);
        let mut send_slots = Vec::with_capacity(total_send);
        for bucket in &buckets {
            for &(row, slot, weight) in bucket {
                origin_rows.push(row);
                send_weights.push(weight);
                send_slots.push(slot);
            }
        }

        let send_tokens = gather_rows(hidden_states, &origin_rows)?;

        let (recv_counts, recv_tokens, recv_slots) = if ep_size == 1 {
            // Loopback: what we would send is what we receive.
            let slots = Tensor::from_vec(send_slots, total_send, &device)?;
            (send_counts.clone(), send_tokens, slots)
        } else {
            let recv_counts = self.exchange_counts(&send_counts, &device)?;
            let recv_tokens =
                self.comm
                    .all_to_all_v(&send_tokens, &send_counts, &recv_counts)?;
            let slots = Tensor::from_vec(send_slots, total_send, &device)?;
            let recv_slots = self.comm.all_to_all_v(&slots, &send_counts, &recv_counts)?;
            (recv_counts, recv_tokens, recv_slots)
        };

        Ok(DispatchPlan {
            recv_tokens,
            recv_slots,
            send_counts,
            recv_counts,
            send_weights,
            origin_rows,
            dropped,
            capacity: gate.capacity,
            num_tokens,
            model_dim,
            dtype,
            device,
        })
    }

    /// Return expert outputs to their source ranks and reduce per token.
    ///
    /// `expert_output` is `[n_recv, model_dim]` in received-row order. The
    /// result is `[num_tokens, model_dim]`: each token is the gate-weighted
    /// sum of its surviving expert outputs.
    pub fn combine(&self, expert_output: &Tensor, plan: &DispatchPlan) -> Result<Tensor> {
        let returned = if self.partition.ep_size() == 1 {
            expert_output.clone()
        } else {
            self.comm
                .all_to_all_v(expert_output, &plan.recv_counts, &plan.send_counts)?
        };

        let output = Tensor::zeros((plan.num_tokens, plan.model_dim), plan.dtype, &plan.device)?;
        let n_send = plan.origin_rows.len();
        if n_send == 0 {
            return Ok(output);
        }

        let weights = Tensor::from_vec(plan.send_weights.clone(), (n_send, 1), &plan.device)?
            .to_dtype(plan.dtype)?;
        let weighted = returned.broadcast_mul(&weights)?;

        let rows = Tensor::from_vec(plan.origin_rows.clone(), n_send, &plan.device)?;
        Ok(output.index_add(&rows, &weighted, 0)?)
    }

    /// Tell every rank how many rows to expect from us.
    fn exchange_counts(&self, send_counts: &[usize], device: &Device) -> Result<Vec<usize>> {
        let counts = Tensor::from_vec(
            send_counts.iter().map(|&c| c as u32).collect::<Vec<_>>(),
            send_counts.len(),
            device,
        )?;
        let received = self.comm.all_to_all(&counts)?;
        let received: Vec<u32> = received.to_vec1()?;
        Ok(received.into_iter().map(|c| c as usize).collect())
    }
}

fn gather_rows(hidden_states: &Tensor, rows: &[u32]) -> Result<Tensor> {
    if rows.is_empty() {
        let (_, model_dim) = hidden_states.dims2()?;
        return Ok(Tensor::zeros(
            (0, model_dim),
            hidden_states.dtype(),
            hidden_states.device(),
        )?);
    }
    let idx = Tensor::from_vec(rows.to_vec(), rows.len(), hidden_states.device())?;
    Ok(hidden_states.index_select(&idx, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ExpertParallelContext, LocalProcessGroup, LoopbackCommunicator};
    use crate::partition::Placement;
    use candle_core::Device;

    fn loopback(rank: usize, world_size: usize) -> Arc<dyn Communicator> {
        let pg = LocalProcessGroup::with_rank(rank, world_size).unwrap();
        Arc::new(LoopbackCommunicator::new(pg))
    }

    fn gate_output(experts: Tensor, weights: Tensor, capacity: usize) -> GateOutput {
        let device = Device::Cpu;
        GateOutput {
            weights,
            experts,
            aux_loss: Tensor::zeros((), DType::F32, &device).unwrap(),
            capacity,
            expert_counts: Vec::new(),
        }
    }

    #[test]
    fn single_rank_round_trip_is_identity() {
        // Identity experts with renormalized weights: combine(dispatch(x))
        // must reproduce x exactly.
        let device = Device::Cpu;
        let partition = ExpertPartition::replicated(2).unwrap();
        let dispatcher = Dispatcher::new(partition, loopback(0, 1));

        let hidden = Tensor::from_vec(
            vec![1f32, 2.0, 3.0, 4.0, 5.0, 6.0],
            (3, 2),
            &device,
        )
        .unwrap();
        let experts = Tensor::from_vec(vec![0u32, 1, 1, 0, 0, 1], (3, 2), &device).unwrap();
        let weights =
            Tensor::from_vec(vec![0.5f32, 0.5, 0.25, 0.75, 0.9, 0.1], (3, 2), &device).unwrap();
        let gate = gate_output(experts, weights, 16);

        let plan = dispatcher.dispatch(&hidden, &gate).unwrap();
        assert_eq!(plan.dropped, 0);
        assert_eq!(plan.recv_tokens.dims(), &[6, 2]);

        let out = dispatcher
            .combine(&plan.recv_tokens.clone(), &plan)
            .unwrap();
        let got: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = hidden.flatten_all().unwrap().to_vec1().unwrap();
        for (g, w) in got.iter().zip(&want) {
            assert!((g - w).abs() < 1e-5);
        }
    }

    #[test]
    fn capacity_drops_in_token_order() {
        let device = Device::Cpu;
        let partition = ExpertPartition::replicated(2).unwrap();
        let dispatcher = Dispatcher::new(partition, loopback(0, 1));

        // Four tokens all picking expert 0 with capacity 2.
        let hidden = Tensor::randn(0f32, 1.0, (4, 2), &device).unwrap();
        let experts = Tensor::from_vec(vec![0u32, 0, 0, 0], (4, 1), &device).unwrap();
        let weights = Tensor::from_vec(vec![1f32, 1.0, 1.0, 1.0], (4, 1), &device).unwrap();
        let gate = gate_output(experts, weights, 2);

        let plan = dispatcher.dispatch(&hidden, &gate).unwrap();
        assert_eq!(plan.dropped, 2);
        assert_eq!(plan.recv_tokens.dims(), &[2, 2]);

        // Dropped tokens (the later ones) come back as zero rows.
        let out = dispatcher
            .combine(&plan.recv_tokens.clone(), &plan)
            .unwrap();
        let got: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = hidden.flatten_all().unwrap().to_vec1().unwrap();
        for i in 0..4 {
            assert!((got[i] - want[i]).abs() < 1e-5);
        }
        for v in &got[4..] {
            assert_eq!(*v, 0.0);
        }
    }

    #[test]
    fn weights_scale_combined_output() {
        let device = Device::Cpu;
        let partition = ExpertPartition::replicated(2).unwrap();
        let dispatcher = Dispatcher::new(partition, loopback(0, 1));

        let hidden = Tensor::from_vec(vec![2f32, 4.0], (1, 2), &device).unwrap();
        let experts = Tensor::from_vec(vec![0u32, 1], (1, 2), &device).unwrap();
        let weights = Tensor::from_vec(vec![0.25f32, 0.75], (1, 2), &device).unwrap();
        let gate = gate_output(experts, weights, 4);

        let plan = dispatcher.dispatch(&hidden, &gate).unwrap();
        // Expert output: double the input for both assignments.
        let doubled = plan.recv_tokens.affine(2.0, 0.0).unwrap();
        let out = dispatcher.combine(&doubled, &plan).unwrap();

        // 0.25 * 2x + 0.75 * 2x = 2x
        let got: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!((got[0] - 4.0).abs() < 1e-5);
        assert!((got[1] - 8.0).abs() < 1e-5);
    }

    #[test]
    fn slots_are_owner_local() {
        let device = Device::Cpu;
        let partition = ExpertPartition::new(4, 2, 0, Placement::Blocked).unwrap();
        let dispatcher = Dispatcher::new(partition, loopback(0, 2));

        let hidden = Tensor::randn(0f32, 1.0, (2, 2), &device).unwrap();
        // Token 0 -> expert 1 (rank 0 slot 1), token 1 -> expert 3 (rank 1
        // slot 1).
        let experts = Tensor::from_vec(vec![1u32, 3], (2, 1), &device).unwrap();
        let weights = Tensor::from_vec(vec![1f32, 1.0], (2, 1), &device).unwrap();
        let gate = gate_output(experts, weights, 4);

        let plan = dispatcher.dispatch(&hidden, &gate).unwrap();
        assert_eq!(plan.send_counts, vec![1, 1]);
        let slots: Vec<u32> = plan.recv_slots.to_vec1().unwrap();
        assert_eq!(slots, vec![1, 1]);
    }

    #[test]
    fn empty_batch() {
        let device = Device::Cpu;
        let partition = ExpertPartition::replicated(2).unwrap();
        let dispatcher = Dispatcher::new(partition, loopback(0, 1));

        let hidden = Tensor::zeros((0, 4), DType::F32, &device).unwrap();
        let experts = Tensor::zeros((0, 1), DType::U32, &device).unwrap();
        let weights = Tensor::zeros((0, 1), DType::F32, &device).unwrap();
        let gate = gate_output(experts, weights, 1);

        let plan = dispatcher.dispatch(&hidden, &gate).unwrap();
        assert_eq!(plan.recv_tokens.dims(), &[0, 4]);

        let out = dispatcher
            .combine(&plan.recv_tokens.clone(), &plan)
            .unwrap();
        assert_eq!(out.dims(), &[0, 4]);
    }

    #[test]
    fn multi_rank_flow_preserves_token_count() {
        let device = Device::Cpu;
        let partition = ExpertPartition::new(4, 2, 0, Placement::Blocked).unwrap();
        let ctx = ExpertParallelContext::new(loopback(0, 2));
        let dispatcher = Dispatcher::new(partition, ctx.communicator());

        let hidden = Tensor::randn(0f32, 1.0, (4, 4), &device).unwrap();
        let experts = Tensor::from_vec(vec![0u32, 2, 1, 3, 0, 2, 1, 3], (4, 2), &device).unwrap();
        let weights = Tensor::from_vec(
            vec![0.5f32, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5],
            (4, 2),
            &device,
        )
        .unwrap();
        let gate = gate_output(experts, weights, 8);

        let plan = dispatcher.dispatch(&hidden, &gate).unwrap();
        assert_eq!(plan.send_counts.iter().sum::<usize>(), 8);

        let out = dispatcher
            .combine(&plan.recv_tokens.clone(), &plan)
            .unwrap();
        assert_eq!(out.dims(), &[4, 4]);
    }
}
