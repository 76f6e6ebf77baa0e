//! Collective communication for token dispatch.
//!
//! Expert parallelism needs exactly two collectives: a fixed-size
//! `all_to_all` for exchanging per-rank counts and a variable-size
//! `all_to_all_v` for exchanging token rows. The trait keeps the layer
//! transport-agnostic; [`LoopbackCommunicator`] covers the single-process
//! case (every collective is identity) and lets multi-rank control flow be
//! unit tested without real transport.

use candle_core::Tensor;

use crate::distributed::process_group::ProcessGroup;
use crate::error::{MoeError, Result};

/// Rank-to-rank exchange primitives over one process group.
pub trait Communicator: Send + Sync {
    /// The group this communicator operates in.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Fixed-size all-to-all.
    ///
    /// The input is split into `world_size` equal chunks along dim 0;
    /// chunk i goes to rank i and chunk j of the output came from rank j.
    /// Identity when `world_size == 1`.
    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Variable-size all-to-all.
    ///
    /// `send_splits[i]` rows go to rank i; `recv_splits[j]` rows arrive
    /// from rank j. The output has `sum(recv_splits)` rows. Identity when
    /// `world_size == 1` (the two splits must then agree).
    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor>;
}

/// Communicator with no transport behind it.
///
/// For a single-member group every exchange returns its input. For a
/// simulated multi-rank group (tests) it preserves the shape contract of
/// the real collective so dispatch/combine control flow can be exercised,
/// without moving data between processes.
pub struct LoopbackCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> LoopbackCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup> Communicator for LoopbackCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        // One rank, or no partner to exchange with: identity either way.
        Ok(tensor.clone())
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor> {
        if self.process_group.is_single() {
            debug_assert_eq!(send_splits, recv_splits);
            return Ok(tensor.clone());
        }

        let total_send: usize = send_splits.iter().sum();
        let total_recv: usize = recv_splits.iter().sum();
        let dims = tensor.dims();
        if dims.is_empty() {
            return Err(MoeError::ShapeMismatch {
                expected: vec![total_send],
                actual: dims.to_vec(),
            });
        }
        if dims[0] != total_send {
            return Err(MoeError::ShapeMismatch {
                expected: vec![total_send],
                actual: dims.to_vec(),
            });
        }

        if total_recv == total_send {
            return Ok(tensor.clone());
        }

        // Shape-only simulation: truncate or zero-pad along dim 0 so the
        // caller sees the size the real exchange would produce.
        if total_recv < total_send {
            return Ok(tensor.narrow(0, 0, total_recv)?);
        }
        let mut out_dims = dims.to_vec();
        out_dims[0] = total_recv;
        let out = Tensor::zeros(out_dims.as_slice(), tensor.dtype(), tensor.device())?;
        if total_send == 0 {
            return Ok(out);
        }
        let idx = Tensor::from_vec(
            (0..total_send as u32).collect::<Vec<u32>>(),
            total_send,
            tensor.device(),
        )?;
        Ok(out.index_add(&idx, tensor, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::process_group::LocalProcessGroup;
    use candle_core::{DType, Device};

    fn ones(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn all_to_all_single_is_identity() {
        let comm = LoopbackCommunicator::new(LocalProcessGroup::new());
        let input = ones(&[4, 3]);
        let out = comm.all_to_all(&input).unwrap();
        assert_eq!(out.dims(), input.dims());
    }

    #[test]
    fn all_to_all_v_single_is_identity() {
        let comm = LoopbackCommunicator::new(LocalProcessGroup::new());
        let input = ones(&[5, 3]);
        let out = comm.all_to_all_v(&input, &[5], &[5]).unwrap();
        assert_eq!(out.dims(), input.dims());
    }

    #[test]
    fn all_to_all_v_balanced_multi_rank() {
        let pg = LocalProcessGroup::with_rank(0, 4).unwrap();
        let comm = LoopbackCommunicator::new(pg);
        let input = ones(&[10, 3]);
        let out = comm
            .all_to_all_v(&input, &[2, 3, 2, 3], &[1, 4, 2, 3])
            .unwrap();
        assert_eq!(out.dims(), &[10, 3]);
    }

    #[test]
    fn all_to_all_v_grows_output() {
        let pg = LocalProcessGroup::with_rank(1, 2).unwrap();
        let comm = LoopbackCommunicator::new(pg);
        let input = ones(&[6, 4]);
        let out = comm.all_to_all_v(&input, &[2, 4], &[3, 5]).unwrap();
        assert_eq!(out.dims(), &[8, 4]);
    }

    #[test]
    fn all_to_all_v_shrinks_output() {
        let pg = LocalProcessGroup::with_rank(0, 2).unwrap();
        let comm = LoopbackCommunicator::new(pg);
        let input = ones(&[6, 4]);
        let out = comm.all_to_all_v(&input, &[3, 3], &[2, 2]).unwrap();
        assert_eq!(out.dims(), &[4, 4]);
    }

    #[test]
    fn all_to_all_v_checks_send_total() {
        let pg = LocalProcessGroup::with_rank(0, 2).unwrap();
        let comm = LoopbackCommunicator::new(pg);
        let input = ones(&[5, 4]);
        let err = comm.all_to_all_v(&input, &[3, 3], &[3, 3]).unwrap_err();
        assert!(matches!(err, MoeError::ShapeMismatch { .. }));
    }

    #[test]
    fn all_to_all_v_empty_send() {
        let pg = LocalProcessGroup::with_rank(0, 2).unwrap();
        let comm = LoopbackCommunicator::new(pg);
        let input = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        let out = comm.all_to_all_v(&input, &[0, 0], &[1, 1]).unwrap();
        assert_eq!(out.dims(), &[2, 4]);
    }
}
