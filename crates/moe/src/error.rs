//! Error types for the mixture-of-experts layer.

use thiserror::Error;

/// Errors that can occur while building or running an MoE layer.
#[derive(Error, Debug)]
pub enum MoeError {
    /// Configuration rejected before any tensor work happened.
    #[error("invalid MoE config: {0}")]
    InvalidConfig(String),

    /// Experts cannot be split evenly across the expert-parallel group.
    #[error("num_experts ({num_experts}) must be divisible by expert-parallel size ({ep_size})")]
    UnevenExpertSplit { num_experts: usize, ep_size: usize },

    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Tensor shape mismatch at a module boundary.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MoeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sizes() {
        let err = MoeError::UnevenExpertSplit {
            num_experts: 7,
            ep_size: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn candle_error_converts() {
        fn fails() -> Result<candle_core::Tensor> {
            let t = candle_core::Tensor::zeros(
                (2, 2),
                candle_core::DType::F32,
                &candle_core::Device::Cpu,
            )?;
            // Rank-2 tensor has no dim 5.
            let _ = t.dim(5)?;
            Ok(t)
        }
        assert!(matches!(fails(), Err(MoeError::Tensor(_))));
    }
}
