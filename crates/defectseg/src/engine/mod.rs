//! Compute engines that execute an [`ExecutionPlan`].
//!
//! The core only depends on [`ComputeEngine`]; [`CpuEngine`] is the bundled
//! reference implementation (im2col + GEMM on a dedicated rayon pool).

mod cpu;
mod ops;

use serde::{Deserialize, Serialize};

pub use cpu::CpuEngine;

use crate::image::{ImageError, PixelBuffer, Shape};
use crate::topology::{ExecutionPlan, LayerId, NodeId, Topology, TopologyError};
use crate::weights::ModelWeights;

/// Engine settings, fixed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads; `None` uses rayon's default (one per core).
    pub threads: Option<usize>,
    /// Added to the moving variance before the square root.
    pub batch_norm_epsilon: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: None,
            batch_norm_epsilon: 0.0,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Input tensor does not match the network input contract.
    InputShape { expected: Shape, actual: Shape },
    /// Operands of an element-wise op or concatenation disagree.
    OperandShape {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },
    ChannelMismatch {
        layer: LayerId,
        expected: usize,
        actual: usize,
    },
    /// Convolution or pooling window larger than its padded input.
    DegenerateWindow { shape: Shape },
    MissingWeights { layer: LayerId },
    /// An operand was freed or never produced.
    MissingResult { node: NodeId },
    Topology(TopologyError),
    Buffer(ImageError),
    ThreadPool { message: String },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputShape { expected, actual } => {
                write!(f, "input tensor is {actual}, network expects {expected}")
            }
            Self::OperandShape { op, lhs, rhs } => {
                write!(f, "{op} operands disagree: {lhs} vs {rhs}")
            }
            Self::ChannelMismatch {
                layer,
                expected,
                actual,
            } => write!(
                f,
                "layer {layer} expects {expected} input channels, got {actual}"
            ),
            Self::DegenerateWindow { shape } => {
                write!(f, "window does not fit a {shape} input")
            }
            Self::MissingWeights { layer } => write!(f, "no weights bound for layer {layer}"),
            Self::MissingResult { node } => write!(f, "intermediate {node} is not available"),
            Self::Topology(e) => write!(f, "{e}"),
            Self::Buffer(e) => write!(f, "{e}"),
            Self::ThreadPool { message } => write!(f, "failed to build thread pool: {message}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Topology(e) => Some(e),
            Self::Buffer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TopologyError> for EngineError {
    fn from(e: TopologyError) -> Self {
        Self::Topology(e)
    }
}

impl From<ImageError> for EngineError {
    fn from(e: ImageError) -> Self {
        Self::Buffer(e)
    }
}

/// Executes a validated plan for one input tensor (batch size 1).
pub trait ComputeEngine: Send + Sync {
    /// Run every node of `plan` and return the output node's tensor.
    fn execute(
        &self,
        plan: &ExecutionPlan,
        topology: &Topology,
        weights: &ModelWeights,
        input: &PixelBuffer,
    ) -> Result<PixelBuffer, EngineError>;

    fn name(&self) -> &str;
}
