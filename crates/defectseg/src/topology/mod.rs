//! Fixed network topology and the execution plan built from it.
//!
//! Three layers of description, each checkable without weights:
//!
//! - [`layers`]: the flat table of convolution-block parameters, in
//!   weight-binding order.
//! - [`wiring`]: declarative routing (stem, residual stages, decoder skips,
//!   head) referencing table entries by [`LayerId`].
//! - [`plan`]: the DAG of operations produced from the wiring, keyed by stable
//!   [`NodeKey`]s and validated structurally before any execution.

mod layers;
mod plan;
mod wiring;

pub use layers::{LayerId, LayerSpec, WeightBinding, REFERENCE_LAYERS, REFERENCE_LAYER_COUNT};
pub use plan::{
    BlockPart, DecoderPart, ExecutionPlan, HeadPart, NodeId, NodeKey, Op, PlanNode, RetainedSkip,
};
pub use wiring::{
    BlockWiring, DecoderStep, HeadWiring, PoolSpec, Shortcut, SkipSource, StageWiring, StemWiring,
    Topology,
};

/// Structural errors in the layer table, the wiring or a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A layer has a zero kernel or stride.
    InvalidLayer { layer: LayerId, reason: &'static str },
    /// A "supplied by previous" entry does not follow a dual-output entry.
    OrphanSuppliedWeights { layer: LayerId },
    /// A dual-output entry is not followed by a "supplied by previous" entry.
    UnpairedDualOutput { layer: LayerId },
    /// Wiring references a layer outside the table.
    UnknownLayer { layer: LayerId },
    /// Wiring or plan uses a layer other than exactly once.
    LayerUseCount { layer: LayerId, uses: usize },
    /// Wiring is inconsistent with the layer table.
    InvalidWiring { reason: String },
    /// An operand references a node that is not produced earlier.
    ForwardReference { node: NodeId, operand: NodeId },
    DuplicateKey { key: NodeKey },
    /// Plan does not start with exactly one input node.
    MissingInput,
    /// The designated output node does not exist.
    OutputOutOfRange { output: NodeId, len: usize },
    /// A retained skip is consumed by a number of concatenations other than one.
    SkipConsumption { node: NodeId, consumers: usize },
    /// A retained skip is the leading operand of a concatenation; skips
    /// always follow the decoder channels.
    SkipOperandOrder { node: NodeId, concat: NodeId },
    /// Retained skips are not consumed in reverse production order.
    SkipOrder { node: NodeId },
    /// Operands of an element-wise or concat op disagree spatially.
    SpatialMismatch {
        node: NodeId,
        lhs: (usize, usize),
        rhs: (usize, usize),
    },
    /// A convolution or pooling window does not fit its input.
    DegenerateSpatial { node: NodeId },
    /// Inferred output size differs from the network output contract.
    OutputShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLayer { layer, reason } => write!(f, "invalid layer {layer}: {reason}"),
            Self::OrphanSuppliedWeights { layer } => write!(
                f,
                "layer {layer} expects weights from a preceding dual-output entry, but none precedes it"
            ),
            Self::UnpairedDualOutput { layer } => write!(
                f,
                "dual-output layer {layer} is not followed by a weight-supplied entry"
            ),
            Self::UnknownLayer { layer } => write!(f, "wiring references unknown layer {layer}"),
            Self::LayerUseCount { layer, uses } => {
                write!(f, "layer {layer} is used {uses} times, expected exactly once")
            }
            Self::InvalidWiring { reason } => write!(f, "invalid wiring: {reason}"),
            Self::ForwardReference { node, operand } => {
                write!(f, "node {node} references {operand}, which is not produced before it")
            }
            Self::DuplicateKey { key } => write!(f, "duplicate plan node key {key:?}"),
            Self::MissingInput => write!(f, "plan must start with exactly one input node"),
            Self::OutputOutOfRange { output, len } => {
                write!(f, "output node {output} is outside a plan of {len} nodes")
            }
            Self::SkipConsumption { node, consumers } => write!(
                f,
                "retained skip {node} is consumed by {consumers} concatenations, expected 1"
            ),
            Self::SkipOperandOrder { node, concat } => write!(
                f,
                "retained skip {node} is the first operand of concatenation {concat}"
            ),
            Self::SkipOrder { node } => {
                write!(f, "retained skip {node} is consumed out of reverse encoder order")
            }
            Self::SpatialMismatch { node, lhs, rhs } => write!(
                f,
                "node {node} combines {}x{} with {}x{}",
                lhs.0, lhs.1, rhs.0, rhs.1
            ),
            Self::DegenerateSpatial { node } => {
                write!(f, "node {node} has a window larger than its padded input")
            }
            Self::OutputShape { expected, actual } => write!(
                f,
                "plan output is {}x{}, network contract is {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
        }
    }
}

impl std::error::Error for TopologyError {}
