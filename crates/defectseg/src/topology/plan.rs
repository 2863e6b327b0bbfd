//! Execution plan: an arena of operations in topological order.
//!
//! Every node carries a stable [`NodeKey`] (stage, block, part) so the plan can
//! be audited and validated without executing it. Operands are [`NodeId`]s into
//! the same arena and must always point backwards.

use std::collections::HashMap;

use serde::Serialize;

use super::layers::LayerId;
use super::wiring::{PoolSpec, SkipSource, Topology};
use super::TopologyError;

/// Position of a node in the plan arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPart {
    Reduce,
    Spatial,
    Projection,
    Expand,
    Sum,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderPart {
    Upsample,
    Concat,
    Conv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadPart {
    Upsample,
    Refine,
    Logits,
}

/// Stable identifier of an intermediate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKey {
    Input,
    Stem,
    StemPool,
    Block {
        stage: usize,
        block: usize,
        part: BlockPart,
    },
    Decoder {
        step: usize,
        part: DecoderPart,
    },
    Head(HeadPart),
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// The letterboxed network input.
    Input,
    /// Convolution, then batch-norm and ReLU as the layer specifies.
    Conv { layer: LayerId, input: NodeId },
    MaxPool { input: NodeId, pool: PoolSpec },
    Add { lhs: NodeId, rhs: NodeId },
    Relu { input: NodeId },
    /// Nearest-neighbour upsample by an integer factor.
    Upsample { input: NodeId, factor: usize },
    /// Channel concatenation, `first` channels first.
    Concat { first: NodeId, second: NodeId },
    Sigmoid { input: NodeId },
}

impl Op {
    pub fn operands(&self) -> impl Iterator<Item = NodeId> {
        let (a, b) = match *self {
            Op::Input => (None, None),
            Op::Conv { input, .. }
            | Op::MaxPool { input, .. }
            | Op::Relu { input }
            | Op::Upsample { input, .. }
            | Op::Sigmoid { input } => (Some(input), None),
            Op::Add { lhs, rhs } => (Some(lhs), Some(rhs)),
            Op::Concat { first, second } => (Some(first), Some(second)),
        };
        a.into_iter().chain(b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanNode {
    pub key: NodeKey,
    pub op: Op,
}

/// Encoder result held for a later decoder concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetainedSkip {
    pub source: SkipSource,
    pub node: NodeId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    nodes: Vec<PlanNode>,
    output: NodeId,
    /// In production order.
    retained: Vec<RetainedSkip>,
}

#[derive(Debug, Default)]
pub(crate) struct PlanBuilder {
    nodes: Vec<PlanNode>,
    keys: HashMap<NodeKey, NodeId>,
    retained: Vec<RetainedSkip>,
}

impl PlanBuilder {
    /// Append a node; operands must already exist and the key must be new.
    pub(crate) fn push(&mut self, key: NodeKey, op: Op) -> Result<NodeId, TopologyError> {
        let id = NodeId(self.nodes.len());
        if let Some(operand) = op.operands().find(|o| o.0 >= id.0) {
            return Err(TopologyError::ForwardReference { node: id, operand });
        }
        if self.keys.insert(key, id).is_some() {
            return Err(TopologyError::DuplicateKey { key });
        }
        self.nodes.push(PlanNode { key, op });
        Ok(id)
    }

    pub(crate) fn retain(&mut self, source: SkipSource, node: NodeId) {
        self.retained.push(RetainedSkip { source, node });
    }

    pub(crate) fn retained(&self, source: SkipSource) -> Result<NodeId, TopologyError> {
        self.retained
            .iter()
            .find(|r| r.source == source)
            .map(|r| r.node)
            .ok_or_else(|| TopologyError::InvalidWiring {
                reason: format!("skip {source:?} was not retained by the encoder"),
            })
    }

    pub(crate) fn finish(self, output: NodeId) -> ExecutionPlan {
        ExecutionPlan {
            nodes: self.nodes,
            output,
            retained: self.retained,
        }
    }
}

impl ExecutionPlan {
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn retained(&self) -> &[RetainedSkip] {
        &self.retained
    }

    pub fn node(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(id.0)
    }

    pub fn find(&self, key: NodeKey) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.key == key).map(NodeId)
    }

    /// Index of the last node reading each node; `None` for unread nodes.
    pub fn last_use(&self) -> Vec<Option<usize>> {
        let mut last = vec![None; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for operand in node.op.operands() {
                last[operand.0] = Some(i);
            }
        }
        last
    }

    /// Structural checks:
    /// - a single input node at position 0 and an in-range output;
    /// - operands only reference earlier nodes and keys are unique;
    /// - every layer of `topology` is convolved exactly once;
    /// - every retained skip is the second operand of exactly one concat,
    ///   never the first, and skips are consumed in reverse production order.
    pub fn validate(&self, topology: &Topology) -> Result<(), TopologyError> {
        let inputs = self
            .nodes
            .iter()
            .filter(|n| matches!(n.op, Op::Input))
            .count();
        if inputs != 1 || !matches!(self.nodes.first().map(|n| n.op), Some(Op::Input)) {
            return Err(TopologyError::MissingInput);
        }
        if self.output.0 >= self.nodes.len() {
            return Err(TopologyError::OutputOutOfRange {
                output: self.output,
                len: self.nodes.len(),
            });
        }

        let mut keys = HashMap::with_capacity(self.nodes.len());
        let mut layer_uses = vec![0usize; topology.layers.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let id = NodeId(i);
            if let Some(operand) = node.op.operands().find(|o| o.0 >= i) {
                return Err(TopologyError::ForwardReference { node: id, operand });
            }
            if keys.insert(node.key, id).is_some() {
                return Err(TopologyError::DuplicateKey { key: node.key });
            }
            if let Op::Conv { layer, .. } = node.op {
                let slot = layer_uses
                    .get_mut(layer.0)
                    .ok_or(TopologyError::UnknownLayer { layer })?;
                *slot += 1;
            }
        }
        for (i, &uses) in layer_uses.iter().enumerate() {
            if uses != 1 {
                return Err(TopologyError::LayerUseCount {
                    layer: LayerId(i),
                    uses,
                });
            }
        }

        let mut prev_consumer = usize::MAX;
        for skip in &self.retained {
            let as_first = self.nodes.iter().position(
                |n| matches!(n.op, Op::Concat { first, .. } if first == skip.node),
            );
            if let Some(concat) = as_first {
                return Err(TopologyError::SkipOperandOrder {
                    node: skip.node,
                    concat: NodeId(concat),
                });
            }
            let mut consumers = self.nodes.iter().enumerate().filter_map(|(i, n)| match n.op {
                Op::Concat { second, .. } if second == skip.node => Some(i),
                _ => None,
            });
            let first = consumers.next();
            let extra = consumers.count();
            let consumer = match (first, extra) {
                (Some(c), 0) => c,
                (None, _) => {
                    return Err(TopologyError::SkipConsumption {
                        node: skip.node,
                        consumers: 0,
                    })
                }
                (Some(_), n) => {
                    return Err(TopologyError::SkipConsumption {
                        node: skip.node,
                        consumers: n + 1,
                    })
                }
            };
            // Retained in production order, so consumers must run backwards.
            if consumer >= prev_consumer {
                return Err(TopologyError::SkipOrder { node: skip.node });
            }
            prev_consumer = consumer;
        }
        Ok(())
    }

    /// Spatial size `(width, height)` of every node for the topology's input,
    /// checking operand agreement and the output contract.
    pub fn infer_spatial(&self, topology: &Topology) -> Result<Vec<(usize, usize)>, TopologyError> {
        let mut sizes: Vec<(usize, usize)> = Vec::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            let id = NodeId(i);
            let at = |operand: NodeId| -> Result<(usize, usize), TopologyError> {
                sizes
                    .get(operand.0)
                    .copied()
                    .ok_or(TopologyError::ForwardReference { node: id, operand })
            };
            let size = match node.op {
                Op::Input => topology.input.spatial(),
                Op::Conv { layer, input } => {
                    let spec = topology.layer(layer)?;
                    let (w, h) = at(input)?;
                    match (spec.output_extent(w), spec.output_extent(h)) {
                        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                        _ => return Err(TopologyError::DegenerateSpatial { node: id }),
                    }
                }
                Op::MaxPool { input, pool } => {
                    let (w, h) = at(input)?;
                    match (pool.output_extent(w), pool.output_extent(h)) {
                        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                        _ => return Err(TopologyError::DegenerateSpatial { node: id }),
                    }
                }
                Op::Add { lhs, rhs } => same_size(id, at(lhs)?, at(rhs)?)?,
                Op::Concat { first, second } => same_size(id, at(first)?, at(second)?)?,
                Op::Relu { input } | Op::Sigmoid { input } => at(input)?,
                Op::Upsample { input, factor } => {
                    let (w, h) = at(input)?;
                    (w * factor, h * factor)
                }
            };
            sizes.push(size);
        }

        let expected = topology.output.spatial();
        let actual = sizes
            .get(self.output.0)
            .copied()
            .ok_or(TopologyError::OutputOutOfRange {
                output: self.output,
                len: self.nodes.len(),
            })?;
        if actual != expected {
            return Err(TopologyError::OutputShape { expected, actual });
        }
        Ok(sizes)
    }
}

fn same_size(
    node: NodeId,
    lhs: (usize, usize),
    rhs: (usize, usize),
) -> Result<(usize, usize), TopologyError> {
    if lhs != rhs {
        return Err(TopologyError::SpatialMismatch { node, lhs, rhs });
    }
    Ok(lhs)
}
