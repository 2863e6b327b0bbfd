use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{ops, ComputeEngine, EngineConfig, EngineError};
use crate::image::PixelBuffer;
use crate::topology::{ExecutionPlan, NodeId, Op, Topology};
use crate::weights::ModelWeights;

/// Reference engine: runs every plan node on a dedicated rayon pool.
///
/// Intermediates live in an arena indexed by [`NodeId`] and are dropped after
/// their last consumer, so retained skips are the only long-lived tensors.
pub struct CpuEngine {
    pool: ThreadPool,
    epsilon: f32,
}

impl CpuEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("defectseg-{i}"));
        if let Some(n) = config.threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build().map_err(|e| EngineError::ThreadPool {
            message: e.to_string(),
        })?;
        tracing::info!(
            threads = pool.current_num_threads(),
            epsilon = config.batch_norm_epsilon,
            "cpu engine ready"
        );
        Ok(Self {
            pool,
            epsilon: config.batch_norm_epsilon,
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn run(
        &self,
        plan: &ExecutionPlan,
        topology: &Topology,
        weights: &ModelWeights,
        input: &PixelBuffer,
    ) -> Result<PixelBuffer, EngineError> {
        let last_use = plan.last_use();
        let mut arena: Vec<Option<PixelBuffer>> = (0..plan.len()).map(|_| None).collect();

        for (i, node) in plan.nodes().iter().enumerate() {
            let out = match node.op {
                Op::Input => input.clone(),
                Op::Conv { layer, input } => {
                    let spec = topology.layer(layer)?;
                    let w = weights
                        .layer(layer)
                        .ok_or(EngineError::MissingWeights { layer })?;
                    ops::conv2d(operand(&arena, input)?, layer, spec, w, self.epsilon)?
                }
                Op::MaxPool { input, pool } => ops::max_pool(operand(&arena, input)?, &pool)?,
                Op::Add { lhs, rhs } => ops::add(operand(&arena, lhs)?, operand(&arena, rhs)?)?,
                Op::Concat { first, second } => {
                    ops::concat(operand(&arena, first)?, operand(&arena, second)?)?
                }
                Op::Upsample { input, factor } => {
                    ops::upsample_nearest(operand(&arena, input)?, factor)
                }
                Op::Relu { input } => {
                    let mut b = owned_operand(&mut arena, &last_use, input, i)?;
                    ops::relu_in_place(&mut b);
                    b
                }
                Op::Sigmoid { input } => {
                    let mut b = owned_operand(&mut arena, &last_use, input, i)?;
                    ops::sigmoid_in_place(&mut b);
                    b
                }
            };
            tracing::debug!(node = %NodeId(i), key = ?node.key, shape = %out.shape(), "executed");

            for operand in node.op.operands() {
                if last_use[operand.0] == Some(i) {
                    arena[operand.0] = None;
                }
            }
            arena[i] = Some(out);
        }

        let output = plan.output();
        arena
            .get_mut(output.0)
            .and_then(Option::take)
            .ok_or(EngineError::MissingResult { node: output })
    }
}

impl ComputeEngine for CpuEngine {
    fn execute(
        &self,
        plan: &ExecutionPlan,
        topology: &Topology,
        weights: &ModelWeights,
        input: &PixelBuffer,
    ) -> Result<PixelBuffer, EngineError> {
        if input.shape() != topology.input {
            return Err(EngineError::InputShape {
                expected: topology.input,
                actual: input.shape(),
            });
        }
        self.pool.install(|| self.run(plan, topology, weights, input))
    }

    fn name(&self) -> &str {
        "cpu"
    }
}

fn operand(arena: &[Option<PixelBuffer>], id: NodeId) -> Result<&PixelBuffer, EngineError> {
    arena
        .get(id.0)
        .and_then(Option::as_ref)
        .ok_or(EngineError::MissingResult { node: id })
}

/// Move the operand out when `node` is its last reader, otherwise copy it.
fn owned_operand(
    arena: &mut [Option<PixelBuffer>],
    last_use: &[Option<usize>],
    id: NodeId,
    node: usize,
) -> Result<PixelBuffer, EngineError> {
    let slot = arena
        .get_mut(id.0)
        .ok_or(EngineError::MissingResult { node: id })?;
    let value = if last_use.get(id.0).copied().flatten() == Some(node) {
        slot.take()
    } else {
        slot.clone()
    };
    value.ok_or(EngineError::MissingResult { node: id })
}
