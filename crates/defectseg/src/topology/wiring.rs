//! Declarative routing of layer-table entries into the encoder/decoder graph.
//!
//! The wiring names every connection explicitly: which layers form each
//! bottleneck block, which blocks carry a projection shortcut, and which
//! retained encoder output each decoder step concatenates. [`Topology::build_plan`]
//! turns it into an [`ExecutionPlan`].

use serde::Serialize;

use super::layers::{LayerId, LayerSpec, WeightBinding, REFERENCE_LAYERS};
use super::plan::{BlockPart, DecoderPart, ExecutionPlan, HeadPart, NodeKey, Op, PlanBuilder};
use super::TopologyError;
use crate::image::Shape;

/// Max-pool window after the stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSpec {
    pub window: usize,
    pub stride: usize,
    pub padding: usize,
}

impl PoolSpec {
    pub fn output_extent(&self, input: usize) -> Option<usize> {
        let padded = input + 2 * self.padding;
        if padded < self.window || self.stride == 0 {
            return None;
        }
        Some((padded - self.window) / self.stride + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StemWiring {
    pub conv: LayerId,
    pub pool: PoolSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shortcut {
    /// Block input is added unchanged.
    Identity,
    /// Block input passes through this 1x1 convolution before the add.
    Projection(LayerId),
}

/// One bottleneck: `relu(expand(spatial(reduce(x))) + shortcut(x))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockWiring {
    pub reduce: LayerId,
    pub spatial: LayerId,
    pub expand: LayerId,
    pub shortcut: Shortcut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageWiring {
    pub name: &'static str,
    pub blocks: &'static [BlockWiring],
}

/// Encoder result retained for a decoder concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipSource {
    /// Stem convolution output, before pooling.
    Stem,
    /// Final output of residual stage `n` (0-based).
    Stage(usize),
}

impl SkipSource {
    /// Position in encoder production order (stem first).
    fn production_rank(self) -> usize {
        match self {
            Self::Stem => 0,
            Self::Stage(n) => n + 1,
        }
    }
}

/// Upsample the running result, concatenate `skip`, convolve with `conv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecoderStep {
    pub upsample: usize,
    pub skip: SkipSource,
    pub conv: LayerId,
}

/// Final upsample, refinement convolution, logits convolution, sigmoid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeadWiring {
    pub upsample: usize,
    pub refine: LayerId,
    pub logits: LayerId,
}

/// Complete description of the network: layer table plus routing.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Topology {
    pub name: &'static str,
    pub input: Shape,
    pub output: Shape,
    pub layers: &'static [LayerSpec],
    pub stem: StemWiring,
    pub stages: &'static [StageWiring],
    pub decoder: &'static [DecoderStep],
    pub head: HeadWiring,
}

const fn projecting(reduce: usize, spatial: usize, projection: usize, expand: usize) -> BlockWiring {
    BlockWiring {
        reduce: LayerId(reduce),
        spatial: LayerId(spatial),
        expand: LayerId(expand),
        shortcut: Shortcut::Projection(LayerId(projection)),
    }
}

const fn identity(reduce: usize, spatial: usize, expand: usize) -> BlockWiring {
    BlockWiring {
        reduce: LayerId(reduce),
        spatial: LayerId(spatial),
        expand: LayerId(expand),
        shortcut: Shortcut::Identity,
    }
}

static CONV2_BLOCKS: [BlockWiring; 3] = [
    projecting(1, 2, 3, 4),
    identity(5, 6, 7),
    identity(8, 9, 10),
];

static CONV3_BLOCKS: [BlockWiring; 4] = [
    projecting(11, 12, 13, 14),
    identity(15, 16, 17),
    identity(18, 19, 20),
    identity(21, 22, 23),
];

static CONV4_BLOCKS: [BlockWiring; 6] = [
    projecting(24, 25, 26, 27),
    identity(28, 29, 30),
    identity(31, 32, 33),
    identity(34, 35, 36),
    identity(37, 38, 39),
    identity(40, 41, 42),
];

static CONV5_BLOCKS: [BlockWiring; 3] = [
    projecting(43, 44, 45, 46),
    identity(47, 48, 49),
    identity(50, 51, 52),
];

static REFERENCE_STAGES: [StageWiring; 4] = [
    StageWiring {
        name: "conv2",
        blocks: &CONV2_BLOCKS,
    },
    StageWiring {
        name: "conv3",
        blocks: &CONV3_BLOCKS,
    },
    StageWiring {
        name: "conv4",
        blocks: &CONV4_BLOCKS,
    },
    StageWiring {
        name: "conv5",
        blocks: &CONV5_BLOCKS,
    },
];

static REFERENCE_DECODER: [DecoderStep; 4] = [
    DecoderStep {
        upsample: 2,
        skip: SkipSource::Stage(2),
        conv: LayerId(53),
    },
    DecoderStep {
        upsample: 2,
        skip: SkipSource::Stage(1),
        conv: LayerId(54),
    },
    DecoderStep {
        upsample: 2,
        skip: SkipSource::Stage(0),
        conv: LayerId(55),
    },
    DecoderStep {
        upsample: 2,
        skip: SkipSource::Stem,
        conv: LayerId(56),
    },
];

static REFERENCE_TOPOLOGY: Topology = Topology {
    name: "resnet50-unet",
    input: Shape::new(224, 224, 3),
    output: Shape::new(224, 224, 1),
    layers: &REFERENCE_LAYERS,
    stem: StemWiring {
        conv: LayerId(0),
        pool: PoolSpec {
            window: 3,
            stride: 2,
            padding: 1,
        },
    },
    stages: &REFERENCE_STAGES,
    decoder: &REFERENCE_DECODER,
    head: HeadWiring {
        upsample: 2,
        refine: LayerId(57),
        logits: LayerId(58),
    },
};

impl Topology {
    /// The trained ResNet50-UNet defect segmentation network.
    pub fn reference() -> &'static Topology {
        &REFERENCE_TOPOLOGY
    }

    pub fn layer(&self, id: LayerId) -> Result<&LayerSpec, TopologyError> {
        self.layers
            .get(id.0)
            .ok_or(TopologyError::UnknownLayer { layer: id })
    }

    /// Check the layer table and the routing against each other.
    pub fn validate(&self) -> Result<(), TopologyError> {
        self.validate_layer_table()?;
        self.validate_wiring()
    }

    fn validate_layer_table(&self) -> Result<(), TopologyError> {
        for (i, spec) in self.layers.iter().enumerate() {
            let layer = LayerId(i);
            if spec.kernel == 0 {
                return Err(TopologyError::InvalidLayer {
                    layer,
                    reason: "kernel must be at least 1",
                });
            }
            if spec.stride == 0 {
                return Err(TopologyError::InvalidLayer {
                    layer,
                    reason: "stride must be at least 1",
                });
            }
            let prev = i.checked_sub(1).map(|p| self.layers[p].binding);
            let next = self.layers.get(i + 1).map(|n| n.binding);
            match spec.binding {
                WeightBinding::SuppliedByPrevious if prev != Some(WeightBinding::DualOutput) => {
                    return Err(TopologyError::OrphanSuppliedWeights { layer });
                }
                WeightBinding::DualOutput if next != Some(WeightBinding::SuppliedByPrevious) => {
                    return Err(TopologyError::UnpairedDualOutput { layer });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_wiring(&self) -> Result<(), TopologyError> {
        let mut uses = vec![0usize; self.layers.len()];
        let mut mark = |id: LayerId| -> Result<(), TopologyError> {
            let slot = uses
                .get_mut(id.0)
                .ok_or(TopologyError::UnknownLayer { layer: id })?;
            *slot += 1;
            Ok(())
        };

        mark(self.stem.conv)?;
        if self.stages.is_empty() {
            return Err(TopologyError::InvalidWiring {
                reason: "encoder has no residual stages".into(),
            });
        }
        for (s, stage) in self.stages.iter().enumerate() {
            if stage.blocks.is_empty() {
                return Err(TopologyError::InvalidWiring {
                    reason: format!("stage {} has no blocks", stage.name),
                });
            }
            for (b, block) in stage.blocks.iter().enumerate() {
                mark(block.reduce)?;
                mark(block.spatial)?;
                mark(block.expand)?;
                match (b, block.shortcut) {
                    (0, Shortcut::Projection(p)) => {
                        mark(p)?;
                        self.check_projection_pairing(s, p, block.expand)?;
                    }
                    (0, Shortcut::Identity) => {
                        return Err(TopologyError::InvalidWiring {
                            reason: format!(
                                "first block of stage {} needs a projection shortcut",
                                stage.name
                            ),
                        });
                    }
                    (_, Shortcut::Projection(_)) => {
                        return Err(TopologyError::InvalidWiring {
                            reason: format!(
                                "block {} of stage {} must use an identity shortcut",
                                b + 1,
                                stage.name
                            ),
                        });
                    }
                    (_, Shortcut::Identity) => {}
                }
            }
        }

        self.validate_decoder()?;
        for step in self.decoder {
            mark(step.conv)?;
        }
        mark(self.head.refine)?;
        mark(self.head.logits)?;
        if self.head.upsample == 0 {
            return Err(TopologyError::InvalidWiring {
                reason: "head upsample factor must be at least 1".into(),
            });
        }

        for (i, &count) in uses.iter().enumerate() {
            if count != 1 {
                return Err(TopologyError::LayerUseCount {
                    layer: LayerId(i),
                    uses: count,
                });
            }
        }
        Ok(())
    }

    /// A projection fetches its own weights and the next entry's in one pass,
    /// so the next entry must be the same block's expansion.
    fn check_projection_pairing(
        &self,
        stage: usize,
        projection: LayerId,
        expand: LayerId,
    ) -> Result<(), TopologyError> {
        let spec = self.layer(projection)?;
        if spec.binding != WeightBinding::DualOutput {
            return Err(TopologyError::InvalidWiring {
                reason: format!("projection {projection} of stage {stage} is not dual-output"),
            });
        }
        if expand.0 != projection.0 + 1 {
            return Err(TopologyError::InvalidWiring {
                reason: format!(
                    "projection {projection} must be followed by its block's expansion, found {expand}"
                ),
            });
        }
        Ok(())
    }

    /// Skips must be distinct, exist, exclude the final stage and be
    /// consumed in reverse encoder order.
    fn validate_decoder(&self) -> Result<(), TopologyError> {
        let last_stage = self.stages.len() - 1;
        let mut prev_rank = usize::MAX;
        for step in self.decoder {
            if step.upsample == 0 {
                return Err(TopologyError::InvalidWiring {
                    reason: "decoder upsample factor must be at least 1".into(),
                });
            }
            if let SkipSource::Stage(n) = step.skip {
                if n >= last_stage {
                    return Err(TopologyError::InvalidWiring {
                        reason: format!("decoder cannot concatenate stage {n}, the bottleneck input"),
                    });
                }
            }
            let rank = step.skip.production_rank();
            if rank >= prev_rank {
                return Err(TopologyError::InvalidWiring {
                    reason: format!("decoder skip {:?} breaks reverse encoder order", step.skip),
                });
            }
            prev_rank = rank;
        }
        Ok(())
    }

    /// Route the validated wiring into a DAG.
    pub fn build_plan(&self) -> Result<ExecutionPlan, TopologyError> {
        self.validate()?;

        let retain: Vec<SkipSource> = self.decoder.iter().map(|d| d.skip).collect();
        let mut b = PlanBuilder::default();

        let input = b.push(NodeKey::Input, Op::Input)?;
        let stem = b.push(
            NodeKey::Stem,
            Op::Conv {
                layer: self.stem.conv,
                input,
            },
        )?;
        if retain.contains(&SkipSource::Stem) {
            b.retain(SkipSource::Stem, stem);
        }
        let mut running = b.push(
            NodeKey::StemPool,
            Op::MaxPool {
                input: stem,
                pool: self.stem.pool,
            },
        )?;

        for (s, stage) in self.stages.iter().enumerate() {
            for (k, block) in stage.blocks.iter().enumerate() {
                let key = |part| NodeKey::Block {
                    stage: s,
                    block: k,
                    part,
                };
                let reduce = b.push(
                    key(BlockPart::Reduce),
                    Op::Conv {
                        layer: block.reduce,
                        input: running,
                    },
                )?;
                let spatial = b.push(
                    key(BlockPart::Spatial),
                    Op::Conv {
                        layer: block.spatial,
                        input: reduce,
                    },
                )?;
                let shortcut = match block.shortcut {
                    Shortcut::Identity => running,
                    Shortcut::Projection(layer) => b.push(
                        key(BlockPart::Projection),
                        Op::Conv {
                            layer,
                            input: running,
                        },
                    )?,
                };
                let expand = b.push(
                    key(BlockPart::Expand),
                    Op::Conv {
                        layer: block.expand,
                        input: spatial,
                    },
                )?;
                let sum = b.push(
                    key(BlockPart::Sum),
                    Op::Add {
                        lhs: shortcut,
                        rhs: expand,
                    },
                )?;
                running = b.push(key(BlockPart::Output), Op::Relu { input: sum })?;
            }
            if retain.contains(&SkipSource::Stage(s)) {
                b.retain(SkipSource::Stage(s), running);
            }
        }

        for (i, step) in self.decoder.iter().enumerate() {
            let key = |part| NodeKey::Decoder { step: i, part };
            let up = b.push(
                key(DecoderPart::Upsample),
                Op::Upsample {
                    input: running,
                    factor: step.upsample,
                },
            )?;
            let skip = b.retained(step.skip)?;
            let cat = b.push(
                key(DecoderPart::Concat),
                Op::Concat {
                    first: up,
                    second: skip,
                },
            )?;
            running = b.push(
                key(DecoderPart::Conv),
                Op::Conv {
                    layer: step.conv,
                    input: cat,
                },
            )?;
        }

        let up = b.push(
            NodeKey::Head(HeadPart::Upsample),
            Op::Upsample {
                input: running,
                factor: self.head.upsample,
            },
        )?;
        let refine = b.push(
            NodeKey::Head(HeadPart::Refine),
            Op::Conv {
                layer: self.head.refine,
                input: up,
            },
        )?;
        let logits = b.push(
            NodeKey::Head(HeadPart::Logits),
            Op::Conv {
                layer: self.head.logits,
                input: refine,
            },
        )?;
        let output = b.push(NodeKey::Output, Op::Sigmoid { input: logits })?;

        let plan = b.finish(output);
        plan.validate(self)?;
        plan.infer_spatial(self)?;
        tracing::debug!(
            topology = self.name,
            nodes = plan.len(),
            skips = plan.retained().len(),
            "execution plan built"
        );
        Ok(plan)
    }
}
