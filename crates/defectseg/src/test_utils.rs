//! Shared fixtures for unit tests: synthetic images, weights and engines.

use crate::engine::{ComputeEngine, EngineError};
use crate::image::PixelBuffer;
use crate::topology::{ExecutionPlan, Topology};
use crate::weights::{InMemoryWeights, ModelWeights, Tensor};

/// Bias of the final logits layer in [`synthetic_weights`]; every other
/// tensor is zero or an identity batch-norm, so the network outputs
/// `sigmoid(SYNTHETIC_LOGIT_BIAS)` everywhere.
pub(crate) const SYNTHETIC_LOGIT_BIAS: f32 = 0.25;

/// Uniform 3-channel image.
pub(crate) fn gray_image(w: usize, h: usize, value: f32) -> PixelBuffer {
    PixelBuffer::filled(w, h, 3, value)
}

/// Weights satisfying `topology` with one output channel per layer.
///
/// The stem reads the image channels and decoder convolutions read the
/// upsampled result plus one skip channel.
pub(crate) fn synthetic_weights(topology: &Topology) -> InMemoryWeights {
    let mut source = InMemoryWeights::new();
    for (i, spec) in topology.layers.iter().enumerate() {
        let cin = if i == topology.stem.conv.0 {
            topology.input.channels
        } else if topology.decoder.iter().any(|d| d.conv.0 == i) {
            2
        } else {
            1
        };
        let k = spec.kernel;
        source.insert(
            format!("{}/kernel:0", spec.conv),
            Tensor::new(&[k, k, cin, 1], vec![0.0; k * k * cin]).unwrap(),
        );
        let bias = if i == topology.head.logits.0 {
            SYNTHETIC_LOGIT_BIAS
        } else {
            0.0
        };
        source.insert(
            format!("{}/bias:0", spec.conv),
            Tensor::new(&[1, 1, 1, 1], vec![bias]).unwrap(),
        );
        if let Some(bn) = spec.bn {
            for (suffix, value) in [
                ("gamma", 1.0),
                ("beta", 0.0),
                ("moving_mean", 0.0),
                ("moving_variance", 1.0),
            ] {
                source.insert(
                    format!("{bn}/{suffix}:0"),
                    Tensor::new(&[1], vec![value]).unwrap(),
                );
            }
        }
    }
    source
}

/// Stand-in engine: output is the per-pixel channel mean of the input scaled
/// from `[0, 255]` to `[0, 1]`, shaped like the network output.
pub(crate) struct PassthroughEngine;

impl ComputeEngine for PassthroughEngine {
    fn execute(
        &self,
        _plan: &ExecutionPlan,
        topology: &Topology,
        _weights: &ModelWeights,
        input: &PixelBuffer,
    ) -> Result<PixelBuffer, EngineError> {
        let (w, h) = topology.output.spatial();
        let mut out = PixelBuffer::new(w, h, 1);
        let channels = input.channels().max(1) as f32;
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0.0;
                for c in 0..input.channels() {
                    sum += input.get(x, y, c)?;
                }
                out.set(x, y, 0, (sum / channels / 255.0).clamp(0.0, 1.0))?;
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}
