//! Named weight tensors and their binding to the layer table.
//!
//! A [`WeightSource`] answers lookups by tensor name. [`ModelWeights::bind`]
//! walks the topology's layer table once, honouring load-grouping: a
//! dual-output entry fetches its own tensors and the next entry's, and the
//! entry it supplies performs no lookup of its own.

mod gguf;

use std::collections::HashMap;
use std::path::PathBuf;

pub use gguf::{GgufFile, GgufWriter, TensorInfo};

use crate::topology::{LayerId, LayerSpec, Topology, WeightBinding};

#[derive(Debug)]
pub enum WeightError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Container bytes do not follow the expected layout.
    Malformed { reason: String },
    UnsupportedTensorType { name: String, ggml_type: u32 },
    /// A tensor the topology requires is absent from the container.
    MissingTensor { name: String },
    ShapeMismatch {
        name: String,
        expected: String,
        actual: [usize; 4],
    },
    /// Layer table left an entry without weights.
    UnboundLayer { layer: LayerId },
}

impl std::fmt::Display for WeightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read weights {}: {source}", path.display())
            }
            Self::Malformed { reason } => write!(f, "malformed weight container: {reason}"),
            Self::UnsupportedTensorType { name, ggml_type } => {
                write!(f, "tensor {name} has unsupported type {ggml_type}")
            }
            Self::MissingTensor { name } => {
                write!(f, "tensor {name} not found; model does not match the topology")
            }
            Self::ShapeMismatch {
                name,
                expected,
                actual,
            } => write!(f, "tensor {name} has shape {actual:?}, expected {expected}"),
            Self::UnboundLayer { layer } => write!(f, "layer {layer} has no weights"),
        }
    }
}

impl std::error::Error for WeightError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Dense `f32` tensor with dimensions in fastest-first order, padded to 4.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: [usize; 4],
    data: Vec<f32>,
}

impl Tensor {
    /// `dims` has at most 4 entries; missing trailing dimensions are 1.
    pub fn new(dims: &[usize], data: Vec<f32>) -> Result<Self, WeightError> {
        if dims.len() > 4 {
            return Err(WeightError::Malformed {
                reason: format!("tensor rank {} exceeds 4", dims.len()),
            });
        }
        let mut padded = [1usize; 4];
        padded[..dims.len()].copy_from_slice(dims);
        let expected = checked_element_count(&padded).ok_or_else(|| WeightError::Malformed {
            reason: format!("tensor dims {padded:?} overflow"),
        })?;
        if data.len() != expected {
            return Err(WeightError::Malformed {
                reason: format!(
                    "tensor of shape {padded:?} needs {expected} values, got {}",
                    data.len()
                ),
            });
        }
        Ok(Self { dims: padded, data })
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Lookup of named tensors, e.g. `conv1_conv/kernel:0`.
pub trait WeightSource {
    fn fetch(&self, name: &str) -> Result<Tensor, WeightError>;
}

/// Tensors held in a map; used for synthetic models.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWeights {
    tensors: HashMap<String, Tensor>,
}

impl InMemoryWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

impl WeightSource for InMemoryWeights {
    fn fetch(&self, name: &str) -> Result<Tensor, WeightError> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| WeightError::MissingTensor {
                name: name.to_string(),
            })
    }
}

/// Inference-mode batch-norm statistics, one entry per output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormParams {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub mean: Vec<f32>,
    pub variance: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    /// `[kw, kh, cin, cout]`.
    pub kernel: Tensor,
    pub bias: Vec<f32>,
    pub batch_norm: Option<BatchNormParams>,
}

impl LayerWeights {
    pub fn kernel_size(&self) -> usize {
        self.kernel.dims[0]
    }

    pub fn in_channels(&self) -> usize {
        self.kernel.dims[2]
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.dims[3]
    }

    fn parameter_count(&self) -> usize {
        let bn = self.batch_norm.as_ref().map_or(0, |bn| 4 * bn.gamma.len());
        self.kernel.len() + self.bias.len() + bn
    }
}

/// Weights for every layer of a topology, indexed by [`LayerId`].
#[derive(Debug, Clone)]
pub struct ModelWeights {
    layers: Vec<LayerWeights>,
}

impl ModelWeights {
    /// Resolve every layer's tensors from `source`.
    ///
    /// A missing tensor is fatal: the container does not match the topology.
    pub fn bind(topology: &Topology, source: &dyn WeightSource) -> Result<Self, WeightError> {
        let specs = topology.layers;
        let mut bound: Vec<Option<LayerWeights>> = vec![None; specs.len()];
        let mut lookups = 0usize;

        for (i, spec) in specs.iter().enumerate() {
            match spec.binding {
                WeightBinding::Standalone => {
                    bound[i] = Some(fetch_layer(spec, source)?);
                    lookups += 1;
                }
                WeightBinding::DualOutput => {
                    let next = specs.get(i + 1).ok_or(WeightError::UnboundLayer {
                        layer: LayerId(i + 1),
                    })?;
                    bound[i] = Some(fetch_layer(spec, source)?);
                    bound[i + 1] = Some(fetch_layer(next, source)?);
                    lookups += 1;
                }
                WeightBinding::SuppliedByPrevious => {
                    if bound[i].is_none() {
                        return Err(WeightError::UnboundLayer { layer: LayerId(i) });
                    }
                }
            }
        }

        let layers = bound
            .into_iter()
            .enumerate()
            .map(|(i, w)| w.ok_or(WeightError::UnboundLayer { layer: LayerId(i) }))
            .collect::<Result<Vec<_>, _>>()?;
        let weights = Self { layers };
        tracing::info!(
            topology = topology.name,
            layers = weights.layers.len(),
            lookups,
            parameters = weights.parameter_count(),
            "model weights bound"
        );
        Ok(weights)
    }

    pub fn layer(&self, id: LayerId) -> Option<&LayerWeights> {
        self.layers.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(LayerWeights::parameter_count).sum()
    }
}

fn fetch_layer(spec: &LayerSpec, source: &dyn WeightSource) -> Result<LayerWeights, WeightError> {
    let kernel_name = format!("{}/kernel:0", spec.conv);
    let kernel = source.fetch(&kernel_name)?;
    let [kw, kh, cin, cout] = kernel.dims();
    if kw != spec.kernel || kh != spec.kernel || cin == 0 || cout == 0 {
        return Err(WeightError::ShapeMismatch {
            name: kernel_name,
            expected: format!("[{k}, {k}, cin, cout]", k = spec.kernel),
            actual: kernel.dims(),
        });
    }

    let bias = channel_vector(source, &format!("{}/bias:0", spec.conv), cout)?;
    let batch_norm = match spec.bn {
        Some(bn) => Some(BatchNormParams {
            gamma: channel_vector(source, &format!("{bn}/gamma:0"), cout)?,
            beta: channel_vector(source, &format!("{bn}/beta:0"), cout)?,
            mean: channel_vector(source, &format!("{bn}/moving_mean:0"), cout)?,
            variance: channel_vector(source, &format!("{bn}/moving_variance:0"), cout)?,
        }),
        None => None,
    };
    tracing::trace!(layer = spec.conv, cin, cout, "bound layer");
    Ok(LayerWeights {
        kernel,
        bias,
        batch_norm,
    })
}

/// Product of `dims`, `None` on overflow.
pub(crate) fn checked_element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
}

/// Per-channel vector; any layout with exactly `channels` values is accepted.
fn channel_vector(
    source: &dyn WeightSource,
    name: &str,
    channels: usize,
) -> Result<Vec<f32>, WeightError> {
    let tensor = source.fetch(name)?;
    if tensor.len() != channels {
        return Err(WeightError::ShapeMismatch {
            name: name.to_string(),
            expected: format!("{channels} values"),
            actual: tensor.dims(),
        });
    }
    Ok(tensor.into_vec())
}
