//! Convolution-block parameters for every layer of the network.
//!
//! [`REFERENCE_LAYERS`] is the 59-entry table of the trained ResNet50-UNet.
//! Order matters only for weight binding (a dual-output entry fetches the
//! entry that follows it); graph routing lives in the wiring table.

/// Index into a layer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct LayerId(pub usize);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// How a layer obtains its weight tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightBinding {
    /// Looks up its own tensors.
    Standalone,
    /// Projection shortcut: looks up its own tensors and those of the entry
    /// immediately after it in one pass.
    DualOutput,
    /// Tensors were fetched by the preceding dual-output entry; performs no
    /// lookup of its own.
    SuppliedByPrevious,
}

/// One convolution (+ optional batch-norm, + optional ReLU) block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LayerSpec {
    /// Tensor prefix of the convolution (`<conv>/kernel:0`, `<conv>/bias:0`).
    pub conv: &'static str,
    /// Tensor prefix of the batch-norm, `None` when the layer has none.
    pub bn: Option<&'static str>,
    /// Square kernel extent.
    pub kernel: usize,
    pub padding: usize,
    pub stride: usize,
    /// ReLU after (batch-normalized) convolution.
    pub activation: bool,
    pub binding: WeightBinding,
}

impl LayerSpec {
    pub fn batch_norm(&self) -> bool {
        self.bn.is_some()
    }

    /// Output extent of this layer for an input extent.
    ///
    /// Returns `None` when the padded input is smaller than the kernel.
    pub fn output_extent(&self, input: usize) -> Option<usize> {
        let padded = input + 2 * self.padding;
        if padded < self.kernel || self.stride == 0 {
            return None;
        }
        Some((padded - self.kernel) / self.stride + 1)
    }
}

const fn layer(
    conv: &'static str,
    bn: &'static str,
    kernel: usize,
    padding: usize,
    stride: usize,
    activation: bool,
    binding: WeightBinding,
) -> LayerSpec {
    LayerSpec {
        conv,
        bn: Some(bn),
        kernel,
        padding,
        stride,
        activation,
        binding,
    }
}

/// 1x1 channel reduction at the head of a bottleneck.
const fn reduce(conv: &'static str, bn: &'static str, stride: usize) -> LayerSpec {
    layer(conv, bn, 1, 0, stride, true, WeightBinding::Standalone)
}

/// 3x3 spatial convolution inside a bottleneck.
const fn spatial(conv: &'static str, bn: &'static str) -> LayerSpec {
    layer(conv, bn, 3, 1, 1, true, WeightBinding::Standalone)
}

/// 1x1 channel expansion; activation is applied after the residual add.
const fn expand(conv: &'static str, bn: &'static str) -> LayerSpec {
    layer(conv, bn, 1, 0, 1, false, WeightBinding::Standalone)
}

/// Expansion whose tensors arrive with the preceding projection lookup.
const fn expand_paired(conv: &'static str, bn: &'static str) -> LayerSpec {
    layer(conv, bn, 1, 0, 1, false, WeightBinding::SuppliedByPrevious)
}

/// 1x1 projection shortcut.
const fn projection(conv: &'static str, bn: &'static str, stride: usize) -> LayerSpec {
    layer(conv, bn, 1, 0, stride, false, WeightBinding::DualOutput)
}

/// 3x3 decoder convolution after an upsample/concat.
const fn decode(conv: &'static str, bn: &'static str) -> LayerSpec {
    layer(conv, bn, 3, 1, 1, true, WeightBinding::Standalone)
}

pub const REFERENCE_LAYER_COUNT: usize = 59;

/// Layer table of the trained network, in weight-binding order.
pub static REFERENCE_LAYERS: [LayerSpec; REFERENCE_LAYER_COUNT] = [
    // 0: stem
    layer("conv1_conv", "conv1_bn", 7, 3, 2, true, WeightBinding::Standalone),
    // 1..=10: conv2 (3 blocks)
    reduce("conv2_block1_1_conv", "conv2_block1_1_bn", 1),
    spatial("conv2_block1_2_conv", "conv2_block1_2_bn"),
    projection("conv2_block1_0_conv", "conv2_block1_0_bn", 1),
    expand_paired("conv2_block1_3_conv", "conv2_block1_3_bn"),
    reduce("conv2_block2_1_conv", "conv2_block2_1_bn", 1),
    spatial("conv2_block2_2_conv", "conv2_block2_2_bn"),
    expand("conv2_block2_3_conv", "conv2_block2_3_bn"),
    reduce("conv2_block3_1_conv", "conv2_block3_1_bn", 1),
    spatial("conv2_block3_2_conv", "conv2_block3_2_bn"),
    expand("conv2_block3_3_conv", "conv2_block3_3_bn"),
    // 11..=23: conv3 (4 blocks)
    reduce("conv3_block1_1_conv", "conv3_block1_1_bn", 2),
    spatial("conv3_block1_2_conv", "conv3_block1_2_bn"),
    projection("conv3_block1_0_conv", "conv3_block1_0_bn", 2),
    expand_paired("conv3_block1_3_conv", "conv3_block1_3_bn"),
    reduce("conv3_block2_1_conv", "conv3_block2_1_bn", 1),
    spatial("conv3_block2_2_conv", "conv3_block2_2_bn"),
    expand("conv3_block2_3_conv", "conv3_block2_3_bn"),
    reduce("conv3_block3_1_conv", "conv3_block3_1_bn", 1),
    spatial("conv3_block3_2_conv", "conv3_block3_2_bn"),
    expand("conv3_block3_3_conv", "conv3_block3_3_bn"),
    reduce("conv3_block4_1_conv", "conv3_block4_1_bn", 1),
    spatial("conv3_block4_2_conv", "conv3_block4_2_bn"),
    expand("conv3_block4_3_conv", "conv3_block4_3_bn"),
    // 24..=42: conv4 (6 blocks)
    reduce("conv4_block1_1_conv", "conv4_block1_1_bn", 2),
    spatial("conv4_block1_2_conv", "conv4_block1_2_bn"),
    projection("conv4_block1_0_conv", "conv4_block1_0_bn", 2),
    expand_paired("conv4_block1_3_conv", "conv4_block1_3_bn"),
    reduce("conv4_block2_1_conv", "conv4_block2_1_bn", 1),
    spatial("conv4_block2_2_conv", "conv4_block2_2_bn"),
    expand("conv4_block2_3_conv", "conv4_block2_3_bn"),
    reduce("conv4_block3_1_conv", "conv4_block3_1_bn", 1),
    spatial("conv4_block3_2_conv", "conv4_block3_2_bn"),
    expand("conv4_block3_3_conv", "conv4_block3_3_bn"),
    reduce("conv4_block4_1_conv", "conv4_block4_1_bn", 1),
    spatial("conv4_block4_2_conv", "conv4_block4_2_bn"),
    expand("conv4_block4_3_conv", "conv4_block4_3_bn"),
    reduce("conv4_block5_1_conv", "conv4_block5_1_bn", 1),
    spatial("conv4_block5_2_conv", "conv4_block5_2_bn"),
    expand("conv4_block5_3_conv", "conv4_block5_3_bn"),
    reduce("conv4_block6_1_conv", "conv4_block6_1_bn", 1),
    spatial("conv4_block6_2_conv", "conv4_block6_2_bn"),
    expand("conv4_block6_3_conv", "conv4_block6_3_bn"),
    // 43..=52: conv5 (3 blocks)
    reduce("conv5_block1_1_conv", "conv5_block1_1_bn", 2),
    spatial("conv5_block1_2_conv", "conv5_block1_2_bn"),
    projection("conv5_block1_0_conv", "conv5_block1_0_bn", 2),
    expand_paired("conv5_block1_3_conv", "conv5_block1_3_bn"),
    reduce("conv5_block2_1_conv", "conv5_block2_1_bn", 1),
    spatial("conv5_block2_2_conv", "conv5_block2_2_bn"),
    expand("conv5_block2_3_conv", "conv5_block2_3_bn"),
    reduce("conv5_block3_1_conv", "conv5_block3_1_bn", 1),
    spatial("conv5_block3_2_conv", "conv5_block3_2_bn"),
    expand("conv5_block3_3_conv", "conv5_block3_3_bn"),
    // 53..=56: decoder
    decode("conv2d", "batch_normalization"),
    decode("conv2d_1", "batch_normalization_1"),
    decode("conv2d_2", "batch_normalization_2"),
    decode("conv2d_3", "batch_normalization_3"),
    // 57..=58: head
    decode("conv2d_4", "batch_normalization_4"),
    LayerSpec {
        conv: "conv2d_5",
        bn: None,
        kernel: 1,
        padding: 0,
        stride: 1,
        activation: false,
        binding: WeightBinding::Standalone,
    },
];
